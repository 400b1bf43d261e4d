#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Map cell coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance in cells.
    pub fn distance_to(self, other: Position) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dy = (self.y - other.y) as f32;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntityKind {
    Monster,
    Npc,
    Player,
    Item,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entity {
    pub id: u64,
    pub kind: EntityKind,
    pub position: Position,
    #[cfg_attr(feature = "serde", serde(default))]
    pub dead: bool,
}

impl Entity {
    pub fn new(id: u64, kind: EntityKind, position: Position) -> Self {
        Self {
            id,
            kind,
            position,
            dead: false,
        }
    }
}

/// Read-only view of the world as observed at the start of a tick.
///
/// The kernel never mutates a snapshot; a fresh one replaces it wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorldSnapshot {
    pub position: Position,
    pub hp: u32,
    pub max_hp: u32,
    pub sp: u32,
    pub max_sp: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub dead: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub entities: Vec<Entity>,
}

impl WorldSnapshot {
    pub fn hp_percent(&self) -> f32 {
        percent(self.hp, self.max_hp)
    }

    pub fn sp_percent(&self) -> f32 {
        percent(self.sp, self.max_sp)
    }

    pub fn is_dead(&self) -> bool {
        self.dead || (self.max_hp > 0 && self.hp == 0)
    }

    /// Live entities of `kind` within `range` cells, nearest first.
    pub fn nearby(&self, kind: EntityKind, range: f32) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self
            .entities
            .iter()
            .filter(|e| e.kind == kind && !e.dead)
            .filter(|e| self.position.distance_to(e.position) <= range)
            .collect();
        found.sort_by(|a, b| {
            let da = self.position.distance_to(a.position);
            let db = self.position.distance_to(b.position);
            da.total_cmp(&db).then(a.id.cmp(&b.id))
        });
        found
    }

    pub fn entity(&self, id: u64) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }
}

fn percent(value: u32, max: u32) -> f32 {
    if max == 0 {
        return 0.0;
    }
    (value as f32 / max as f32) * 100.0
}

/// Producer of world snapshots (the world/actor collaborator).
///
/// Returning `None` keeps the previous snapshot in place.
pub trait WorldSource: Send {
    fn snapshot(&mut self) -> Option<WorldSnapshot>;
}
