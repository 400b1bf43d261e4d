//! Demo world - a canned encounter for `botkernel run --script demo`.
//!
//! One frame per tick: a monster shows up and trades blows, drops loot when it
//! dies, then a stronger one pushes the agent into an emergency before
//! wandering off.

use ai_core::{Entity, EntityKind, Position, WorldSnapshot, WorldSource};

const MAX_HP: u32 = 100;
const MAX_SP: u32 = 50;
const SPOT: Position = Position::new(1, 0);

#[derive(Debug)]
pub struct DemoWorld {
    frame: u64,
    hp: u32,
}

impl DemoWorld {
    pub fn new() -> Self {
        Self { frame: 0, hp: MAX_HP }
    }

    fn entities(&self) -> Vec<Entity> {
        match self.frame {
            10..=29 => vec![Entity::new(1001, EntityKind::Monster, SPOT)],
            30..=44 => vec![
                Entity {
                    dead: true,
                    ..Entity::new(1001, EntityKind::Monster, SPOT)
                },
                Entity::new(2001, EntityKind::Item, SPOT),
            ],
            60..=71 => vec![Entity::new(1002, EntityKind::Monster, SPOT)],
            _ => Vec::new(),
        }
    }

    fn damage(&self) -> u32 {
        match self.frame {
            10..=29 => 2,
            60..=71 => 7,
            _ => 0,
        }
    }
}

impl Default for DemoWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldSource for DemoWorld {
    fn snapshot(&mut self) -> Option<WorldSnapshot> {
        self.frame += 1;
        let damage = self.damage();
        self.hp = if damage > 0 {
            self.hp.saturating_sub(damage).max(1)
        } else {
            (self.hp + 2).min(MAX_HP)
        };

        Some(WorldSnapshot {
            position: Position::new(0, 0),
            hp: self.hp,
            max_hp: MAX_HP,
            sp: MAX_SP,
            max_sp: MAX_SP,
            dead: false,
            entities: self.entities(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_monster_drops_hp_into_emergency_range() {
        let mut world = DemoWorld::new();
        let frames: Vec<WorldSnapshot> = (0..80).filter_map(|_| world.snapshot()).collect();

        assert!(frames[5].entities.is_empty());
        assert_eq!(frames[15].nearby(EntityKind::Monster, 2.0).len(), 1);
        assert_eq!(frames[35].nearby(EntityKind::Item, 2.0).len(), 1);
        assert!(frames[35].nearby(EntityKind::Monster, 2.0).is_empty());

        let lowest = frames.iter().map(|f| f.hp_percent()).fold(f32::MAX, f32::min);
        assert!(lowest < 20.0);
        assert!(frames.iter().all(|f| !f.is_dead()));
    }
}
