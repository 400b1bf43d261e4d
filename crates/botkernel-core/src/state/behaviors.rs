//! Built-in transition table and state hooks for an autonomous hunter.
//!
//! Guards only read the world snapshot, the behavior toggles and two
//! interface signals. Hooks never touch the task manager directly; they fill a
//! [`TaskCommands`] buffer that the dispatcher applies after the machine tick.

use ai_core::{EntityKind, Position, WorldSnapshot};
use ai_fsm::{FsmError, GuardError, StateMachine, Transition};
use serde_json::json;

use super::catalog::{priority, AgentState};
use super::task::{ActionSpec, DecomposeError, Decomposition, TaskId, TaskSpec};
use crate::config::BehaviorConfig;
use crate::context::Context;
use crate::kernel::{ActionKind, ActionPayload};

/// Flag set by the interface to leave `off`.
pub const START_REQUESTED: &str = "start_requested";
/// Flag toggling between `manual` and `auto`.
pub const AUTO_ENABLED: &str = "auto_enabled";

pub const COMBAT_TAG: &str = "combat";
pub const EMERGENCY_TAG: &str = "emergency";
pub const HEALING_TAG: &str = "healing";
pub const LOOT_TAG: &str = "loot";

/// Task manager command queued by a state hook.
#[derive(Debug)]
pub enum TaskCommand {
    Submit(TaskSpec),
    Cancel(TaskId),
    CancelTagged(String),
    Pause(TaskId),
    Resume(TaskId),
}

/// Effect sink handed to state hooks.
#[derive(Debug, Default)]
pub struct TaskCommands {
    commands: Vec<TaskCommand>,
}

impl TaskCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, spec: TaskSpec) {
        self.commands.push(TaskCommand::Submit(spec));
    }

    pub fn cancel(&mut self, id: impl Into<TaskId>) {
        self.commands.push(TaskCommand::Cancel(id.into()));
    }

    pub fn cancel_tagged(&mut self, tag: impl Into<String>) {
        self.commands.push(TaskCommand::CancelTagged(tag.into()));
    }

    pub fn pause(&mut self, id: impl Into<TaskId>) {
        self.commands.push(TaskCommand::Pause(id.into()));
    }

    pub fn resume(&mut self, id: impl Into<TaskId>) {
        self.commands.push(TaskCommand::Resume(id.into()));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn drain(&mut self) -> Vec<TaskCommand> {
        std::mem::take(&mut self.commands)
    }
}

pub type AgentMachine = StateMachine<AgentState, Context, TaskCommands>;

fn engage_range(behavior: &BehaviorConfig) -> f32 {
    behavior.attack_distance + 3.0
}

fn disengage_range(behavior: &BehaviorConfig) -> f32 {
    behavior.attack_distance + 10.0
}

/// HP is only meaningful once the world has reported a maximum.
fn hp_known(world: &WorldSnapshot) -> bool {
    world.max_hp > 0
}

fn in_emergency(ctx: &Context) -> bool {
    let world = ctx.world();
    hp_known(world) && !world.is_dead() && world.hp_percent() < ctx.behavior.emergency_hp_percent
}

fn target_in_reach(ctx: &Context) -> bool {
    let world = ctx.world();
    !world.nearby(EntityKind::Monster, engage_range(&ctx.behavior)).is_empty()
}

fn ok(value: bool) -> Result<bool, GuardError> {
    Ok(value)
}

/// Registers the full state catalog, the default transitions and the hooks
/// that turn state changes into tasks.
pub fn install_default_behaviors(machine: &mut AgentMachine) -> Result<(), FsmError> {
    use AgentState::*;

    machine.register_states(AgentState::ALL);

    // Interface-driven roots.
    machine.add_transition(
        Transition::new(Off, Manual, |ctx: &Context| ok(ctx.flag(START_REQUESTED).unwrap_or(false)))
            .with_priority(priority::HIGH),
    )?;
    machine.add_transition(
        Transition::new(Manual, Off, |ctx: &Context| ok(ctx.flag(START_REQUESTED) == Some(false)))
            .with_priority(priority::HIGH),
    )?;
    machine.add_transition(
        Transition::new(Manual, Auto, |ctx: &Context| ok(ctx.flag(AUTO_ENABLED).unwrap_or(false)))
            .with_priority(priority::HIGH),
    )?;

    // Inherited by every automated mode.
    machine.add_transition(
        Transition::new(Auto, Dead, |ctx: &Context| ok(ctx.world().is_dead()))
            .named("died")
            .with_priority(priority::EMERGENCY),
    )?;
    machine.add_transition(
        Transition::new(Auto, Emergency, |ctx: &Context| ok(in_emergency(ctx)))
            .named("low-hp")
            .with_priority(priority::EMERGENCY)
            .not_inherited_by(Healing),
    )?;
    machine.add_transition(
        Transition::new(Auto, Manual, |ctx: &Context| ok(ctx.flag(AUTO_ENABLED) == Some(false)))
            .named("auto-disabled")
            .with_priority(priority::HIGH),
    )?;
    machine.add_transition(
        Transition::new(Auto, Combat, |ctx: &Context| {
            let world = ctx.world();
            ok(ctx.behavior.attack_auto
                && hp_known(world)
                && !world.is_dead()
                && !in_emergency(ctx)
                && target_in_reach(ctx))
        })
        .named("target-in-reach")
        .with_priority(priority::HIGH),
    )?;
    machine.add_transition(
        Transition::new(Auto, Looting, |ctx: &Context| {
            let world = ctx.world();
            let range = engage_range(&ctx.behavior);
            ok(ctx.behavior.auto_loot
                && !world.is_dead()
                && !target_in_reach(ctx)
                && !world.nearby(EntityKind::Item, range).is_empty())
        })
        .named("loot-nearby")
        .with_priority(priority::NORMAL),
    )?;

    // Own transitions back to auto.
    machine.add_transition(
        Transition::new(Combat, Auto, |ctx: &Context| {
            let range = disengage_range(&ctx.behavior);
            ok(ctx.world().nearby(EntityKind::Monster, range).is_empty())
        })
        .named("no-target")
        .with_priority(priority::NORMAL),
    )?;
    machine.add_transition(
        Transition::new(Looting, Auto, |ctx: &Context| {
            let range = engage_range(&ctx.behavior);
            ok(ctx.world().nearby(EntityKind::Item, range).is_empty())
        })
        .named("looted")
        .with_priority(priority::NORMAL),
    )?;
    machine.add_transition(
        Transition::new(Emergency, Healing, |ctx: &Context| {
            let safe = ctx.behavior.safe_distance;
            ok(ctx.world().nearby(EntityKind::Monster, safe).is_empty())
        })
        .named("escaped")
        .with_priority(priority::HIGH),
    )?;
    // Healing starts at low hp; only a returning threat sends it back.
    machine.add_transition(
        Transition::new(Healing, Emergency, |ctx: &Context| {
            let safe = ctx.behavior.safe_distance;
            ok(in_emergency(ctx) && !ctx.world().nearby(EntityKind::Monster, safe).is_empty())
        })
        .named("threatened")
        .with_priority(priority::EMERGENCY),
    )?;
    machine.add_transition(
        Transition::new(Healing, Auto, |ctx: &Context| {
            let world = ctx.world();
            let sp_ok = world.max_sp == 0 || world.sp_percent() >= ctx.behavior.healed_sp_percent;
            ok(world.hp_percent() >= ctx.behavior.healed_hp_percent && sp_ok)
        })
        .named("recovered")
        .with_priority(priority::NORMAL),
    )?;
    machine.add_transition(
        Transition::new(Dead, Auto, |ctx: &Context| ok(!ctx.world().is_dead()))
            .named("respawned")
            .with_priority(priority::EMERGENCY),
    )?;

    machine.on_enter(Combat, |ctx: &Context, tasks: &mut TaskCommands| {
        tasks.submit(
            TaskSpec::new(format!("combat-{}", ctx.now()), engage)
                .named("engage")
                .tagged(COMBAT_TAG)
                .with_priority(priority::HIGH)
                .with_timeout(100),
        );
    })?;
    machine.on_exit(Combat, |_: &Context, tasks: &mut TaskCommands| {
        tasks.cancel_tagged(COMBAT_TAG);
    })?;

    machine.on_enter(Looting, |ctx: &Context, tasks: &mut TaskCommands| {
        tasks.submit(
            TaskSpec::new(format!("loot-{}", ctx.now()), loot)
                .named("loot")
                .tagged(LOOT_TAG)
                .with_priority(priority::NORMAL)
                .with_timeout(50),
        );
    })?;
    machine.on_exit(Looting, |_: &Context, tasks: &mut TaskCommands| {
        tasks.cancel_tagged(LOOT_TAG);
    })?;

    machine.on_enter(Emergency, |ctx: &Context, tasks: &mut TaskCommands| {
        tasks.cancel_tagged(COMBAT_TAG);
        tasks.submit(
            TaskSpec::new(format!("escape-{}", ctx.now()), escape)
                .named("escape")
                .tagged(EMERGENCY_TAG)
                .with_priority(priority::EMERGENCY)
                .with_timeout(30),
        );
    })?;
    machine.on_exit(Emergency, |_: &Context, tasks: &mut TaskCommands| {
        tasks.cancel_tagged(EMERGENCY_TAG);
    })?;

    machine.on_enter(Healing, |ctx: &Context, tasks: &mut TaskCommands| {
        tasks.submit(
            TaskSpec::new(format!("recover-{}", ctx.now()), recover)
                .named("recover")
                .tagged(HEALING_TAG)
                .with_priority(priority::HIGH),
        );
    })?;
    machine.on_exit(Healing, |ctx: &Context, tasks: &mut TaskCommands| {
        tasks.cancel_tagged(HEALING_TAG);
        if ctx.behavior.sit_auto {
            tasks.submit(
                TaskSpec::new(format!("stand-{}", ctx.now()), stand)
                    .named("stand")
                    .with_priority(priority::NORMAL),
            );
        }
    })?;

    machine.on_enter(Dead, |_: &Context, tasks: &mut TaskCommands| {
        for tag in [COMBAT_TAG, LOOT_TAG, EMERGENCY_TAG, HEALING_TAG] {
            tasks.cancel_tagged(tag);
        }
    })?;

    Ok(())
}

fn move_to(position: Position) -> ActionPayload {
    ActionPayload::with_params(ActionKind::MoveTo, json!({ "x": position.x, "y": position.y }))
}

/// Walk into reach of the nearest monster if needed, then attack it.
fn engage(ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    let world = ctx.world();
    let reach = ctx.behavior.attack_distance;
    let target = world
        .nearby(EntityKind::Monster, engage_range(&ctx.behavior))
        .into_iter()
        .next()
        .ok_or_else(|| DecomposeError("no monster in reach".into()))?;

    let attack = ActionSpec::new(ActionPayload::with_params(
        ActionKind::Attack,
        json!({ "target": target.id }),
    ))
    .with_max_attempts(3);

    if world.position.distance_to(target.position) > reach {
        let approach = plan.action(ActionSpec::new(move_to(target.position)).expires_after(20));
        plan.action(attack.after(approach));
    } else {
        plan.action(attack);
    }
    Ok(())
}

fn loot(ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    let world = ctx.world();
    let item = world
        .nearby(EntityKind::Item, engage_range(&ctx.behavior))
        .into_iter()
        .next()
        .ok_or_else(|| DecomposeError("nothing to loot".into()))?;

    let approach = plan.action(ActionSpec::new(move_to(item.position)));
    plan.action(
        ActionSpec::new(ActionPayload::with_params(
            ActionKind::PickItem,
            json!({ "item": item.id }),
        ))
        .after(approach),
    );
    Ok(())
}

/// Teleport away when allowed, otherwise run directly away from the nearest
/// threat.
fn escape(ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    if ctx.behavior.teleport_auto {
        plan.action(
            ActionSpec::new(ActionPayload::with_params(
                ActionKind::Teleport,
                json!({ "mode": "random" }),
            ))
            .with_priority(priority::EMERGENCY),
        );
        return Ok(());
    }

    let world = ctx.world();
    let Some(threat) = world.nearby(EntityKind::Monster, f32::MAX).into_iter().next() else {
        plan.action(ActionSpec::new(ActionPayload::new(ActionKind::Wait)));
        return Ok(());
    };

    let (dx, dy) = (
        (world.position.x - threat.position.x) as f32,
        (world.position.y - threat.position.y) as f32,
    );
    let len = (dx * dx + dy * dy).sqrt().max(1.0);
    let step = ctx.behavior.safe_distance + 1.0;
    let safe = Position::new(
        world.position.x + (dx / len * step).round() as i32,
        world.position.y + (dy / len * step).round() as i32,
    );
    plan.action(ActionSpec::new(move_to(safe)).with_priority(priority::EMERGENCY));
    Ok(())
}

fn recover(ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    let world = ctx.world();
    if ctx.behavior.heal_auto && world.hp_percent() < 50.0 {
        plan.action(ActionSpec::new(ActionPayload::with_params(
            ActionKind::UseItem,
            json!({ "item": "potion" }),
        )));
    }
    if ctx.behavior.sit_auto {
        plan.action(ActionSpec::new(ActionPayload::new(ActionKind::Sit)));
    }
    Ok(())
}

fn stand(_: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    plan.action(ActionSpec::new(ActionPayload::new(ActionKind::Stand)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_core::Entity;

    fn machine() -> AgentMachine {
        let mut machine = AgentMachine::new(AgentState::Off);
        install_default_behaviors(&mut machine).unwrap();
        machine
    }

    fn healthy(hp: u32) -> WorldSnapshot {
        WorldSnapshot {
            position: Position::new(0, 0),
            hp,
            max_hp: 100,
            sp: 100,
            max_sp: 100,
            ..WorldSnapshot::default()
        }
    }

    fn with_monster(mut world: WorldSnapshot, x: i32) -> WorldSnapshot {
        world
            .entities
            .push(Entity::new(7, EntityKind::Monster, Position::new(x, 0)));
        world
    }

    #[test]
    fn interface_signals_walk_the_roots() {
        let mut m = machine();
        let mut ctx = Context::default();
        let mut tasks = TaskCommands::new();

        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Off);
        ctx.set_flag(START_REQUESTED, true);
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Manual);
        ctx.set_flag(AUTO_ENABLED, true);
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Auto);

        // Unknown vitals never count as an emergency.
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Auto);
        assert!(tasks.is_empty());
    }

    #[test]
    fn combat_submits_then_cancels_engage() {
        let mut m = machine();
        let mut ctx = Context::default();
        let mut tasks = TaskCommands::new();
        m.force(AgentState::Auto, &ctx, &mut tasks).unwrap();

        ctx.replace_world(with_monster(healthy(100), 3));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Combat);
        assert!(matches!(tasks.drain().as_slice(), [TaskCommand::Submit(spec)] if spec.tag.as_deref() == Some(COMBAT_TAG)));

        ctx.replace_world(healthy(100));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Auto);
        assert!(matches!(tasks.drain().as_slice(), [TaskCommand::CancelTagged(tag)] if tag == COMBAT_TAG));
    }

    #[test]
    fn low_hp_preempts_combat_and_recovery_returns_to_auto() {
        let mut m = machine();
        let mut ctx = Context::default();
        let mut tasks = TaskCommands::new();
        m.force(AgentState::Combat, &ctx, &mut tasks).unwrap();

        ctx.replace_world(with_monster(healthy(10), 2));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Emergency);

        ctx.replace_world(healthy(10));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Healing);

        ctx.replace_world(healthy(60));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Healing);

        ctx.replace_world(healthy(85));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Auto);
    }

    #[test]
    fn healing_at_low_hp_holds_until_threatened() {
        let mut m = machine();
        let mut ctx = Context::default();
        let mut tasks = TaskCommands::new();
        m.force(AgentState::Emergency, &ctx, &mut tasks).unwrap();

        ctx.replace_world(healthy(10));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Healing);
        let changes = m.transition_count();
        for _ in 0..5 {
            assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Healing);
        }
        assert_eq!(m.transition_count(), changes);

        ctx.replace_world(with_monster(healthy(10), 2));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Emergency);
    }

    #[test]
    fn death_beats_everything_and_respawn_resumes() {
        let mut m = machine();
        let mut ctx = Context::default();
        let mut tasks = TaskCommands::new();
        m.force(AgentState::Healing, &ctx, &mut tasks).unwrap();
        tasks.drain();

        ctx.replace_world(WorldSnapshot {
            dead: true,
            ..healthy(0)
        });
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Dead);
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Dead);

        ctx.replace_world(healthy(100));
        assert_eq!(m.tick(&ctx, &mut tasks), AgentState::Auto);
    }

    #[test]
    fn engage_moves_before_attacking_out_of_reach() {
        let mut ctx = Context::default();
        ctx.replace_world(with_monster(healthy(100), 4));
        let mut plan = Decomposition::new("combat-1".into(), 0, 0);
        engage(&ctx, &mut plan).unwrap();

        let (actions, _) = plan.into_parts();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].payload.kind, ActionKind::MoveTo);
        assert_eq!(actions[1].payload.kind, ActionKind::Attack);
        assert_eq!(actions[1].after, vec![0]);
    }

    #[test]
    fn escape_runs_away_from_the_threat() {
        let mut ctx = Context::default();
        ctx.replace_world(with_monster(healthy(5), 2));
        let mut plan = Decomposition::new("escape-1".into(), 0, 0);
        escape(&ctx, &mut plan).unwrap();

        let (actions, _) = plan.into_parts();
        assert_eq!(actions[0].payload.kind, ActionKind::MoveTo);
        assert!(actions[0].payload.params["x"].as_i64().unwrap() < 0);
    }
}
