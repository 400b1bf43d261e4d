use std::time::Duration;

use ai_core::{Entity, EntityKind, Position, WorldSnapshot, WorldSource};
use botkernel_core::adapters::LoopbackNetwork;
use botkernel_core::capabilities::EventLog;
use botkernel_core::kernel::TaskEvent;
use botkernel_core::observability::{EventEmitter, SchedulerEvent};
use botkernel_core::state::{ActionSpec, DecomposeError, Decomposition};
use botkernel_core::{
    ActionKind, ActionPayload, AgentConfig, AgentState, Context, Dispatcher, TaskSpec, TaskStatus,
};
use tempfile::TempDir;

struct Arena(WorldSnapshot);

impl WorldSource for Arena {
    fn snapshot(&mut self) -> Option<WorldSnapshot> {
        Some(self.0.clone())
    }
}

fn fast_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.tick.interval_ms = 5;
    config
}

fn walk_then_sit(_: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    let walk = plan.action(ActionSpec::new(ActionPayload::new(ActionKind::MoveTo)));
    plan.action(ActionSpec::new(ActionPayload::new(ActionKind::Sit)).after(walk));
    Ok(())
}

#[tokio::test]
async fn loopback_completes_sequential_actions() {
    let mut config = fast_config();
    config.state_machine.default_behaviors = false;
    let mut kernel = Dispatcher::new(config, LoopbackNetwork::new(Duration::from_millis(1))).unwrap();

    kernel.submit_task(TaskSpec::new("rest", walk_then_sit)).unwrap();
    kernel.run(Some(40), std::future::pending()).await;

    assert_eq!(kernel.tasks().status(&"rest".into()), Some(TaskStatus::Completed));
    assert_eq!(kernel.stats().dispatched, 2);
    assert!(kernel.status().tasks.iter().any(|t| t.id.as_str() == "rest"));
}

#[tokio::test]
async fn monster_in_reach_is_engaged() {
    let mut config = fast_config();
    config.state_machine.initial = AgentState::Auto;
    let world = WorldSnapshot {
        hp: 100,
        max_hp: 100,
        entities: vec![Entity::new(7, EntityKind::Monster, Position::new(1, 0))],
        ..WorldSnapshot::default()
    };
    let mut kernel = Dispatcher::new(config, LoopbackNetwork::new(Duration::from_millis(1)))
        .unwrap()
        .with_world(Arena(world));

    kernel.run(Some(30), std::future::pending()).await;

    assert_eq!(kernel.state(), AgentState::Combat);
    assert_eq!(kernel.tasks().status(&"combat-1".into()), Some(TaskStatus::Completed));
    let attacked = kernel
        .queue()
        .history()
        .any(|a| a.payload.kind == ActionKind::Attack && a.payload.params["target"] == 7);
    assert!(attacked);
}

#[tokio::test]
async fn event_log_records_the_run() {
    let dir = TempDir::new().unwrap();
    let emitter = EventEmitter::new(dir.path().join("events.jsonl"));

    let mut config = fast_config();
    config.state_machine.default_behaviors = false;
    let mut kernel = Dispatcher::new(config, LoopbackNetwork::new(Duration::from_millis(1))).unwrap();
    kernel
        .capabilities_mut()
        .register(EventLog::new(emitter.clone()))
        .unwrap();

    kernel.submit_task(TaskSpec::new("rest", walk_then_sit)).unwrap();
    kernel.run(Some(40), std::future::pending()).await;

    let logged = emitter.read_recent(usize::MAX);
    assert!(logged.iter().any(|e| matches!(
        &e.event,
        SchedulerEvent::Task(TaskEvent { status: TaskStatus::Completed, .. })
    )));
    assert!(logged
        .iter()
        .any(|e| matches!(e.event, SchedulerEvent::ActionDispatched { .. })));
    assert!(logged.windows(2).all(|w| w[0].tick <= w[1].tick));
}
