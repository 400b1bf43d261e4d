//! Dispatcher - binds the state machine, task manager, action queue and
//! network adapter into one cooperative tick loop.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use ai_core::{Tick, WorldSource};
use ai_fsm::{FsmError, MachineConfig, StateId};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::action::{ActionFailure, ActionId, ActionSettlement, ActionStatus};
use super::queue::ActionQueue;
use super::tasks::{TaskError, TaskManager};
use crate::adapters::Network;
use crate::capabilities::CapabilityRegistry;
use crate::config::AgentConfig;
use crate::context::Context;
use crate::inbox::{ActionHandle, Outcome};
use crate::observability::{KernelEvent, KernelStatus, SchedulerEvent};
use crate::state::{install_default_behaviors, AgentMachine, AgentState, TaskCommand, TaskCommands};
use crate::state::{TaskId, TaskSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub submit_errors: u64,
    pub results: u64,
    pub discarded: u64,
    pub command_errors: u64,
}

pub struct Dispatcher {
    config: AgentConfig,
    ctx: Context,
    machine: AgentMachine,
    commands: TaskCommands,
    tasks: TaskManager,
    queue: ActionQueue,
    network: Box<dyn Network>,
    world: Option<Box<dyn WorldSource>>,
    capabilities: CapabilityRegistry,
    in_flight: HashMap<ActionHandle, ActionId>,
    seen_transitions: u64,
    seen_guard_errors: u64,
    pending_events: Vec<KernelEvent>,
    recent: VecDeque<KernelEvent>,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Builds a kernel from configuration. The network adapter is attached to
    /// the context's result inbox here.
    pub fn new(config: AgentConfig, network: impl Network + 'static) -> Result<Self, FsmError> {
        let ctx = Context::new(config.tick.interval_ms, config.behavior.clone());

        let mut network: Box<dyn Network> = Box::new(network);
        network.attach(ctx.inbox().clone());

        let mut machine = AgentMachine::new(config.state_machine.initial).with_config(MachineConfig {
            history_limit: config.state_machine.history,
            ..MachineConfig::default()
        });
        if config.state_machine.default_behaviors {
            install_default_behaviors(&mut machine)?;
        }

        info!(
            initial = config.state_machine.initial.name(),
            interval_ms = config.tick.interval_ms,
            "Kernel ready"
        );

        Ok(Self {
            tasks: TaskManager::new(config.tasks.clone()),
            queue: ActionQueue::new(config.queue.clone()),
            ctx,
            machine,
            commands: TaskCommands::new(),
            network,
            world: None,
            capabilities: CapabilityRegistry::new(),
            in_flight: HashMap::new(),
            seen_transitions: 0,
            seen_guard_errors: 0,
            pending_events: Vec::new(),
            recent: VecDeque::new(),
            stats: DispatcherStats::default(),
            config,
        })
    }

    pub fn with_world(mut self, source: impl WorldSource + 'static) -> Self {
        self.world = Some(Box::new(source));
        self
    }

    /// Runs one tick and returns the active state afterwards.
    pub fn tick(&mut self) -> AgentState {
        let now = self.ctx.advance();
        self.stats.ticks += 1;

        if let Some(snapshot) = self.world.as_mut().and_then(|source| source.snapshot()) {
            self.ctx.replace_world(snapshot);
        }

        self.machine.tick(&self.ctx, &mut self.commands);
        self.collect_machine_events(now);
        self.apply_commands(now);

        self.tasks.tick(&self.ctx, &mut self.queue);

        self.retire_timed_out(now);
        self.dispatch_one(now);
        self.drain_results(now);
        self.absorb_settlements(now);
        self.collect_task_events(now);
        self.publish();

        self.machine.current()
    }

    /// Drives `tick` on a fixed interval until `ticks` have run or `shutdown`
    /// resolves.
    pub async fn run(&mut self, ticks: Option<u64>, shutdown: impl Future<Output = ()>) -> u64 {
        let period = Duration::from_millis(self.ctx.clock().interval_ms);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut ran = 0u64;
        loop {
            if ticks.is_some_and(|limit| ran >= limit) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                    ran += 1;
                }
                _ = &mut shutdown => {
                    info!(ticks = ran, "Shutdown requested");
                    break;
                }
            }
        }
        ran
    }

    fn dispatch_one(&mut self, now: Tick) {
        let Some(action) = self.queue.dequeue_ready(now) else {
            return;
        };

        match self.network.submit(&action) {
            Ok(handle) => {
                debug!(action = %action.id, %handle, "Dispatched action");
                self.stats.dispatched += 1;
                self.in_flight.insert(handle, action.id.clone());
                self.record(
                    now,
                    SchedulerEvent::ActionDispatched {
                        action: action.id,
                        handle,
                    },
                );
            }
            Err(e) => {
                warn!(action = %action.id, error = %e, "Submission failed");
                self.stats.submit_errors += 1;
                if let Err(e) = self.queue.ack_failure(&action.id, e.to_string(), now) {
                    warn!(action = %action.id, error = %e, "Could not record submission failure");
                }
            }
        }
    }

    /// Counts unanswered dispatches as failed attempts and forgets their
    /// handles, so a reply arriving afterwards is discarded.
    fn retire_timed_out(&mut self, now: Tick) {
        let timed_out = self.queue.time_out_running(now);
        if !timed_out.is_empty() {
            self.in_flight.retain(|_, action| !timed_out.contains(action));
        }
    }

    fn drain_results(&mut self, now: Tick) {
        for result in self.ctx.inbox().drain() {
            self.stats.results += 1;
            let live = self
                .in_flight
                .remove(&result.handle)
                .filter(|id| self.queue.status(id) == Some(ActionStatus::Running));

            let Some(id) = live else {
                warn!(handle = %result.handle, "Discarding result for an action that is no longer live");
                self.stats.discarded += 1;
                self.record(now, SchedulerEvent::ResultDiscarded { handle: result.handle });
                continue;
            };

            let acked = match result.outcome {
                Outcome::Success(payload) => self.queue.ack_success(&id, payload, now),
                Outcome::Retryable(reason) => self.queue.ack_failure(&id, reason, now),
                Outcome::Fatal(reason) => self.queue.fail_permanently(&id, reason, now),
            };
            match acked {
                Ok(outcome) => debug!(action = %id, ?outcome, "Result applied"),
                Err(e) => warn!(action = %id, error = %e, "Could not apply result"),
            }
        }
    }

    /// Forwards queue settlements to the task manager and records them.
    fn absorb_settlements(&mut self, now: Tick) {
        for settlement in self.tasks.absorb(&mut self.queue) {
            let ActionSettlement {
                id, status, failure, ..
            } = settlement;
            self.in_flight.retain(|_, action| *action != id);
            if failure == Some(ActionFailure::Evicted) {
                warn!(action = %id, "Action evicted from a full queue");
                self.record(now, SchedulerEvent::QueueOverflow { evicted: id.clone() });
            }
            self.record(
                now,
                SchedulerEvent::ActionSettled {
                    action: id,
                    status,
                    failure,
                },
            );
        }
    }

    fn apply_commands(&mut self, now: Tick) {
        for command in self.commands.drain() {
            let result = match command {
                TaskCommand::Submit(spec) => self.tasks.submit(spec, now).map(drop),
                TaskCommand::Cancel(id) => self.tasks.cancel(&id, now, &mut self.queue).map(drop),
                TaskCommand::CancelTagged(tag) => {
                    self.tasks.cancel_tagged(&tag, now, &mut self.queue);
                    Ok(())
                }
                TaskCommand::Pause(id) => self.tasks.pause(&id, now, &mut self.queue).map(drop),
                TaskCommand::Resume(id) => self.tasks.resume(&id, now, &mut self.queue).map(drop),
            };
            if let Err(e) = result {
                warn!(error = %e, "Task command from state hook failed");
                self.stats.command_errors += 1;
            }
        }
    }

    fn collect_machine_events(&mut self, now: Tick) {
        let transitions = self.machine.transition_count();
        let fresh = transitions.saturating_sub(self.seen_transitions) as usize;
        self.seen_transitions = transitions;
        let mut changes: Vec<SchedulerEvent> = self
            .machine
            .history()
            .rev()
            .take(fresh)
            .map(|change| SchedulerEvent::StateChanged {
                from: change.from,
                to: change.to,
                via: change.via.as_ref().map(|v| v.to_string()),
            })
            .collect();
        changes.reverse();

        let errors = self.machine.guard_error_count();
        let fresh = errors.saturating_sub(self.seen_guard_errors) as usize;
        self.seen_guard_errors = errors;
        let mut failures: Vec<SchedulerEvent> = self
            .machine
            .guard_failures()
            .rev()
            .take(fresh)
            .map(|failure| SchedulerEvent::GuardFailed {
                from: failure.from,
                to: failure.to,
                transition: failure.transition.to_string(),
                error: failure.error.to_string(),
            })
            .collect();
        failures.reverse();

        for event in failures.into_iter().chain(changes) {
            self.record(now, event);
        }
    }

    fn collect_task_events(&mut self, now: Tick) {
        for event in self.tasks.drain_events() {
            self.record(now, SchedulerEvent::Task(event));
        }
    }

    fn record(&mut self, tick: Tick, event: SchedulerEvent) {
        self.pending_events.push(KernelEvent::new(tick, event));
    }

    /// Hands buffered events to capabilities and the recent-events buffer.
    fn publish(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending_events);
        self.capabilities.dispatch(&events, &mut self.ctx);

        let limit = self.config.events.recent;
        self.recent.extend(events);
        while self.recent.len() > limit {
            self.recent.pop_front();
        }
    }

    /// Publishes whatever an out-of-tick command produced.
    fn flush(&mut self) {
        let now = self.ctx.now();
        self.collect_machine_events(now);
        self.apply_commands(now);
        self.absorb_settlements(now);
        self.collect_task_events(now);
        self.publish();
    }

    pub fn submit_task(&mut self, spec: TaskSpec) -> Result<TaskId, TaskError> {
        let result = self.tasks.submit(spec, self.ctx.now());
        self.flush();
        result
    }

    pub fn pause_task(&mut self, id: &TaskId) -> Result<Vec<TaskId>, TaskError> {
        let result = self.tasks.pause(id, self.ctx.now(), &mut self.queue);
        self.flush();
        result
    }

    pub fn resume_task(&mut self, id: &TaskId) -> Result<Vec<TaskId>, TaskError> {
        let result = self.tasks.resume(id, self.ctx.now(), &mut self.queue);
        self.flush();
        result
    }

    pub fn cancel_task(&mut self, id: &TaskId) -> Result<Vec<TaskId>, TaskError> {
        let result = self.tasks.cancel(id, self.ctx.now(), &mut self.queue);
        self.flush();
        result
    }

    /// Switches state without guards; entry and exit hooks still run.
    pub fn force_state(&mut self, state: AgentState) -> Result<bool, FsmError> {
        let changed = self.machine.force(state, &self.ctx, &mut self.commands)?;
        self.flush();
        Ok(changed)
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<KernelEvent> {
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).cloned().collect()
    }

    pub fn status(&self) -> KernelStatus {
        let now = self.ctx.now();
        KernelStatus {
            state: self.machine.current(),
            tick: now,
            ticks_in_state: self.machine.ticks_in_state(),
            tasks: self.tasks.task_tree(),
            queue_depth: self.queue.depth(),
            in_flight: self.queue.in_flight(),
            queue_paused: self.queue.is_paused(),
            next_action: self.queue.peek_ready(now).map(|a| a.id.clone()),
            dispatcher: self.stats,
            queue: self.queue.stats(),
            task_stats: self.tasks.stats(),
            recent_events: self.recent_events(self.config.events.recent),
        }
    }

    pub fn state(&self) -> AgentState {
        self.machine.current()
    }

    pub fn now(&self) -> Tick {
        self.ctx.now()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Signals, blackboard and behavior toggles for the next tick.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn machine(&self) -> &AgentMachine {
        &self.machine
    }

    /// For registering extra transitions and hooks.
    pub fn machine_mut(&mut self) -> &mut AgentMachine {
        &mut self.machine
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.queue
    }

    pub fn capabilities_mut(&mut self) -> &mut CapabilityRegistry {
        &mut self.capabilities
    }

    pub fn network_mut(&mut self) -> &mut dyn Network {
        self.network.as_mut()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.machine.current())
            .field("tick", &self.ctx.now())
            .field("tasks", &self.tasks)
            .field("queue_depth", &self.queue.depth())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedNetwork;
    use crate::kernel::{ActionKind, ActionPayload};
    use crate::state::{ActionSpec, DecomposeError, Decomposition};

    fn bare() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.state_machine.default_behaviors = false;
        config
    }

    fn chat(_: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
        plan.action(ActionSpec::new(ActionPayload::new(ActionKind::SendChat)));
        Ok(())
    }

    #[test]
    fn one_action_per_tick_and_results_settle_tasks() {
        let mut kernel = Dispatcher::new(bare(), ScriptedNetwork::new()).unwrap();
        kernel.submit_task(TaskSpec::new("greet", chat)).unwrap();

        kernel.tick(); // ready
        kernel.tick(); // running, action dispatched and answered
        assert_eq!(kernel.stats().dispatched, 1);
        assert_eq!(kernel.queue().stats().succeeded, 1);

        kernel.tick();
        assert_eq!(kernel.tasks().status(&"greet".into()), Some(crate::TaskStatus::Completed));
        assert!(kernel
            .recent_events(64)
            .iter()
            .any(|e| matches!(e.event, SchedulerEvent::ActionDispatched { .. })));
    }

    #[test]
    fn late_results_for_cancelled_actions_are_discarded() {
        let mut kernel = Dispatcher::new(bare(), ScriptedNetwork::silent()).unwrap();
        kernel.submit_task(TaskSpec::new("greet", chat)).unwrap();
        kernel.tick();
        kernel.tick();

        let cancelled = kernel.cancel_task(&"greet".into()).unwrap();
        assert_eq!(cancelled, vec![TaskId::from("greet")]);
        assert_eq!(kernel.queue().status(&"greet#1.1".into()), Some(ActionStatus::Cancelled));

        // The handle mapping went with the settlement; the late answer is dropped.
        kernel.ctx.inbox().post(ActionHandle(1), Outcome::Success(serde_json::Value::Null));
        kernel.tick();
        assert_eq!(kernel.stats().discarded, 1);
        assert_eq!(kernel.queue().stats().succeeded, 0);
    }

    #[test]
    fn unanswered_dispatch_times_out_and_its_handle_goes_stale() {
        let mut config = bare();
        config.queue.execution_timeout_ticks = 3;
        let mut kernel = Dispatcher::new(config, ScriptedNetwork::silent()).unwrap();
        kernel.submit_task(TaskSpec::new("greet", chat)).unwrap();

        for _ in 0..10 {
            kernel.tick();
            if kernel.queue().stats().timed_out > 0 {
                break;
            }
        }
        assert_eq!(kernel.queue().stats().timed_out, 1);
        assert!(kernel.in_flight.is_empty());
        assert_eq!(kernel.queue().status(&"greet#1.1".into()), Some(ActionStatus::Pending));

        // The first handle no longer maps to the re-dispatched action.
        kernel.ctx.inbox().post(ActionHandle(1), Outcome::Success(serde_json::Value::Null));
        kernel.tick();
        assert_eq!(kernel.stats().discarded, 1);
        assert_eq!(kernel.queue().stats().succeeded, 0);
        assert_eq!(kernel.queue().status(&"greet#1.1".into()), Some(ActionStatus::Running));
    }

    #[test]
    fn submission_errors_are_retryable() {
        let mut kernel = Dispatcher::new(bare(), ScriptedNetwork::new().fail_submissions(1)).unwrap();
        kernel.submit_task(TaskSpec::new("greet", chat)).unwrap();
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.stats().submit_errors, 1);
        assert_eq!(kernel.queue().status(&"greet#1.1".into()), Some(ActionStatus::Pending));
    }

    #[test]
    fn default_behaviors_follow_interface_signals() {
        let mut kernel = Dispatcher::new(AgentConfig::default(), ScriptedNetwork::new()).unwrap();
        kernel.context_mut().set_flag(crate::state::behaviors::START_REQUESTED, true);
        assert_eq!(kernel.tick(), AgentState::Manual);

        assert!(kernel.force_state(AgentState::Auto).unwrap());
        let status = kernel.status();
        assert_eq!(status.state, AgentState::Auto);
        assert!(status
            .recent_events
            .iter()
            .any(|e| matches!(e.event, SchedulerEvent::StateChanged { to: AgentState::Auto, via: None, .. })));
    }
}
