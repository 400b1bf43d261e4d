//! Task manager - a forest of goal-directed tasks with dependencies,
//! deadlines and retries.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use ai_core::Tick;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::action::{Action, ActionId, ActionSettlement, ActionStatus};
use super::queue::{ActionQueue, EnqueueOutcome};
use crate::config::TasksConfig;
use crate::context::Context;
use crate::state::graph::DependencyGraph;
use crate::state::task::{ChildPolicy, Decomposition, WorkState};
use crate::state::{FailureCause, Task, TaskId, TaskNode, TaskSpec, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("task {task} names unknown parent {parent}")]
    UnknownParent { task: TaskId, parent: TaskId },

    #[error("parent {parent} of task {task} has already finished")]
    ParentFinished { task: TaskId, parent: TaskId },

    #[error("dependency cycle: {}", display_path(.path))]
    DependencyCycle { path: Vec<TaskId> },

    #[error("task {task} depends on {dependency}, which can no longer complete")]
    DependencyFailed { task: TaskId, dependency: TaskId },

    #[error("task {0} has already finished")]
    AlreadyFinished(TaskId),

    #[error("task {0} is already running")]
    AlreadyStarted(TaskId),
}

fn display_path(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Lifecycle transition of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub tick: Tick,
    pub task: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retried: u64,
}

/// Poll result for one running task.
enum Progress {
    Pending,
    Done,
    Failed(FailureCause),
}

pub struct TaskManager {
    config: TasksConfig,
    tasks: HashMap<TaskId, Task>,
    graph: DependencyGraph,
    next_seq: u64,
    finished_roots: VecDeque<TaskId>,
    events: Vec<TaskEvent>,
    stats: TaskStats,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(TasksConfig::default())
    }
}

impl TaskManager {
    pub fn new(config: TasksConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            graph: DependencyGraph::new(),
            next_seq: 0,
            finished_roots: VecDeque::new(),
            events: Vec::new(),
            stats: TaskStats::default(),
        }
    }

    pub fn config(&self) -> &TasksConfig {
        &self.config
    }

    pub fn submit(&mut self, spec: TaskSpec, now: Tick) -> Result<TaskId, TaskError> {
        let id = spec.id.clone();
        self.submit_batch(vec![spec], now)?;
        Ok(id)
    }

    /// Validates and inserts a batch atomically. Tasks in the batch may
    /// depend on, or be children of, each other.
    pub fn submit_batch(&mut self, specs: Vec<TaskSpec>, now: Tick) -> Result<Vec<TaskId>, TaskError> {
        self.validate_batch(&specs)?;

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.insert(spec, now));
        }
        Ok(ids)
    }

    fn validate_batch(&self, specs: &[TaskSpec]) -> Result<(), TaskError> {
        let mut batch: HashSet<&TaskId> = HashSet::new();
        for spec in specs {
            if self.tasks.contains_key(&spec.id) || !batch.insert(&spec.id) {
                return Err(TaskError::DuplicateTask(spec.id.clone()));
            }
        }

        for spec in specs {
            if let Some(parent) = &spec.parent {
                match self.tasks.get(parent) {
                    Some(p) if p.is_finished() => {
                        return Err(TaskError::ParentFinished {
                            task: spec.id.clone(),
                            parent: parent.clone(),
                        })
                    }
                    Some(_) => {}
                    None if batch.contains(parent) && parent != &spec.id => {}
                    None => {
                        return Err(TaskError::UnknownParent {
                            task: spec.id.clone(),
                            parent: parent.clone(),
                        })
                    }
                }
            }

            for dependency in &spec.dependencies {
                match self.tasks.get(dependency) {
                    Some(dep) if matches!(dep.status, TaskStatus::Failed | TaskStatus::Cancelled) => {
                        return Err(TaskError::DependencyFailed {
                            task: spec.id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                    Some(_) => {}
                    None if batch.contains(dependency) => {}
                    None => {
                        return Err(TaskError::UnknownDependency {
                            task: spec.id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }

        let edges = specs
            .iter()
            .flat_map(|spec| spec.dependencies.iter().map(move |dep| (&spec.id, dep)));
        self.graph
            .check_edges(edges)
            .map_err(|path| TaskError::DependencyCycle { path })
    }

    fn insert(&mut self, spec: TaskSpec, now: Tick) -> TaskId {
        let TaskSpec {
            id,
            name,
            parent,
            dependencies,
            priority,
            timeout_ticks,
            max_retries,
            tag,
            behavior,
        } = spec;

        let dependencies: BTreeSet<TaskId> = dependencies.into_iter().collect();
        self.graph.add_node(id.clone());
        for dep in &dependencies {
            self.graph.add_edge(&id, dep);
        }

        let status = if self.all_completed(&dependencies) {
            TaskStatus::Created
        } else {
            TaskStatus::Blocked
        };

        let mut paused = false;
        if let Some(parent_id) = &parent {
            if let Some(p) = self.tasks.get_mut(parent_id) {
                p.children.push(id.clone());
                p.active_children.insert(id.clone());
                paused = p.status == TaskStatus::Paused;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let task = Task {
            id: id.clone(),
            name,
            parent,
            children: Vec::new(),
            dependencies,
            priority,
            status: if paused { TaskStatus::Paused } else { status },
            failure: None,
            tag,
            timeout_ticks: timeout_ticks.or(self.config.default_timeout_ticks),
            deadline: None,
            retries: 0,
            max_retries: max_retries.unwrap_or(self.config.default_max_retries),
            attempt: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            seq,
            child_seq: 0,
            paused_from: paused.then_some(status),
            paused_at: paused.then_some(now),
            actions: BTreeMap::new(),
            active_children: BTreeSet::new(),
            child_verdicts: BTreeMap::new(),
            behavior,
        };

        let emitted = task.status;
        debug!(task = %id, status = ?emitted, "Submitted task");
        self.tasks.insert(id.clone(), task);
        self.stats.submitted += 1;
        self.emit(&id, emitted, None, now);
        id
    }

    /// Adds `task -> dependency` after submission, with the same checks.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId, now: Tick) -> Result<(), TaskError> {
        let current = self
            .tasks
            .get(task)
            .ok_or_else(|| TaskError::UnknownTask(task.clone()))?;
        let dep = self
            .tasks
            .get(dependency)
            .ok_or_else(|| TaskError::UnknownDependency {
                task: task.clone(),
                dependency: dependency.clone(),
            })?;

        if current.is_finished() {
            return Err(TaskError::AlreadyFinished(task.clone()));
        }
        let effective = current.paused_from.unwrap_or(current.status);
        if effective == TaskStatus::Running {
            return Err(TaskError::AlreadyStarted(task.clone()));
        }
        if matches!(dep.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(TaskError::DependencyFailed {
                task: task.clone(),
                dependency: dependency.clone(),
            });
        }
        if let Some(path) = self.graph.cycle_with(task, dependency) {
            return Err(TaskError::DependencyCycle { path });
        }

        let dep_done = dep.status == TaskStatus::Completed;
        self.graph.add_edge(task, dependency);
        let Some(current) = self.tasks.get_mut(task) else {
            return Ok(());
        };
        current.dependencies.insert(dependency.clone());

        if !dep_done {
            if current.status == TaskStatus::Paused {
                current.paused_from = Some(TaskStatus::Blocked);
            } else if current.status != TaskStatus::Blocked {
                current.status = TaskStatus::Blocked;
                self.emit(task, TaskStatus::Blocked, None, now);
            }
        }
        Ok(())
    }

    /// Records a terminal action against its owning task's current attempt.
    ///
    /// Settlements for unknown, finished or superseded work are ignored.
    pub fn record_action_outcome(&mut self, settlement: &ActionSettlement) {
        let Some(owner) = &settlement.owner else {
            return;
        };
        let Some(task) = self.tasks.get_mut(owner) else {
            return;
        };
        if task.is_finished() {
            return;
        }
        let Some(state) = task.actions.get_mut(&settlement.id) else {
            return;
        };
        *state = match settlement.status {
            ActionStatus::Succeeded => WorkState::Done,
            ActionStatus::Failed | ActionStatus::Cancelled => WorkState::Failed,
            ActionStatus::Pending | ActionStatus::Running => return,
        };
    }

    /// Drains queue settlements into task bookkeeping and hands them back.
    pub fn absorb(&mut self, queue: &mut ActionQueue) -> Vec<ActionSettlement> {
        let settlements = queue.drain_settlements();
        for settlement in &settlements {
            self.record_action_outcome(settlement);
        }
        settlements
    }

    /// Advances every task by one tick.
    ///
    /// Phases, in order: deadlines, polling of running tasks, starting ready
    /// tasks, promoting waiting tasks.
    pub fn tick(&mut self, ctx: &Context, queue: &mut ActionQueue) {
        let now = ctx.now();
        self.check_deadlines(now, queue);
        self.poll_running(now, queue);
        self.start_ready(ctx, queue);
        self.promote_waiting(now);
        self.prune();
    }

    fn check_deadlines(&mut self, now: Tick, queue: &mut ActionQueue) {
        for id in self.ids_with_status(TaskStatus::Running) {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }
            if let Some(deadline) = task.deadline.filter(|d| now >= *d) {
                warn!(task = %id, deadline, "Task timed out");
                self.stats.timed_out += 1;
                self.finish(&id, TaskStatus::Failed, Some(FailureCause::Timeout { deadline }), now, queue);
            }
        }
    }

    fn poll_running(&mut self, now: Tick, queue: &mut ActionQueue) {
        for id in self.ids_with_status(TaskStatus::Running) {
            match self.progress(&id) {
                Progress::Pending => {}
                Progress::Done => self.finish(&id, TaskStatus::Completed, None, now, queue),
                Progress::Failed(cause) => {
                    let Some(task) = self.tasks.get(&id) else {
                        continue;
                    };
                    if task.retries < task.max_retries {
                        self.retry(&id, &cause, now, queue);
                    } else {
                        self.finish(&id, TaskStatus::Failed, Some(cause), now, queue);
                    }
                }
            }
        }
    }

    fn progress(&mut self, id: &TaskId) -> Progress {
        let Some(task) = self.tasks.get(id) else {
            return Progress::Pending;
        };
        if task.status != TaskStatus::Running {
            return Progress::Pending;
        }

        let children: Vec<(TaskId, TaskStatus, Option<FailureCause>)> = task
            .active_children
            .iter()
            .filter_map(|c| self.tasks.get(c))
            .map(|c| (c.id.clone(), c.status, c.failure.clone()))
            .collect();

        let Some(task) = self.tasks.get_mut(id) else {
            return Progress::Pending;
        };

        if let Some((action, _)) = task.actions.iter().find(|(_, s)| **s == WorkState::Failed) {
            return Progress::Failed(FailureCause::WorkFailed {
                action: action.clone(),
            });
        }
        let mut done = task.actions.values().all(|s| *s == WorkState::Done);

        for (child, status, cause) in children {
            match status {
                TaskStatus::Completed => {}
                TaskStatus::Failed => {
                    let verdict = match task.child_verdicts.get(&child) {
                        Some(v) => *v,
                        None => {
                            let cause = cause.unwrap_or(FailureCause::ChildFailed {
                                child: child.clone(),
                            });
                            let v = task.behavior.on_child_failed(&child, &cause);
                            debug!(task = %id, child = %child, verdict = ?v, "Child failure escalated");
                            task.child_verdicts.insert(child.clone(), v);
                            v
                        }
                    };
                    if verdict == ChildPolicy::Fail {
                        return Progress::Failed(FailureCause::ChildFailed { child });
                    }
                }
                TaskStatus::Cancelled => return Progress::Failed(FailureCause::ChildFailed { child }),
                _ => done = false,
            }
        }

        if done {
            Progress::Done
        } else {
            Progress::Pending
        }
    }

    /// Cancels outstanding work and sends the task back to `ready` for a
    /// fresh decomposition.
    fn retry(&mut self, id: &TaskId, cause: &FailureCause, now: Tick, queue: &mut ActionQueue) {
        let children: Vec<TaskId> = self
            .tasks
            .get(id)
            .map(|t| t.active_children.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            if self.tasks.get(&child).is_some_and(|c| !c.is_finished()) {
                self.finish(&child, TaskStatus::Cancelled, None, now, queue);
            }
        }
        queue.cancel_owned_by(id, now);
        queue.release_owner(id);

        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.retries += 1;
        task.status = TaskStatus::Ready;
        task.deadline = None;
        task.actions.clear();
        task.active_children.clear();
        task.child_verdicts.clear();
        info!(task = %id, retry = task.retries, max = task.max_retries, %cause, "Retrying task");
        self.stats.retried += 1;
        self.emit(id, TaskStatus::Ready, Some(cause.clone()), now);
    }

    fn start_ready(&mut self, ctx: &Context, queue: &mut ActionQueue) {
        let now = ctx.now();
        let mut ready: Vec<(Reverse<i32>, u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| (Reverse(t.priority), t.seq, t.id.clone()))
            .collect();
        ready.sort();

        let mut running_roots = self
            .tasks
            .values()
            .filter(|t| t.is_root() && t.status == TaskStatus::Running)
            .count();

        for (_, _, id) in ready {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Ready {
                continue;
            }
            let root = task.is_root();
            if !self.all_completed(&task.dependencies) {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = TaskStatus::Blocked;
                }
                self.emit(&id, TaskStatus::Blocked, None, now);
                continue;
            }
            if root && running_roots >= self.config.max_running_roots {
                continue;
            }
            if root {
                running_roots += 1;
            }
            self.start(&id, ctx, queue);
        }
    }

    fn start(&mut self, id: &TaskId, ctx: &Context, queue: &mut ActionQueue) {
        let now = ctx.now();
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.status = TaskStatus::Running;
        task.attempt += 1;
        task.started_at = Some(now);
        task.deadline = task.timeout_ticks.map(|t| now.saturating_add(t));
        let attempt = task.attempt;
        let priority = task.priority;

        let mut plan = Decomposition::new(id.clone(), priority, task.child_seq);
        let decomposed = task.behavior.decompose(ctx, &mut plan);
        task.child_seq = plan.next_child();
        info!(task = %id, attempt, deadline = ?task.deadline, "Task running");
        self.stats.started += 1;
        self.emit(id, TaskStatus::Running, None, now);

        if let Err(e) = decomposed {
            self.fail_decomposition(id, e.to_string(), now, queue);
            return;
        }

        let (actions, children) = plan.into_parts();

        for (n, spec) in actions.iter().enumerate() {
            if let Some(bad) = spec.after.iter().find(|i| **i >= n) {
                let message = format!("action {n} waits on action {bad}, which does not precede it");
                self.fail_decomposition(id, message, now, queue);
                return;
            }
        }

        if let Err(e) = self.submit_batch(children, now) {
            self.fail_decomposition(id, e.to_string(), now, queue);
            return;
        }

        let action_ids: Vec<ActionId> = (1..=actions.len())
            .map(|n| ActionId::new(format!("{id}#{attempt}.{n}")))
            .collect();
        let default_attempts = queue.config().default_max_attempts;

        for (spec, action_id) in actions.into_iter().zip(&action_ids) {
            let mut action = Action::new(
                action_id.clone(),
                spec.priority.unwrap_or(priority),
                spec.payload,
            )
            .with_max_attempts(spec.max_attempts.unwrap_or(default_attempts))
            .owned_by(id.clone());
            if let Some(ticks) = spec.deadline_ticks {
                action = action.with_deadline(now.saturating_add(ticks));
            }
            for index in spec.after {
                action = action.after(action_ids[index].clone());
            }

            if let Some(task) = self.tasks.get_mut(id) {
                task.actions.insert(action_id.clone(), WorkState::Pending);
            }

            match queue.enqueue(action, now) {
                Ok(EnqueueOutcome::Queued) => {}
                Ok(EnqueueOutcome::Overflow { evicted }) => {
                    warn!(task = %id, action = %action_id, %evicted, "Queue overflow while decomposing")
                }
                Err(e) => {
                    warn!(task = %id, action = %action_id, error = %e, "Could not enqueue action");
                    if let Some(task) = self.tasks.get_mut(id) {
                        task.actions.insert(action_id.clone(), WorkState::Failed);
                    }
                }
            }
        }
    }

    fn fail_decomposition(&mut self, id: &TaskId, message: String, now: Tick, queue: &mut ActionQueue) {
        warn!(task = %id, %message, "Decomposition failed");
        self.finish(
            id,
            TaskStatus::Failed,
            Some(FailureCause::Decomposition { message }),
            now,
            queue,
        );
    }

    fn promote_waiting(&mut self, now: Tick) {
        let mut waiting: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Created | TaskStatus::Blocked))
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        waiting.sort();

        for (_, id) in waiting {
            let ready = self
                .tasks
                .get(&id)
                .is_some_and(|t| self.all_completed(&t.dependencies));
            if ready {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = TaskStatus::Ready;
                }
                self.emit(&id, TaskStatus::Ready, None, now);
            }
        }
    }

    /// Moves a task to a terminal status.
    ///
    /// Owned children are cancelled leaves first, then the task's queued
    /// actions. On failure or cancellation every dependent fails in turn.
    fn finish(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        cause: Option<FailureCause>,
        now: Tick,
        queue: &mut ActionQueue,
    ) {
        let children: Vec<TaskId> = match self.tasks.get(id) {
            Some(task) if !task.is_finished() => task.children.clone(),
            _ => return,
        };
        for child in children.iter().rev() {
            if self.tasks.get(child).is_some_and(|c| !c.is_finished()) {
                self.finish(child, TaskStatus::Cancelled, None, now, queue);
            }
        }
        queue.cancel_owned_by(id, now);
        queue.release_owner(id);

        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.status = status;
        task.failure = cause.clone();
        task.finished_at = Some(now);
        task.deadline = None;
        task.paused_from = None;
        task.paused_at = None;
        let root = task.is_root();

        match status {
            TaskStatus::Completed => {
                self.stats.completed += 1;
                info!(task = %id, "Task completed");
            }
            TaskStatus::Cancelled => {
                self.stats.cancelled += 1;
                info!(task = %id, "Task cancelled");
            }
            _ => {
                self.stats.failed += 1;
                match &cause {
                    Some(cause) => info!(task = %id, %cause, "Task failed"),
                    None => info!(task = %id, "Task failed"),
                }
            }
        }
        self.emit(id, status, cause, now);
        if root {
            self.finished_roots.push_back(id.clone());
        }

        if status != TaskStatus::Completed {
            let dependents: Vec<TaskId> = self.graph.dependents(id).cloned().collect();
            for dependent in dependents {
                if self.tasks.get(&dependent).is_some_and(|t| !t.is_finished()) {
                    self.finish(
                        &dependent,
                        TaskStatus::Failed,
                        Some(FailureCause::DependencyUnresolvable { dependency: id.clone() }),
                        now,
                        queue,
                    );
                }
            }
        }
    }

    /// Cancels a task and its owned subtree, leaves first.
    ///
    /// Returns every task cancelled by the call, in cancellation order.
    pub fn cancel(&mut self, id: &TaskId, now: Tick, queue: &mut ActionQueue) -> Result<Vec<TaskId>, TaskError> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| TaskError::UnknownTask(id.clone()))?;
        if task.is_finished() {
            return Err(TaskError::AlreadyFinished(id.clone()));
        }

        let mark = self.events.len();
        self.finish(id, TaskStatus::Cancelled, None, now, queue);
        Ok(self.events[mark..]
            .iter()
            .filter(|e| e.status == TaskStatus::Cancelled)
            .map(|e| e.task.clone())
            .collect())
    }

    /// Cancels every unfinished task carrying `tag`.
    pub fn cancel_tagged(&mut self, tag: &str, now: Tick, queue: &mut ActionQueue) -> Vec<TaskId> {
        let mut tagged: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| !t.is_finished() && t.tag.as_deref() == Some(tag))
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        tagged.sort();

        let mut cancelled = Vec::new();
        for (_, id) in tagged {
            if let Ok(ids) = self.cancel(&id, now, queue) {
                cancelled.extend(ids);
            }
        }
        cancelled
    }

    /// Suspends a task and its unfinished subtree. Their queued actions are
    /// held back from dispatch; in-flight actions are left alone.
    pub fn pause(&mut self, id: &TaskId, now: Tick, queue: &mut ActionQueue) -> Result<Vec<TaskId>, TaskError> {
        self.check_live(id)?;
        let mut paused = Vec::new();
        for node in self.subtree(id) {
            let Some(task) = self.tasks.get_mut(&node) else {
                continue;
            };
            if task.is_finished() || task.status == TaskStatus::Paused {
                continue;
            }
            task.paused_from = Some(task.status);
            task.paused_at = Some(now);
            task.status = TaskStatus::Paused;
            paused.push(node);
        }
        for node in &paused {
            queue.hold_owner(node);
            self.emit(node, TaskStatus::Paused, None, now);
        }
        if !paused.is_empty() {
            info!(task = %id, count = paused.len(), "Paused task subtree");
        }
        Ok(paused)
    }

    /// Restores a paused subtree. Running deadlines are pushed back by the
    /// time spent paused.
    pub fn resume(&mut self, id: &TaskId, now: Tick, queue: &mut ActionQueue) -> Result<Vec<TaskId>, TaskError> {
        self.check_live(id)?;
        let mut resumed = Vec::new();
        for node in self.subtree(id) {
            let Some(task) = self.tasks.get_mut(&node) else {
                continue;
            };
            if task.status != TaskStatus::Paused {
                continue;
            }
            let status = task.paused_from.take().unwrap_or(TaskStatus::Blocked);
            let paused_for = task.paused_at.take().map_or(0, |at| now.saturating_sub(at));
            task.status = status;
            task.deadline = task.deadline.map(|d| d.saturating_add(paused_for));
            resumed.push((node, status));
        }
        for (node, status) in &resumed {
            queue.release_owner(node);
            self.emit(node, *status, None, now);
        }
        if !resumed.is_empty() {
            info!(task = %id, count = resumed.len(), "Resumed task subtree");
        }
        Ok(resumed.into_iter().map(|(node, _)| node).collect())
    }

    fn check_live(&self, id: &TaskId) -> Result<(), TaskError> {
        match self.tasks.get(id) {
            None => Err(TaskError::UnknownTask(id.clone())),
            Some(task) if task.is_finished() => Err(TaskError::AlreadyFinished(id.clone())),
            Some(_) => Ok(()),
        }
    }

    /// `id` followed by all owned descendants, depth-first.
    fn subtree(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(node) = stack.pop() {
            if let Some(task) = self.tasks.get(&node) {
                stack.extend(task.children.iter().rev().cloned());
            }
            out.push(node);
        }
        out
    }

    fn all_completed(&self, dependencies: &BTreeSet<TaskId>) -> bool {
        dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        let mut ids: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Drops the oldest finished root trees beyond the history limit. Trees
    /// still referenced by unfinished dependents are kept.
    fn prune(&mut self) {
        while self.finished_roots.len() > self.config.history {
            let Some(pos) = self
                .finished_roots
                .iter()
                .position(|root| self.can_prune(root))
            else {
                break;
            };
            let Some(root) = self.finished_roots.remove(pos) else {
                break;
            };
            for node in self.subtree(&root) {
                self.graph.remove_node(&node);
                self.tasks.remove(&node);
            }
            debug!(task = %root, "Pruned finished task tree");
        }
    }

    fn can_prune(&self, root: &TaskId) -> bool {
        self.subtree(root).iter().all(|node| {
            self.tasks.get(node).is_some_and(Task::is_finished)
                && self
                    .graph
                    .dependents(node)
                    .all(|d| self.tasks.get(d).map_or(true, Task::is_finished))
        })
    }

    fn emit(&mut self, task: &TaskId, status: TaskStatus, cause: Option<FailureCause>, tick: Tick) {
        self.events.push(TaskEvent {
            tick,
            task: task.clone(),
            status,
            cause,
        });
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Tasks in `status`, in submission order.
    pub fn find_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.ids_with_status(status)
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    /// Root tasks with their owned subtrees, in submission order.
    pub fn task_tree(&self) -> Vec<TaskNode> {
        let mut roots: Vec<&Task> = self.tasks.values().filter(|t| t.is_root()).collect();
        roots.sort_by_key(|t| t.seq);
        roots.into_iter().map(|t| self.node(t)).collect()
    }

    fn node(&self, task: &Task) -> TaskNode {
        TaskNode {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            priority: task.priority,
            failure: task.failure.clone(),
            dependencies: task.dependencies.iter().cloned().collect(),
            children: task
                .children
                .iter()
                .filter_map(|c| self.tasks.get(c))
                .map(|c| self.node(c))
                .collect(),
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.tasks.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::action::{ActionKind, ActionPayload};
    use crate::state::task::{ActionSpec, DecomposeError, Noop};

    fn wait() -> ActionSpec {
        ActionSpec::new(ActionPayload::new(ActionKind::Wait))
    }

    fn one_action(_: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
        plan.action(wait());
        Ok(())
    }

    struct Harness {
        ctx: Context,
        queue: ActionQueue,
        tasks: TaskManager,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ctx: Context::default(),
                queue: ActionQueue::default(),
                tasks: TaskManager::default(),
            }
        }

        fn tick(&mut self) {
            self.ctx.advance();
            self.tasks.tick(&self.ctx, &mut self.queue);
            self.tasks.absorb(&mut self.queue);
        }

        fn status(&self, id: &str) -> Option<TaskStatus> {
            self.tasks.status(&id.into())
        }
    }

    #[test]
    fn submit_rejects_bad_references_without_mutation() {
        let mut tasks = TaskManager::default();
        tasks.submit(TaskSpec::new("a", Noop), 0).unwrap();

        assert_eq!(
            tasks.submit(TaskSpec::new("a", Noop), 0),
            Err(TaskError::DuplicateTask("a".into()))
        );
        assert!(matches!(
            tasks.submit(TaskSpec::new("b", Noop).depends_on("ghost"), 0),
            Err(TaskError::UnknownDependency { .. })
        ));
        assert!(matches!(
            tasks.submit(TaskSpec::new("c", Noop).child_of("ghost"), 0),
            Err(TaskError::UnknownParent { .. })
        ));
        assert!(matches!(
            tasks.submit(TaskSpec::new("d", Noop).depends_on("d"), 0),
            Err(TaskError::DependencyCycle { .. })
        ));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.drain_events().len(), 1);
    }

    #[test]
    fn batch_cycle_is_rejected_atomically() {
        let mut tasks = TaskManager::default();
        let err = tasks
            .submit_batch(
                vec![
                    TaskSpec::new("x", Noop).depends_on("y"),
                    TaskSpec::new("y", Noop).depends_on("x"),
                ],
                0,
            )
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::DependencyCycle {
                path: vec!["y".into(), "x".into(), "y".into()]
            }
        );
        assert!(tasks.is_empty());
    }

    #[test]
    fn add_dependency_rejects_cycles_and_blocks() {
        let mut tasks = TaskManager::default();
        tasks.submit(TaskSpec::new("a", Noop), 0).unwrap();
        tasks.submit(TaskSpec::new("b", Noop).depends_on("a"), 0).unwrap();

        assert!(matches!(
            tasks.add_dependency(&"a".into(), &"b".into(), 0),
            Err(TaskError::DependencyCycle { .. })
        ));

        tasks.submit(TaskSpec::new("c", Noop), 0).unwrap();
        tasks.add_dependency(&"c".into(), &"b".into(), 0).unwrap();
        assert_eq!(tasks.status(&"c".into()), Some(TaskStatus::Blocked));
    }

    #[test]
    fn task_completes_when_its_actions_succeed() {
        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("t", one_action), 0).unwrap();

        h.tick(); // created -> ready
        h.tick(); // ready -> running, action enqueued
        assert_eq!(h.status("t"), Some(TaskStatus::Running));
        let action = h.queue.dequeue_ready(h.ctx.now()).unwrap();
        assert_eq!(action.id, ActionId::from("t#1.1"));

        h.queue
            .ack_success(&action.id, serde_json::Value::Null, h.ctx.now())
            .unwrap();
        h.tasks.absorb(&mut h.queue);
        h.tick();
        assert_eq!(h.status("t"), Some(TaskStatus::Completed));
    }

    #[test]
    fn failed_work_is_retried_then_fails() {
        let mut h = Harness::new();
        h.tasks
            .submit(TaskSpec::new("t", one_action).with_retries(1), 0)
            .unwrap();
        h.tick();
        h.tick();

        let first = h.queue.dequeue_ready(h.ctx.now()).unwrap();
        h.queue.fail_permanently(&first.id, "rejected", h.ctx.now()).unwrap();
        h.tasks.absorb(&mut h.queue);
        h.tick(); // retry: re-decomposed in the same tick
        assert_eq!(h.status("t"), Some(TaskStatus::Running));
        assert_eq!(h.tasks.get(&"t".into()).unwrap().attempt, 2);

        let second = h.queue.dequeue_ready(h.ctx.now()).unwrap();
        assert_eq!(second.id, ActionId::from("t#2.1"));
        h.queue.fail_permanently(&second.id, "rejected", h.ctx.now()).unwrap();
        h.tasks.absorb(&mut h.queue);
        h.tick();

        let task = h.tasks.get(&"t".into()).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.failure,
            Some(FailureCause::WorkFailed {
                action: "t#2.1".into()
            })
        );
        assert_eq!(h.tasks.stats().retried, 1);
    }

    #[test]
    fn decomposition_error_fails_the_task() {
        let mut h = Harness::new();
        let broken = |_: &Context, _: &mut Decomposition| -> Result<(), DecomposeError> {
            Err(DecomposeError("no path".into()))
        };
        h.tasks.submit(TaskSpec::new("t", broken), 0).unwrap();
        h.tick();
        h.tick();
        assert!(matches!(
            h.tasks.get(&"t".into()).unwrap().failure,
            Some(FailureCause::Decomposition { .. })
        ));
    }

    #[test]
    fn child_failure_policy_can_continue() {
        struct Tolerant;
        impl crate::state::TaskBehavior for Tolerant {
            fn decompose(&mut self, _: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
                plan.spawn(|_: &Context, _: &mut Decomposition| -> Result<(), DecomposeError> {
                    Err(DecomposeError("boom".into()))
                });
                Ok(())
            }

            fn on_child_failed(&mut self, _: &TaskId, _: &FailureCause) -> ChildPolicy {
                ChildPolicy::Continue
            }
        }

        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("p", Tolerant), 0).unwrap();
        for _ in 0..5 {
            h.tick();
        }
        assert_eq!(h.status("p/1"), Some(TaskStatus::Failed));
        assert_eq!(h.status("p"), Some(TaskStatus::Completed));
    }

    #[test]
    fn running_roots_are_limited() {
        let mut h = Harness::new();
        h.tasks = TaskManager::new(TasksConfig {
            max_running_roots: 1,
            ..TasksConfig::default()
        });
        h.tasks.submit(TaskSpec::new("low", one_action), 0).unwrap();
        h.tasks
            .submit(TaskSpec::new("high", one_action).with_priority(9), 0)
            .unwrap();
        h.tick();
        h.tick();
        assert_eq!(h.status("high"), Some(TaskStatus::Running));
        assert_eq!(h.status("low"), Some(TaskStatus::Ready));
    }

    #[test]
    fn pause_stops_advancement_and_resume_restores() {
        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("t", Noop), 0).unwrap();
        h.tick();
        assert_eq!(h.status("t"), Some(TaskStatus::Ready));

        h.tasks.pause(&"t".into(), h.ctx.now(), &mut h.queue).unwrap();
        h.tick();
        h.tick();
        assert_eq!(h.status("t"), Some(TaskStatus::Paused));

        h.tasks.resume(&"t".into(), h.ctx.now(), &mut h.queue).unwrap();
        assert_eq!(h.status("t"), Some(TaskStatus::Ready));
        h.tick();
        h.tick();
        assert_eq!(h.status("t"), Some(TaskStatus::Completed));
    }

    #[test]
    fn child_submitted_under_paused_parent_reports_paused() {
        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("p", Noop), 0).unwrap();
        h.tick();
        h.tasks.pause(&"p".into(), h.ctx.now(), &mut h.queue).unwrap();
        h.tasks.drain_events();

        h.tasks.submit(TaskSpec::new("c", Noop).child_of("p"), h.ctx.now()).unwrap();
        let events = h.tasks.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task, TaskId::from("c"));
        assert_eq!(events[0].status, TaskStatus::Paused);
        assert_eq!(h.status("c"), Some(TaskStatus::Paused));
    }

    #[test]
    fn paused_task_actions_wait_in_the_queue() {
        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("t", one_action), 0).unwrap();
        h.tick();
        h.tick();
        assert!(h.queue.is_live(&"t#1.1".into()));

        h.tasks.pause(&"t".into(), h.ctx.now(), &mut h.queue).unwrap();
        assert!(h.queue.dequeue_ready(h.ctx.now()).is_none());
        assert_eq!(h.queue.status(&"t#1.1".into()), Some(ActionStatus::Pending));

        h.tasks.resume(&"t".into(), h.ctx.now(), &mut h.queue).unwrap();
        let action = h.queue.dequeue_ready(h.ctx.now()).unwrap();
        assert_eq!(action.id, ActionId::from("t#1.1"));
    }

    #[test]
    fn cancelled_dependency_fails_dependents_transitively() {
        let mut h = Harness::new();
        h.tasks.submit(TaskSpec::new("a", one_action), 0).unwrap();
        h.tasks.submit(TaskSpec::new("b", Noop).depends_on("a"), 0).unwrap();
        h.tasks.submit(TaskSpec::new("c", Noop).depends_on("b"), 0).unwrap();
        h.tick();
        h.tick();

        let cancelled = h.tasks.cancel(&"a".into(), h.ctx.now(), &mut h.queue).unwrap();
        assert_eq!(cancelled, vec![TaskId::from("a")]);
        assert!(h.queue.is_empty());
        assert_eq!(
            h.tasks.get(&"c".into()).unwrap().failure,
            Some(FailureCause::DependencyUnresolvable {
                dependency: "b".into()
            })
        );
        assert_eq!(
            h.tasks.cancel(&"a".into(), h.ctx.now(), &mut h.queue),
            Err(TaskError::AlreadyFinished("a".into()))
        );
    }

    #[test]
    fn finished_roots_are_pruned_beyond_history() {
        let mut h = Harness::new();
        h.tasks = TaskManager::new(TasksConfig {
            history: 1,
            ..TasksConfig::default()
        });
        h.tasks.submit(TaskSpec::new("a", Noop), 0).unwrap();
        h.tasks.submit(TaskSpec::new("b", Noop), 0).unwrap();
        for _ in 0..4 {
            h.tick();
        }
        assert_eq!(h.tasks.len(), 1);
        assert_eq!(h.status("a"), None);
        assert_eq!(h.status("b"), Some(TaskStatus::Completed));
    }
}
