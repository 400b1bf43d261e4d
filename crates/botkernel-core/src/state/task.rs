//! Task model - a goal-directed unit of work owned by the task manager.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ai_core::Tick;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::kernel::{ActionId, ActionPayload};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Blocked,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a task ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// Still running at its deadline.
    Timeout { deadline: Tick },
    /// A dependency was cancelled or failed.
    DependencyUnresolvable { dependency: TaskId },
    /// An action stayed failed after the retry budget ran out.
    WorkFailed { action: ActionId },
    /// A child failed and the task's policy escalated it.
    ChildFailed { child: TaskId },
    /// The decomposition step returned an error.
    Decomposition { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { deadline } => write!(f, "timed out at tick {deadline}"),
            Self::DependencyUnresolvable { dependency } => {
                write!(f, "dependency {dependency} cannot complete")
            }
            Self::WorkFailed { action } => write!(f, "action {action} failed"),
            Self::ChildFailed { child } => write!(f, "child {child} failed"),
            Self::Decomposition { message } => write!(f, "decomposition failed: {message}"),
        }
    }
}

/// Decision returned by [`TaskBehavior::on_child_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPolicy {
    /// Treat the child as resolved and keep going.
    Continue,
    /// Count the child as permanently failed work.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DecomposeError(pub String);

/// Task-type specific logic.
pub trait TaskBehavior: Send {
    /// Called each time the task enters `running` (once per attempt).
    fn decompose(&mut self, ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError>;

    fn on_child_failed(&mut self, _child: &TaskId, _cause: &FailureCause) -> ChildPolicy {
        ChildPolicy::Fail
    }
}

impl<F> TaskBehavior for F
where
    F: FnMut(&Context, &mut Decomposition) -> Result<(), DecomposeError> + Send,
{
    fn decompose(&mut self, ctx: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
        self(ctx, plan)
    }
}

/// Behavior with no work of its own; completes once its children do.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl TaskBehavior for Noop {
    fn decompose(&mut self, _ctx: &Context, _plan: &mut Decomposition) -> Result<(), DecomposeError> {
        Ok(())
    }
}

/// Request to create a task.
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    pub parent: Option<TaskId>,
    pub dependencies: Vec<TaskId>,
    pub priority: i32,
    /// Ticks allowed in `running`; falls back to the manager default.
    pub timeout_ticks: Option<u64>,
    pub max_retries: Option<u32>,
    /// Free-form label used by bulk commands.
    pub tag: Option<String>,
    pub behavior: Box<dyn TaskBehavior>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, behavior: impl TaskBehavior + 'static) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            parent: None,
            dependencies: Vec::new(),
            priority: 0,
            timeout_ticks: None,
            max_retries: None,
            tag: None,
            behavior: Box::new(behavior),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn child_of(mut self, parent: impl Into<TaskId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, ticks: u64) -> Self {
        self.timeout_ticks = Some(ticks);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("timeout_ticks", &self.timeout_ticks)
            .field("max_retries", &self.max_retries)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// One action requested by a decomposition step.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub payload: ActionPayload,
    /// Defaults to the owning task's priority.
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    /// Ticks after enqueue before the action expires.
    pub deadline_ticks: Option<u64>,
    /// Indices of earlier actions in the same decomposition.
    pub after: Vec<usize>,
}

impl ActionSpec {
    pub fn new(payload: ActionPayload) -> Self {
        Self {
            payload,
            priority: None,
            max_attempts: None,
            deadline_ticks: None,
            after: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn expires_after(mut self, ticks: u64) -> Self {
        self.deadline_ticks = Some(ticks);
        self
    }

    pub fn after(mut self, index: usize) -> Self {
        self.after.push(index);
        self
    }
}

/// Output of one decomposition step: actions to enqueue and children to spawn.
#[derive(Debug)]
pub struct Decomposition {
    task: TaskId,
    priority: i32,
    next_child: u32,
    actions: Vec<ActionSpec>,
    children: Vec<TaskSpec>,
}

impl Decomposition {
    pub(crate) fn new(task: TaskId, priority: i32, next_child: u32) -> Self {
        Self {
            task,
            priority,
            next_child,
            actions: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn task(&self) -> &TaskId {
        &self.task
    }

    /// Queues an action and returns its index for use with [`ActionSpec::after`].
    pub fn action(&mut self, spec: ActionSpec) -> usize {
        self.actions.push(spec);
        self.actions.len() - 1
    }

    /// Spawns an owned child with a generated id (`<parent>/<n>`).
    ///
    /// The returned spec can be refined further, e.g. with sibling
    /// dependencies.
    pub fn spawn(&mut self, behavior: impl TaskBehavior + 'static) -> &mut TaskSpec {
        self.next_child += 1;
        let id = TaskId::new(format!("{}/{}", self.task, self.next_child));
        let spec = TaskSpec::new(id, behavior)
            .child_of(self.task.clone())
            .with_priority(self.priority);
        self.children.push(spec);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub(crate) fn next_child(&self) -> u32 {
        self.next_child
    }

    pub(crate) fn into_parts(self) -> (Vec<ActionSpec>, Vec<TaskSpec>) {
        (self.actions, self.children)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.children.is_empty()
    }
}

/// Outcome of one piece of work tracked for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    Pending,
    Done,
    Failed,
}

/// A task as held by the manager.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub dependencies: BTreeSet<TaskId>,
    pub priority: i32,
    pub status: TaskStatus,
    pub failure: Option<FailureCause>,
    pub tag: Option<String>,
    pub timeout_ticks: Option<u64>,
    pub deadline: Option<Tick>,
    pub retries: u32,
    pub max_retries: u32,
    /// Attempt number, starting at 1 on first run.
    pub attempt: u32,
    pub created_at: Tick,
    pub started_at: Option<Tick>,
    pub finished_at: Option<Tick>,
    pub(crate) seq: u64,
    pub(crate) child_seq: u32,
    pub(crate) paused_from: Option<TaskStatus>,
    pub(crate) paused_at: Option<Tick>,
    pub(crate) actions: BTreeMap<ActionId, WorkState>,
    /// Children spawned or adopted during the current attempt.
    pub(crate) active_children: BTreeSet<TaskId>,
    pub(crate) child_verdicts: BTreeMap<TaskId, ChildPolicy>,
    pub(crate) behavior: Box<dyn TaskBehavior>,
}

impl Task {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Actions of the current attempt with their tracked state.
    pub fn actions(&self) -> impl Iterator<Item = (&ActionId, WorkState)> {
        self.actions.iter().map(|(id, state)| (id, *state))
    }

    /// Status before the task was paused, if it is paused.
    pub fn paused_from(&self) -> Option<TaskStatus> {
        self.paused_from
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("failure", &self.failure)
            .field("deadline", &self.deadline)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a task and its owned subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskNode>,
}
