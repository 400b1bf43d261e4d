//! State module - agent modes, tasks and their dependency graph

pub mod behaviors;
pub mod catalog;
pub mod graph;
pub mod task;

pub use behaviors::{install_default_behaviors, AgentMachine, TaskCommand, TaskCommands};
pub use catalog::{priority, AgentState};
pub use graph::DependencyGraph;
pub use task::{
    ActionSpec, ChildPolicy, DecomposeError, Decomposition, FailureCause, Noop, Task,
    TaskBehavior, TaskId, TaskNode, TaskSpec, TaskStatus, WorkState,
};
