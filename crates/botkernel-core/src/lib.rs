//! Botkernel Core - behavioral scheduling kernel
//!
//! This crate binds a guarded state machine, a priority action queue and a
//! hierarchical task manager into a single-threaded tick loop that drives an
//! agent against a latency-bound game server.

pub mod adapters;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod inbox;
pub mod kernel;
pub mod observability;
pub mod state;

pub use config::AgentConfig;
pub use context::Context;
pub use inbox::{ActionHandle, Outcome, PostedResult, ResultInbox};
pub use kernel::{
    Action, ActionFailure, ActionId, ActionKind, ActionPayload, ActionQueue, ActionSettlement,
    ActionStatus, Dispatcher, TaskManager,
};
pub use state::{AgentState, Task, TaskId, TaskSpec, TaskStatus};
