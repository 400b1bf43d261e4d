//! Kernel module - the action queue, the task manager and the tick loop

pub mod action;
pub mod dispatcher;
pub mod queue;
pub mod tasks;

pub use action::{
    Action, ActionFailure, ActionId, ActionKind, ActionPayload, ActionSettlement, ActionStatus,
};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use queue::{AckOutcome, ActionQueue, EnqueueOutcome, QueueError, QueueStats};
pub use tasks::{TaskError, TaskEvent, TaskManager, TaskStats};
