//! Deterministic, engine-agnostic agent kernel primitives.
//!
//! Everything here is plain data shared between the state machine, the task
//! manager and the dispatcher: a typed blackboard, the tick clock and the
//! read-only world snapshot.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod blackboard;
pub mod tick;
pub mod world;

pub use blackboard::{BbKey, Blackboard, BlackboardError};
pub use tick::{Tick, TickContext};
pub use world::{Entity, EntityKind, Position, WorldSnapshot, WorldSource};
