//! Prioritized, guarded state machine built on `ai-core`.
//!
//! States are a closed enumeration implementing [`StateId`]; behavior lives in
//! per-state transition tables rather than in a class hierarchy. Each tick the
//! transitions registered on the active state (then on its ancestors) are
//! evaluated in descending priority and the first matching guard fires.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod machine;
pub mod state;
pub mod transition;

pub use machine::{
    FsmError, GuardFailure, Hook, MachineConfig, StateChange, StateMachine, StateStats,
};
pub use state::StateId;
pub use transition::{GuardError, GuardFn, Transition};
