//! Adapters - network integrations toward the game server.
//!
//! The kernel only needs non-blocking submission: an adapter hands back an
//! [`ActionHandle`] immediately and later posts the server's verdict into the
//! [`ResultInbox`] it was attached to.

mod loopback;
mod scripted;

pub use loopback::{LoopbackNetwork, Responder};
pub use scripted::ScriptedNetwork;

use crate::inbox::{ActionHandle, ResultInbox};
use crate::kernel::Action;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("network adapter is not attached to an inbox")]
    Detached,

    #[error("no async runtime available")]
    NoRuntime,

    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Available network adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Loopback,
    Scripted,
}

impl NetworkKind {
    /// Parse adapter from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "loopback" => Some(Self::Loopback),
            "scripted" => Some(Self::Scripted),
            _ => None,
        }
    }

    /// Get adapter name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Scripted => "scripted",
        }
    }
}

/// Outbound seam toward the game server.
pub trait Network: Send {
    /// Called once by the dispatcher before the first submission.
    fn attach(&mut self, inbox: ResultInbox);

    /// Hands an action to the server without waiting for its result.
    ///
    /// An error is treated by the dispatcher as a retryable failure.
    fn submit(&mut self, action: &Action) -> Result<ActionHandle, NetworkError>;
}

impl Network for Box<dyn Network> {
    fn attach(&mut self, inbox: ResultInbox) {
        (**self).attach(inbox)
    }

    fn submit(&mut self, action: &Action) -> Result<ActionHandle, NetworkError> {
        (**self).submit(action)
    }
}
