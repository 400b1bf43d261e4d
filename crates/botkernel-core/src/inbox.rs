//! Result inbox - the only concurrency-safe boundary of the kernel.
//!
//! Network adapters post results from their own tasks; the dispatcher drains
//! them once per tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Opaque ticket returned by a network adapter for a submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionHandle(pub u64);

impl std::fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Server-side result of a submitted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "lowercase")]
pub enum Outcome {
    Success(serde_json::Value),
    Retryable(String),
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedResult {
    pub handle: ActionHandle,
    pub outcome: Outcome,
}

/// Multi-producer, single-consumer result buffer.
#[derive(Debug, Clone, Default)]
pub struct ResultInbox {
    inner: Arc<Mutex<Vec<PostedResult>>>,
}

impl ResultInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, handle: ActionHandle, outcome: Outcome) {
        self.lock().push(PostedResult { handle, outcome });
    }

    /// Takes every pending result in arrival order.
    pub fn drain(&self) -> Vec<PostedResult> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A producer that panicked mid-push cannot leave the Vec inconsistent.
    fn lock(&self) -> MutexGuard<'_, Vec<PostedResult>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
