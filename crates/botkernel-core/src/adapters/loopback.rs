//! Loopback adapter - answers every action from a local tokio task after a
//! fixed latency.

use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;
use tracing::debug;

use super::{Network, NetworkError};
use crate::inbox::{ActionHandle, Outcome, ResultInbox};
use crate::kernel::Action;

/// Decides the server's answer at submission time.
pub type Responder = Box<dyn FnMut(&Action) -> Outcome + Send>;

pub struct LoopbackNetwork {
    inbox: Option<ResultInbox>,
    latency: Duration,
    next_handle: u64,
    responder: Responder,
}

impl LoopbackNetwork {
    /// Acknowledges every action with its kind as payload.
    pub fn new(latency: Duration) -> Self {
        Self {
            inbox: None,
            latency,
            next_handle: 0,
            responder: Box::new(|action: &Action| {
                Outcome::Success(json!({ "kind": action.payload.kind }))
            }),
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Action) -> Outcome + Send + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// Every `n`th submission comes back retryable, the rest succeed.
    pub fn flaky(latency: Duration, n: u64) -> Self {
        let n = n.max(1);
        let mut count = 0u64;
        Self::new(latency).with_responder(move |action: &Action| {
            count += 1;
            if count % n == 0 {
                Outcome::Retryable("server busy".into())
            } else {
                Outcome::Success(json!({ "kind": action.payload.kind }))
            }
        })
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }
}

impl Network for LoopbackNetwork {
    fn attach(&mut self, inbox: ResultInbox) {
        self.inbox = Some(inbox);
    }

    fn submit(&mut self, action: &Action) -> Result<ActionHandle, NetworkError> {
        let inbox = self.inbox.clone().ok_or(NetworkError::Detached)?;
        let runtime = Handle::try_current().map_err(|_| NetworkError::NoRuntime)?;

        self.next_handle += 1;
        let handle = ActionHandle(self.next_handle);
        let outcome = (self.responder)(action);
        let latency = self.latency;

        debug!(action = %action.id, %handle, ?latency, "Loopback submit");
        runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            inbox.post(handle, outcome);
        });

        Ok(handle)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("latency", &self.latency)
            .field("attached", &self.inbox.is_some())
            .finish_non_exhaustive()
    }
}
