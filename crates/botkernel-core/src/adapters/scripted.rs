//! Scripted adapter - synchronous, deterministic answers for tests and demos.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::{Network, NetworkError};
use crate::inbox::{ActionHandle, Outcome, ResultInbox};
use crate::kernel::{Action, ActionId};

/// Posts scripted outcomes at submission time.
///
/// Each action id can carry its own queue of outcomes, consumed one per
/// submission. Without a script the fallback answers; with no fallback the
/// action is held unanswered until [`ScriptedNetwork::respond`] is called.
#[derive(Debug)]
pub struct ScriptedNetwork {
    inbox: Option<ResultInbox>,
    next_handle: u64,
    scripts: HashMap<ActionId, VecDeque<Outcome>>,
    fallback: Option<Outcome>,
    rejections: u32,
    submitted: Vec<(ActionHandle, ActionId)>,
    held: Vec<(ActionHandle, ActionId)>,
}

impl Default for ScriptedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedNetwork {
    /// Answers success unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            inbox: None,
            next_handle: 0,
            scripts: HashMap::new(),
            fallback: Some(Outcome::Success(serde_json::Value::Null)),
            rejections: 0,
            submitted: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Never answers unscripted actions.
    pub fn silent() -> Self {
        Self {
            fallback: None,
            ..Self::new()
        }
    }

    pub fn script(mut self, id: impl Into<ActionId>, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.scripts
            .entry(id.into())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Rejects the next `n` submissions outright.
    pub fn fail_submissions(mut self, n: u32) -> Self {
        self.rejections = n;
        self
    }

    /// Every accepted submission, in order.
    pub fn submitted(&self) -> &[(ActionHandle, ActionId)] {
        &self.submitted
    }

    /// Submissions still waiting for an answer.
    pub fn held(&self) -> &[(ActionHandle, ActionId)] {
        &self.held
    }

    /// Latest handle issued for `id`.
    pub fn handle_for(&self, id: &ActionId) -> Option<ActionHandle> {
        self.submitted
            .iter()
            .rev()
            .find(|(_, submitted)| submitted == id)
            .map(|(handle, _)| *handle)
    }

    /// Answers a held submission late. Returns `false` if nothing was held
    /// under `handle` or the adapter is detached.
    pub fn respond(&mut self, handle: ActionHandle, outcome: Outcome) -> bool {
        let Some(inbox) = &self.inbox else {
            return false;
        };
        let Some(pos) = self.held.iter().position(|(h, _)| *h == handle) else {
            return false;
        };
        self.held.remove(pos);
        inbox.post(handle, outcome);
        true
    }
}

impl Network for ScriptedNetwork {
    fn attach(&mut self, inbox: ResultInbox) {
        self.inbox = Some(inbox);
    }

    fn submit(&mut self, action: &Action) -> Result<ActionHandle, NetworkError> {
        let inbox = self.inbox.as_ref().ok_or(NetworkError::Detached)?;
        if self.rejections > 0 {
            self.rejections -= 1;
            return Err(NetworkError::Rejected("scripted rejection".into()));
        }

        self.next_handle += 1;
        let handle = ActionHandle(self.next_handle);
        self.submitted.push((handle, action.id.clone()));

        let outcome = self
            .scripts
            .get_mut(&action.id)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.fallback.clone());

        match outcome {
            Some(outcome) => {
                debug!(action = %action.id, %handle, ?outcome, "Scripted answer");
                inbox.post(handle, outcome);
            }
            None => {
                debug!(action = %action.id, %handle, "Holding action unanswered");
                self.held.push((handle, action.id.clone()));
            }
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ActionKind, ActionPayload};

    fn action(id: &str) -> Action {
        Action::new(id, 0, ActionPayload::new(ActionKind::Wait))
    }

    #[test]
    fn scripts_are_consumed_in_order() {
        let inbox = ResultInbox::new();
        let mut net = ScriptedNetwork::new().script("x", [Outcome::Retryable("busy".into())]);
        net.attach(inbox.clone());

        net.submit(&action("x")).unwrap();
        net.submit(&action("x")).unwrap();
        let results = inbox.drain();
        assert_eq!(results[0].outcome, Outcome::Retryable("busy".into()));
        assert_eq!(results[1].outcome, Outcome::Success(serde_json::Value::Null));
    }

    #[test]
    fn silent_network_holds_until_responded() {
        let inbox = ResultInbox::new();
        let mut net = ScriptedNetwork::silent().fail_submissions(1);
        net.attach(inbox.clone());

        assert!(matches!(net.submit(&action("y")), Err(NetworkError::Rejected(_))));
        let handle = net.submit(&action("y")).unwrap();
        assert!(inbox.is_empty());
        assert_eq!(net.held().len(), 1);

        assert!(net.respond(handle, Outcome::Fatal("gone".into())));
        assert!(!net.respond(handle, Outcome::Fatal("again".into())));
        assert_eq!(inbox.len(), 1);
    }
}
