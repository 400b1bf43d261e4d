//! Action queue - priority-ordered, bounded, retrying.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use ai_core::Tick;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::action::{Action, ActionFailure, ActionId, ActionSettlement, ActionStatus};
use crate::config::QueueConfig;
use crate::state::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("action {0} is already queued")]
    DuplicateAction(ActionId),

    #[error("unknown action {0}")]
    UnknownAction(ActionId),

    #[error("prerequisite {prerequisite} of {action} is neither live nor succeeded")]
    PrerequisiteUnavailable {
        action: ActionId,
        prerequisite: ActionId,
    },
}

/// Non-fatal result of [`ActionQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; `evicted` was dropped (possibly the incoming action).
    Overflow { evicted: ActionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Succeeded,
    Retrying { attempts: u32, not_before: Tick },
    /// Failed permanently by this call.
    Failed,
    /// The action was already terminal; nothing changed.
    AlreadySettled(ActionStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub evicted: u64,
    pub expired: u64,
    pub retried: u64,
    pub timed_out: u64,
}

/// What making room in a full queue did.
enum Room {
    Free,
    Evicted(ActionId),
    /// The incoming action ranks strictly below every pending one.
    Rejected,
}

type OrderKey = (Reverse<i32>, u64);

fn order_key(action: &Action) -> OrderKey {
    (Reverse(action.priority), action.seq)
}

/// Priority queue of outbound actions.
///
/// Pending actions are ordered by priority (descending) then enqueue sequence.
/// Every terminal transition is recorded as an [`ActionSettlement`] that the
/// dispatcher drains into task bookkeeping.
#[derive(Debug)]
pub struct ActionQueue {
    config: QueueConfig,
    live: HashMap<ActionId, Action>,
    pending: BTreeMap<OrderKey, ActionId>,
    next_seq: u64,
    paused: bool,
    held: HashSet<TaskId>,
    history: VecDeque<Action>,
    settlements: Vec<ActionSettlement>,
    stats: QueueStats,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl ActionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            live: HashMap::new(),
            pending: BTreeMap::new(),
            next_seq: 0,
            paused: false,
            held: HashSet::new(),
            history: VecDeque::new(),
            settlements: Vec::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a pending action.
    ///
    /// On a full queue the lowest-priority pending action (oldest among equals)
    /// is evicted, unless the incoming action ranks strictly below all of them,
    /// in which case it is the one dropped.
    pub fn enqueue(&mut self, mut action: Action, now: Tick) -> Result<EnqueueOutcome, QueueError> {
        if self.live.contains_key(&action.id) {
            return Err(QueueError::DuplicateAction(action.id));
        }

        let mut outstanding = Vec::with_capacity(action.prerequisites.len());
        for prerequisite in &action.prerequisites {
            if self.live.contains_key(prerequisite) {
                outstanding.push(prerequisite.clone());
            } else if self.history_status(prerequisite) != Some(ActionStatus::Succeeded) {
                return Err(QueueError::PrerequisiteUnavailable {
                    action: action.id.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }
        action.prerequisites = outstanding;
        action.status = ActionStatus::Pending;
        action.enqueued_at = now;
        action.dispatched_at = None;
        action.seq = self.bump_seq();
        self.stats.enqueued += 1;

        let outcome = match self.make_room(action.priority, &action.id, now) {
            Room::Free => EnqueueOutcome::Queued,
            Room::Rejected => {
                warn!(action = %action.id, priority = action.priority, "Queue full, rejecting incoming action");
                let id = action.id.clone();
                self.record_terminal(action, ActionStatus::Failed, Some(ActionFailure::Evicted), None, now);
                return Ok(EnqueueOutcome::Overflow { evicted: id });
            }
            Room::Evicted(victim) => EnqueueOutcome::Overflow { evicted: victim },
        };

        // The eviction may have failed a whole chain of prerequisites.
        if outcome != EnqueueOutcome::Queued {
            if let Some(prerequisite) = self.settle_prerequisites(&mut action) {
                debug!(action = %action.id, %prerequisite, "Prerequisite failed before enqueue");
                self.record_terminal(
                    action,
                    ActionStatus::Failed,
                    Some(ActionFailure::PrerequisiteFailed { prerequisite }),
                    None,
                    now,
                );
                return Ok(outcome);
            }
        }

        debug!(
            action = %action.id,
            priority = action.priority,
            kind = ?action.payload.kind,
            "Enqueued action"
        );
        self.pending.insert(order_key(&action), action.id.clone());
        self.live.insert(action.id.clone(), action);
        Ok(outcome)
    }

    /// Frees a pending slot for an action of `priority` when the queue is full.
    fn make_room(&mut self, priority: i32, incoming: &ActionId, now: Tick) -> Room {
        if self.pending.len() < self.config.capacity.max(1) {
            return Room::Free;
        }
        let Some(lowest) = self.pending.keys().next_back().map(|(Reverse(p), _)| *p) else {
            return Room::Free;
        };
        if priority < lowest {
            return Room::Rejected;
        }

        let victim = self
            .pending
            .range((Reverse(lowest), 0)..)
            .next()
            .map(|(_, id)| id.clone());
        match victim {
            Some(victim) => {
                warn!(evicted = %victim, %incoming, "Queue full, evicting pending action");
                self.settle(&victim, ActionStatus::Failed, Some(ActionFailure::Evicted), None, now);
                Room::Evicted(victim)
            }
            None => Room::Free,
        }
    }

    /// Drops prerequisites that have succeeded since `action` was checked and
    /// returns the first one that is gone without succeeding.
    fn settle_prerequisites(&self, action: &mut Action) -> Option<ActionId> {
        let mut failed = None;
        action.prerequisites.retain(|prerequisite| {
            if self.live.contains_key(prerequisite) {
                return true;
            }
            if failed.is_none() && self.history_status(prerequisite) != Some(ActionStatus::Succeeded) {
                failed = Some(prerequisite.clone());
            }
            false
        });
        failed
    }

    /// Takes the next dispatchable action and marks it `running`.
    ///
    /// Expired pending actions are settled as failed first. Actions owned by a
    /// held task are skipped.
    pub fn dequeue_ready(&mut self, now: Tick) -> Option<Action> {
        if self.paused {
            return None;
        }
        self.expire(now);

        let key = self
            .pending
            .iter()
            .find(|(_, id)| self.live.get(*id).is_some_and(|a| self.is_ready(a, now)))
            .map(|(key, _)| *key)?;
        let id = self.pending.remove(&key)?;
        let action = self.live.get_mut(&id)?;
        action.status = ActionStatus::Running;
        action.dispatched_at = Some(now);
        self.stats.dispatched += 1;
        debug!(action = %id, attempt = action.attempts + 1, "Dequeued action");
        Some(action.clone())
    }

    /// The action `dequeue_ready` would return, without side effects.
    pub fn peek_ready(&self, now: Tick) -> Option<&Action> {
        if self.paused {
            return None;
        }
        self.pending
            .values()
            .filter_map(|id| self.live.get(id))
            .find(|a| !a.is_expired(now) && self.is_ready(a, now))
    }

    fn is_ready(&self, action: &Action, now: Tick) -> bool {
        action.not_before <= now
            && action.prerequisites.is_empty()
            && action.owner.as_ref().map_or(true, |owner| !self.held.contains(owner))
    }

    /// Settles every pending action whose deadline has passed.
    pub fn expire(&mut self, now: Tick) -> usize {
        let expired: Vec<(ActionId, Tick)> = self
            .pending
            .values()
            .filter_map(|id| self.live.get(id))
            .filter_map(|a| a.deadline.filter(|_| a.is_expired(now)).map(|d| (a.id.clone(), d)))
            .collect();

        for (id, deadline) in &expired {
            self.stats.expired += 1;
            self.settle(
                id,
                ActionStatus::Failed,
                Some(ActionFailure::DeadlineExpired {
                    deadline: *deadline,
                }),
                None,
                now,
            );
        }
        expired.len()
    }

    /// Counts a failed attempt against every running action that has waited
    /// longer than the execution timeout for its reply. Returns the ids, whose
    /// outstanding dispatch handles are now stale.
    pub fn time_out_running(&mut self, now: Tick) -> Vec<ActionId> {
        let timeout = self.config.execution_timeout_ticks;
        if timeout == 0 {
            return Vec::new();
        }
        let mut overdue: Vec<(u64, ActionId)> = self
            .live
            .values()
            .filter(|a| a.status == ActionStatus::Running)
            .filter(|a| a.dispatched_at.is_some_and(|at| now >= at.saturating_add(timeout)))
            .map(|a| (a.seq, a.id.clone()))
            .collect();
        overdue.sort();

        let mut timed_out = Vec::with_capacity(overdue.len());
        for (_, id) in overdue {
            if let Ok(outcome) = self.ack_failure(&id, "no reply before execution timeout", now) {
                self.stats.timed_out += 1;
                warn!(action = %id, ?outcome, "Action timed out waiting for a reply");
                timed_out.push(id);
            }
        }
        timed_out
    }

    pub fn ack_success(
        &mut self,
        id: &ActionId,
        result: serde_json::Value,
        now: Tick,
    ) -> Result<AckOutcome, QueueError> {
        let Some(action) = self.live.get_mut(id) else {
            return self.settled_or_unknown(id);
        };
        action.attempts = action.attempts.saturating_add(1);
        self.settle(id, ActionStatus::Succeeded, None, Some(result), now);
        Ok(AckOutcome::Succeeded)
    }

    /// Records a failed attempt and schedules a retry while attempts remain.
    pub fn ack_failure(
        &mut self,
        id: &ActionId,
        reason: impl Into<String>,
        now: Tick,
    ) -> Result<AckOutcome, QueueError> {
        let seq = self.next_seq;
        let backoff = self.config.backoff;
        let Some(action) = self.live.get_mut(id) else {
            return self.settled_or_unknown(id);
        };

        let old_key = order_key(action);
        action.attempts = action.attempts.saturating_add(1);
        action.last_error = Some(reason.into());

        if action.attempts >= action.max_attempts {
            let attempts = action.attempts;
            self.settle(
                id,
                ActionStatus::Failed,
                Some(ActionFailure::Exhausted { attempts }),
                None,
                now,
            );
            return Ok(AckOutcome::Failed);
        }

        let attempts = action.attempts;
        let priority = action.priority;
        let not_before = now.saturating_add(backoff.delay(attempts));
        action.status = ActionStatus::Pending;
        action.not_before = not_before;
        action.dispatched_at = None;
        action.seq = seq;
        let new_key = order_key(action);

        self.next_seq += 1;
        self.pending.remove(&old_key);
        if let Room::Rejected = self.make_room(priority, id, now) {
            warn!(action = %id, priority, "Queue full, dropping retry");
            self.settle(id, ActionStatus::Failed, Some(ActionFailure::Evicted), None, now);
            return Ok(AckOutcome::Failed);
        }
        // An eviction can cascade into a pending retry that waited on it.
        if !self.live.contains_key(id) {
            return Ok(AckOutcome::Failed);
        }
        self.pending.insert(new_key, id.clone());
        self.stats.retried += 1;
        debug!(action = %id, attempts, not_before, "Action will be retried");
        Ok(AckOutcome::Retrying {
            attempts,
            not_before,
        })
    }

    /// Fails an action without further retries (fatal server response).
    pub fn fail_permanently(
        &mut self,
        id: &ActionId,
        message: impl Into<String>,
        now: Tick,
    ) -> Result<AckOutcome, QueueError> {
        let Some(action) = self.live.get_mut(id) else {
            return self.settled_or_unknown(id);
        };
        action.attempts = action.attempts.saturating_add(1);
        let message = message.into();
        action.last_error = Some(message.clone());
        self.settle(id, ActionStatus::Failed, Some(ActionFailure::Fatal { message }), None, now);
        Ok(AckOutcome::Failed)
    }

    /// Cancels a live action. Returns `false` if it was already terminal.
    pub fn cancel(&mut self, id: &ActionId, now: Tick) -> Result<bool, QueueError> {
        if self.live.contains_key(id) {
            self.settle(id, ActionStatus::Cancelled, Some(ActionFailure::Cancelled), None, now);
            return Ok(true);
        }
        self.settled_or_unknown(id)?;
        Ok(false)
    }

    /// Cancels every live action owned by `task`, most recent first.
    pub fn cancel_owned_by(&mut self, task: &TaskId, now: Tick) -> Vec<ActionId> {
        let mut owned: Vec<(u64, ActionId)> = self
            .live
            .values()
            .filter(|a| a.owner.as_ref() == Some(task))
            .map(|a| (a.seq, a.id.clone()))
            .collect();
        owned.sort_by(|a, b| b.0.cmp(&a.0));

        let mut cancelled = Vec::with_capacity(owned.len());
        for (_, id) in owned {
            if self.live.contains_key(&id) {
                self.settle(&id, ActionStatus::Cancelled, Some(ActionFailure::Cancelled), None, now);
                cancelled.push(id);
            }
        }
        cancelled
    }

    pub fn cancel_all(&mut self, now: Tick) -> usize {
        let mut all: Vec<(u64, ActionId)> =
            self.live.values().map(|a| (a.seq, a.id.clone())).collect();
        all.sort_by(|a, b| b.0.cmp(&a.0));

        let mut count = 0;
        for (_, id) in all {
            if self.live.contains_key(&id) {
                self.settle(&id, ActionStatus::Cancelled, Some(ActionFailure::Cancelled), None, now);
                count += 1;
            }
        }
        info!(count, "Cancelled all actions");
        count
    }

    /// Stops `dequeue_ready` from handing out actions.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Keeps actions owned by `task` from being dispatched until released.
    /// Actions already running are unaffected.
    pub fn hold_owner(&mut self, task: &TaskId) {
        if self.held.insert(task.clone()) {
            debug!(task = %task, "Holding owned actions");
        }
    }

    pub fn release_owner(&mut self, task: &TaskId) {
        if self.held.remove(task) {
            debug!(task = %task, "Released owned actions");
        }
    }

    pub fn is_held(&self, task: &TaskId) -> bool {
        self.held.contains(task)
    }

    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.live
            .get(id)
            .or_else(|| self.history.iter().rev().find(|a| &a.id == id))
    }

    pub fn status(&self, id: &ActionId) -> Option<ActionStatus> {
        self.get(id).map(|a| a.status)
    }

    pub fn is_live(&self, id: &ActionId) -> bool {
        self.live.contains_key(id)
    }

    /// Pending actions in dispatch order.
    pub fn pending(&self) -> impl Iterator<Item = &Action> {
        self.pending.values().filter_map(|id| self.live.get(id))
    }

    /// Number of pending actions.
    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.live.len() - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Recently settled actions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Action> {
        self.history.iter()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn drain_settlements(&mut self) -> Vec<ActionSettlement> {
        std::mem::take(&mut self.settlements)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn history_status(&self, id: &ActionId) -> Option<ActionStatus> {
        self.history.iter().rev().find(|a| &a.id == id).map(|a| a.status)
    }

    fn settled_or_unknown(&self, id: &ActionId) -> Result<AckOutcome, QueueError> {
        self.history_status(id)
            .map(AckOutcome::AlreadySettled)
            .ok_or_else(|| QueueError::UnknownAction(id.clone()))
    }

    /// Moves a live action to a terminal status and cascades to actions
    /// waiting on it.
    fn settle(
        &mut self,
        id: &ActionId,
        status: ActionStatus,
        failure: Option<ActionFailure>,
        result: Option<serde_json::Value>,
        now: Tick,
    ) {
        let mut work = vec![(id.clone(), status, failure)];

        while let Some((id, status, failure)) = work.pop() {
            let Some(action) = self.live.remove(&id) else {
                continue;
            };
            self.pending.remove(&order_key(&action));

            let succeeded = status == ActionStatus::Succeeded;
            for waiting in self.live.values_mut() {
                if let Some(pos) = waiting.prerequisites.iter().position(|p| p == &id) {
                    if succeeded {
                        waiting.prerequisites.remove(pos);
                    } else {
                        work.push((
                            waiting.id.clone(),
                            ActionStatus::Failed,
                            Some(ActionFailure::PrerequisiteFailed {
                                prerequisite: id.clone(),
                            }),
                        ));
                    }
                }
            }

            let payload = if succeeded { result.clone() } else { None };
            self.record_terminal(action, status, failure, payload, now);
        }
    }

    fn record_terminal(
        &mut self,
        mut action: Action,
        status: ActionStatus,
        failure: Option<ActionFailure>,
        result: Option<serde_json::Value>,
        now: Tick,
    ) {
        action.status = status;
        action.failure = failure.clone();

        match (status, &failure) {
            (ActionStatus::Succeeded, _) => self.stats.succeeded += 1,
            (ActionStatus::Cancelled, _) => self.stats.cancelled += 1,
            (_, Some(ActionFailure::Evicted)) => {
                self.stats.evicted += 1;
                self.stats.failed += 1;
            }
            _ => self.stats.failed += 1,
        }

        match &failure {
            Some(ActionFailure::Cancelled) | None => {
                debug!(action = %action.id, status = ?status, "Action settled")
            }
            Some(reason) => warn!(action = %action.id, %reason, "Action failed"),
        }

        self.settlements.push(ActionSettlement {
            id: action.id.clone(),
            owner: action.owner.clone(),
            status,
            attempts: action.attempts,
            failure,
            result,
            tick: now,
        });

        self.history.push_back(action);
        while self.history.len() > self.config.history {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::action::{ActionKind, ActionPayload};

    fn action(id: &str, priority: i32) -> Action {
        Action::new(id, priority, ActionPayload::new(ActionKind::Wait))
    }

    fn small_queue(capacity: usize) -> ActionQueue {
        ActionQueue::new(QueueConfig {
            capacity,
            ..QueueConfig::default()
        })
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("a", 1), 0).unwrap();
        assert_eq!(
            queue.enqueue(action("a", 9), 0),
            Err(QueueError::DuplicateAction("a".into()))
        );
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_lowest_priority() {
        let mut queue = small_queue(3);
        queue.enqueue(action("low-old", 1), 0).unwrap();
        queue.enqueue(action("low-new", 1), 0).unwrap();
        queue.enqueue(action("high", 9), 0).unwrap();

        let outcome = queue.enqueue(action("mid", 5), 0).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Overflow {
                evicted: "low-old".into()
            }
        );
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.stats().evicted, 1);

        let settled = queue.drain_settlements();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].failure, Some(ActionFailure::Evicted));
    }

    #[test]
    fn overflow_rejects_incoming_when_strictly_lowest() {
        let mut queue = small_queue(1);
        queue.enqueue(action("keep", 5), 0).unwrap();
        let outcome = queue.enqueue(action("drop", 4), 0).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Overflow {
                evicted: "drop".into()
            }
        );
        assert!(queue.is_live(&"keep".into()));
        assert_eq!(queue.status(&"drop".into()), Some(ActionStatus::Failed));
    }

    #[test]
    fn backoff_delays_retry() {
        let mut queue = ActionQueue::default();
        queue
            .enqueue(action("a", 1).with_max_attempts(3), 0)
            .unwrap();
        let a = queue.dequeue_ready(0).unwrap();
        assert_eq!(
            queue.ack_failure(&a.id, "timeout", 10).unwrap(),
            AckOutcome::Retrying {
                attempts: 1,
                not_before: 11
            }
        );
        assert!(queue.dequeue_ready(10).is_none());
        let again = queue.dequeue_ready(11).unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(
            queue.ack_failure(&again.id, "timeout", 11).unwrap(),
            AckOutcome::Retrying {
                attempts: 2,
                not_before: 13
            }
        );
    }

    #[test]
    fn expired_actions_are_settled_not_dispatched() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("late", 9).with_deadline(5), 0).unwrap();
        queue.enqueue(action("ok", 1), 0).unwrap();

        assert_eq!(queue.dequeue_ready(5).unwrap().id, "ok".into());
        assert_eq!(queue.status(&"late".into()), Some(ActionStatus::Failed));
        assert_eq!(queue.stats().expired, 1);
    }

    #[test]
    fn prerequisites_gate_dispatch_and_cascade_failures() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("move", 1), 0).unwrap();
        queue.enqueue(action("attack", 9).after("move"), 0).unwrap();
        queue.enqueue(action("loot", 9).after("attack"), 0).unwrap();

        let first = queue.dequeue_ready(0).unwrap();
        assert_eq!(first.id, "move".into());
        assert!(queue.dequeue_ready(0).is_none());

        queue.ack_success(&first.id, serde_json::Value::Null, 1).unwrap();
        let attack = queue.dequeue_ready(1).unwrap();
        assert_eq!(attack.id, "attack".into());

        queue.fail_permanently(&attack.id, "target gone", 2).unwrap();
        assert_eq!(queue.status(&"loot".into()), Some(ActionStatus::Failed));
        assert_eq!(
            queue.get(&"loot".into()).unwrap().failure,
            Some(ActionFailure::PrerequisiteFailed {
                prerequisite: "attack".into()
            })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn unknown_prerequisite_is_an_error() {
        let mut queue = ActionQueue::default();
        let err = queue.enqueue(action("b", 1).after("ghost"), 0).unwrap_err();
        assert!(matches!(err, QueueError::PrerequisiteUnavailable { .. }));
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_owned_by_leaves_nothing_behind() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("a", 1).owned_by("t"), 0).unwrap();
        queue.enqueue(action("b", 1).owned_by("t").after("a"), 0).unwrap();
        queue.enqueue(action("c", 1).owned_by("other"), 0).unwrap();
        queue.dequeue_ready(0).unwrap();

        let cancelled = queue.cancel_owned_by(&"t".into(), 1);
        assert_eq!(cancelled, vec![ActionId::from("b"), ActionId::from("a")]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.status(&"b".into()), Some(ActionStatus::Cancelled));
        assert_eq!(queue.cancel(&"a".into(), 2), Ok(false));
    }

    #[test]
    fn paused_queue_hands_out_nothing() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("a", 1), 0).unwrap();
        queue.pause();
        assert!(queue.dequeue_ready(0).is_none());
        assert!(queue.peek_ready(0).is_none());
        queue.resume();
        assert_eq!(queue.peek_ready(0).map(|a| a.id.clone()), Some("a".into()));
    }

    #[test]
    fn eviction_fails_incoming_action_behind_a_failed_chain() {
        let mut queue = small_queue(3);
        queue.enqueue(action("a", 1), 0).unwrap();
        queue.enqueue(action("b", 1).after("a"), 0).unwrap();
        queue.enqueue(action("x", 5), 0).unwrap();

        let outcome = queue.enqueue(action("c", 1).after("b"), 0).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Overflow { evicted: "a".into() });
        for id in ["a", "b", "c"] {
            assert_eq!(queue.status(&id.into()), Some(ActionStatus::Failed), "{id}");
        }
        assert_eq!(
            queue.get(&"c".into()).unwrap().failure,
            Some(ActionFailure::PrerequisiteFailed {
                prerequisite: "b".into()
            })
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "x".into());
        assert!(queue.dequeue_ready(0).is_none());
    }

    #[test]
    fn retry_into_a_full_queue_respects_capacity() {
        let mut queue = small_queue(2);
        queue.enqueue(action("run", 5).with_max_attempts(3), 0).unwrap();
        let running = queue.dequeue_ready(0).unwrap();
        queue.enqueue(action("p1", 1), 0).unwrap();
        queue.enqueue(action("p2", 1), 0).unwrap();

        let outcome = queue.ack_failure(&running.id, "busy", 1).unwrap();
        assert!(matches!(outcome, AckOutcome::Retrying { attempts: 1, .. }));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.status(&"p1".into()), Some(ActionStatus::Failed));
        assert_eq!(queue.stats().evicted, 1);
    }

    #[test]
    fn retry_ranking_below_a_full_queue_is_dropped() {
        let mut queue = small_queue(1);
        queue.enqueue(action("run", 1).with_max_attempts(3), 0).unwrap();
        let running = queue.dequeue_ready(0).unwrap();
        queue.enqueue(action("urgent", 9), 0).unwrap();

        assert_eq!(
            queue.ack_failure(&running.id, "busy", 1).unwrap(),
            AckOutcome::Failed
        );
        assert_eq!(queue.depth(), 1);
        assert_eq!(
            queue.get(&"run".into()).unwrap().failure,
            Some(ActionFailure::Evicted)
        );
    }

    #[test]
    fn running_action_without_reply_times_out_into_a_retry() {
        let mut queue = ActionQueue::new(QueueConfig {
            execution_timeout_ticks: 5,
            ..QueueConfig::default()
        });
        queue.enqueue(action("a", 1).with_max_attempts(2), 0).unwrap();
        queue.dequeue_ready(0).unwrap();

        assert!(queue.time_out_running(4).is_empty());
        assert_eq!(queue.time_out_running(5), vec![ActionId::from("a")]);
        assert_eq!(queue.status(&"a".into()), Some(ActionStatus::Pending));
        assert_eq!(queue.in_flight(), 0);

        let again = queue.dequeue_ready(10).unwrap();
        assert_eq!(again.dispatched_at, Some(10));
        assert_eq!(queue.time_out_running(15), vec![ActionId::from("a")]);
        assert_eq!(
            queue.get(&"a".into()).unwrap().failure,
            Some(ActionFailure::Exhausted { attempts: 2 })
        );
        assert_eq!(queue.stats().timed_out, 2);
    }

    #[test]
    fn held_owner_is_skipped_until_released() {
        let mut queue = ActionQueue::default();
        queue.enqueue(action("held", 9).owned_by("t"), 0).unwrap();
        queue.enqueue(action("free", 1).owned_by("other"), 0).unwrap();

        queue.hold_owner(&"t".into());
        assert_eq!(queue.peek_ready(0).map(|a| a.id.clone()), Some("free".into()));
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "free".into());
        assert!(queue.dequeue_ready(0).is_none());

        queue.release_owner(&"t".into());
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "held".into());
    }
}
