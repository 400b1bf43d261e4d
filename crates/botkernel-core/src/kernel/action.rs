//! Action model - atomic outbound commands toward the game server.

use std::fmt;

use ai_core::Tick;
use serde::{Deserialize, Serialize};

use crate::state::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Command families understood by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MoveTo,
    Walk,
    Teleport,
    Attack,
    UseSkill,
    CastSpell,
    TalkNpc,
    PickItem,
    UseItem,
    SendChat,
    PartyAction,
    GuildAction,
    BuyItem,
    SellItem,
    StoreItem,
    Sit,
    Stand,
    Wait,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionPayload {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(kind: ActionKind, params: serde_json::Value) -> Self {
        Self { kind, params }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Why an action left the live set without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ActionFailure {
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// The server rejected it outright.
    Fatal { message: String },
    DeadlineExpired { deadline: Tick },
    PrerequisiteFailed { prerequisite: ActionId },
    /// Pushed out of a full queue.
    Evicted,
    Cancelled,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts } => write!(f, "exhausted after {attempts} attempts"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
            Self::DeadlineExpired { deadline } => write!(f, "deadline {deadline} expired"),
            Self::PrerequisiteFailed { prerequisite } => {
                write!(f, "prerequisite {prerequisite} did not succeed")
            }
            Self::Evicted => f.write_str("evicted from a full queue"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub priority: i32,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    /// Acknowledged attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Tick at which a pending action expires.
    pub deadline: Option<Tick>,
    /// Prerequisites that have not succeeded yet.
    pub prerequisites: Vec<ActionId>,
    pub owner: Option<TaskId>,
    /// Earliest tick for the next dispatch (retry backoff).
    pub not_before: Tick,
    pub enqueued_at: Tick,
    /// Tick of the current dispatch while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<Tick>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ActionFailure>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Action {
    pub fn new(id: impl Into<ActionId>, priority: i32, payload: ActionPayload) -> Self {
        Self {
            id: id.into(),
            priority,
            payload,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts: 1,
            deadline: None,
            prerequisites: Vec::new(),
            owner: None,
            not_before: 0,
            enqueued_at: 0,
            dispatched_at: None,
            last_error: None,
            failure: None,
            seq: 0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Tick) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn after(mut self, prerequisite: impl Into<ActionId>) -> Self {
        self.prerequisites.push(prerequisite.into());
        self
    }

    pub fn owned_by(mut self, task: impl Into<TaskId>) -> Self {
        self.owner = Some(task.into());
        self
    }

    pub fn is_expired(&self, now: Tick) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Terminal record of an action, forwarded to task bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSettlement {
    pub id: ActionId,
    pub owner: Option<TaskId>,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ActionFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub tick: Tick,
}
