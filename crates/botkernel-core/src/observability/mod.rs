//! Observability - scheduler events, the JSONL event log, and status snapshots.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ai_core::Tick;
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inbox::ActionHandle;
use crate::kernel::{
    ActionFailure, ActionId, ActionStatus, DispatcherStats, QueueStats, TaskEvent, TaskStats,
};
use crate::state::{AgentState, TaskNode};

/// Something the kernel did during a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StateChanged {
        from: AgentState,
        to: AgentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        via: Option<String>,
    },
    GuardFailed {
        from: AgentState,
        to: AgentState,
        transition: String,
        error: String,
    },
    Task(TaskEvent),
    ActionDispatched {
        action: ActionId,
        handle: ActionHandle,
    },
    ActionSettled {
        action: ActionId,
        status: ActionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<ActionFailure>,
    },
    QueueOverflow {
        evicted: ActionId,
    },
    /// A posted result arrived for an action that is no longer live.
    ResultDiscarded {
        handle: ActionHandle,
    },
}

impl SchedulerEvent {
    /// Short label used by log lines and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::GuardFailed { .. } => "guard_failed",
            Self::Task(_) => "task",
            Self::ActionDispatched { .. } => "action_dispatched",
            Self::ActionSettled { .. } => "action_settled",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::ResultDiscarded { .. } => "result_discarded",
        }
    }
}

/// A scheduler event stamped with wall-clock time and tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub timestamp: DateTime<Utc>,
    pub tick: Tick,
    pub event: SchedulerEvent,
}

impl KernelEvent {
    pub fn new(tick: Tick, event: SchedulerEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            tick,
            event,
        }
    }
}

/// Appends kernel events to a JSONL file.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    events_path: PathBuf,
}

impl EventEmitter {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.events_path
    }

    /// Emit an event.
    pub fn emit(&self, event: &KernelEvent) -> Result<()> {
        self.emit_all(std::slice::from_ref(event))
    }

    /// Emit a batch with one open/append.
    pub fn emit_all(&self, events: &[KernelEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("Failed to open {}", self.events_path.display()))?;

        for event in events {
            let line = serde_json::to_string(event)?;
            writeln!(file, "{}", line)?;
        }

        Ok(())
    }

    /// Read recent events. Unreadable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Vec<KernelEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<KernelEvent> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        // Return last N events
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }
}

/// Kernel status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub state: AgentState,
    pub tick: Tick,
    pub ticks_in_state: u64,
    pub tasks: Vec<TaskNode>,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub queue_paused: bool,
    /// Action `dequeue_ready` would return right now.
    pub next_action: Option<ActionId>,
    pub dispatcher: DispatcherStats,
    pub queue: QueueStats,
    pub task_stats: TaskStats,
    pub recent_events: Vec<KernelEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn changed(tick: Tick) -> KernelEvent {
        KernelEvent::new(
            tick,
            SchedulerEvent::StateChanged {
                from: AgentState::Off,
                to: AgentState::Manual,
                via: Some("off->manual".into()),
            },
        )
    }

    #[test]
    fn read_recent_returns_tail() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("nested/events.jsonl"));

        let events: Vec<_> = (1..=5).map(changed).collect();
        emitter.emit_all(&events).unwrap();
        emitter
            .emit(&KernelEvent::new(
                6,
                SchedulerEvent::QueueOverflow {
                    evicted: "a".into(),
                },
            ))
            .unwrap();

        let recent = emitter.read_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tick, 5);
        assert_eq!(recent[1].event.kind(), "queue_overflow");
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("none.jsonl"));
        assert!(emitter.read_recent(10).is_empty());
    }

    #[test]
    fn events_serialize_tagged() {
        let value = serde_json::to_value(changed(3)).unwrap();
        assert_eq!(value["event"]["type"], "state_changed");
        assert_eq!(value["event"]["to"], "manual");
        assert_eq!(value["tick"], 3);
    }
}
