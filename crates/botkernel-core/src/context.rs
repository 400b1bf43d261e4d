//! Per-agent context passed by reference into every tick.
//!
//! Read phase: the world snapshot, replaced wholesale at the start of a tick.
//! Write phase: the result inbox (network producers) and the scratch
//! blackboard/signals (hooks and tasks).

use std::collections::BTreeMap;
use std::sync::Arc;

use ai_core::{Blackboard, Tick, TickContext, WorldSnapshot};
use serde::Serialize;

use crate::config::BehaviorConfig;
use crate::inbox::ResultInbox;

/// Named scratch value read by guards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Signal {
    Flag(bool),
    Number(f64),
}

#[derive(Debug)]
pub struct Context {
    clock: TickContext,
    world: Arc<WorldSnapshot>,
    inbox: ResultInbox,
    signals: BTreeMap<String, Signal>,
    pub blackboard: Blackboard,
    pub behavior: BehaviorConfig,
}

impl Context {
    pub fn new(interval_ms: u64, behavior: BehaviorConfig) -> Self {
        Self {
            clock: TickContext::new(interval_ms),
            world: Arc::new(WorldSnapshot::default()),
            inbox: ResultInbox::new(),
            signals: BTreeMap::new(),
            blackboard: Blackboard::new(),
            behavior,
        }
    }

    pub fn now(&self) -> Tick {
        self.clock.tick
    }

    pub fn clock(&self) -> &TickContext {
        &self.clock
    }

    /// Moves the clock one tick forward. The dispatcher calls this first
    /// thing in every tick.
    pub fn advance(&mut self) -> Tick {
        self.clock.advance()
    }

    pub fn world(&self) -> &WorldSnapshot {
        &self.world
    }

    /// Shared handle to the current snapshot, for readers outliving the tick.
    pub fn world_arc(&self) -> Arc<WorldSnapshot> {
        Arc::clone(&self.world)
    }

    pub fn replace_world(&mut self, snapshot: WorldSnapshot) {
        self.world = Arc::new(snapshot);
    }

    /// Producer handle for network adapters.
    pub fn inbox(&self) -> &ResultInbox {
        &self.inbox
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: bool) {
        self.signals.insert(name.into(), Signal::Flag(value));
    }

    pub fn set_number(&mut self, name: impl Into<String>, value: f64) {
        self.signals.insert(name.into(), Signal::Number(value));
    }

    /// `None` when unset or not a flag.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.signals.get(name) {
            Some(Signal::Flag(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.signals.get(name) {
            Some(Signal::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn clear_signal(&mut self, name: &str) -> Option<Signal> {
        self.signals.remove(name)
    }

    pub fn signals(&self) -> impl Iterator<Item = (&str, Signal)> {
        self.signals.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Full agent restart: clock, snapshot, scratch state and pending results.
    pub fn reset(&mut self) {
        self.clock = TickContext::new(self.clock.interval_ms);
        self.world = Arc::new(WorldSnapshot::default());
        self.signals.clear();
        self.blackboard.clear();
        self.inbox.drain();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(TickContext::default().interval_ms, BehaviorConfig::default())
    }
}
