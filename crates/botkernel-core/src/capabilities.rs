//! Capability registry - named extension handlers invoked on scheduler events.
//!
//! Capabilities are sorted by `order()` (lower first, registration order
//! among equals) and only see events for the extension points they declare.
//! A failing capability never fails the tick; the error is logged according
//! to its criticality and counted.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::context::Context;
use crate::observability::{EventEmitter, KernelEvent, SchedulerEvent};

/// Where in the tick a capability hooks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionPoint {
    StateChanged,
    GuardFailed,
    TaskLifecycle,
    ActionDispatched,
    ActionSettled,
    QueueOverflow,
    ResultDiscarded,
}

impl ExtensionPoint {
    pub const ALL: &'static [ExtensionPoint] = &[
        ExtensionPoint::StateChanged,
        ExtensionPoint::GuardFailed,
        ExtensionPoint::TaskLifecycle,
        ExtensionPoint::ActionDispatched,
        ExtensionPoint::ActionSettled,
        ExtensionPoint::QueueOverflow,
        ExtensionPoint::ResultDiscarded,
    ];

    pub fn of(event: &SchedulerEvent) -> Self {
        match event {
            SchedulerEvent::StateChanged { .. } => Self::StateChanged,
            SchedulerEvent::GuardFailed { .. } => Self::GuardFailed,
            SchedulerEvent::Task(_) => Self::TaskLifecycle,
            SchedulerEvent::ActionDispatched { .. } => Self::ActionDispatched,
            SchedulerEvent::ActionSettled { .. } => Self::ActionSettled,
            SchedulerEvent::QueueOverflow { .. } => Self::QueueOverflow,
            SchedulerEvent::ResultDiscarded { .. } => Self::ResultDiscarded,
        }
    }
}

/// How loudly a failure of the capability is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Criticality {
    /// Logged at error level.
    #[default]
    Important,
    /// Logged at debug level.
    Optional,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability `{0}` is already registered")]
    DuplicateName(&'static str),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Capability: Send {
    fn name(&self) -> &'static str;

    fn points(&self) -> &'static [ExtensionPoint] {
        ExtensionPoint::ALL
    }

    fn order(&self) -> i32 {
        0
    }

    fn criticality(&self) -> Criticality {
        Criticality::Important
    }

    /// May write signals or blackboard values for the next tick's guards.
    fn handle(&mut self, event: &KernelEvent, ctx: &mut Context) -> Result<(), CapabilityError>;
}

/// Capability built from a closure.
pub struct FnCapability<F> {
    name: &'static str,
    points: &'static [ExtensionPoint],
    order: i32,
    handler: F,
}

impl<F> FnCapability<F>
where
    F: FnMut(&KernelEvent, &mut Context) -> Result<(), CapabilityError> + Send,
{
    pub fn new(name: &'static str, points: &'static [ExtensionPoint], handler: F) -> Self {
        Self {
            name,
            points,
            order: 0,
            handler,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl<F> Capability for FnCapability<F>
where
    F: FnMut(&KernelEvent, &mut Context) -> Result<(), CapabilityError> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn points(&self) -> &'static [ExtensionPoint] {
        self.points
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn handle(&mut self, event: &KernelEvent, ctx: &mut Context) -> Result<(), CapabilityError> {
        (self.handler)(event, ctx)
    }
}

/// Appends every event to the JSONL event log.
pub struct EventLog {
    emitter: EventEmitter,
}

impl EventLog {
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }
}

impl Capability for EventLog {
    fn name(&self) -> &'static str {
        "event-log"
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    fn handle(&mut self, event: &KernelEvent, _ctx: &mut Context) -> Result<(), CapabilityError> {
        self.emitter.emit(event)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Box<dyn Capability>>,
    failures: BTreeMap<&'static str, u64>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) -> Result<(), CapabilityError> {
        let name = capability.name();
        if self.capabilities.iter().any(|c| c.name() == name) {
            return Err(CapabilityError::DuplicateName(name));
        }
        debug!(capability = name, order = capability.order(), "Registering capability");

        // Stable insert keeps registration order among equal orders.
        let at = self
            .capabilities
            .iter()
            .position(|c| c.order() > capability.order())
            .unwrap_or(self.capabilities.len());
        self.capabilities.insert(at, Box::new(capability));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.capabilities.len();
        self.capabilities.retain(|c| c.name() != name);
        before != self.capabilities.len()
    }

    /// Registered names with their order, in invocation order.
    pub fn handlers(&self) -> impl Iterator<Item = (&'static str, i32)> + '_ {
        self.capabilities.iter().map(|c| (c.name(), c.order()))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Failure count per capability name.
    pub fn failures(&self) -> &BTreeMap<&'static str, u64> {
        &self.failures
    }

    /// Offers each event to every capability subscribed to its point.
    pub fn dispatch(&mut self, events: &[KernelEvent], ctx: &mut Context) {
        for event in events {
            let point = ExtensionPoint::of(&event.event);
            for capability in self.capabilities.iter_mut() {
                if !capability.points().contains(&point) {
                    continue;
                }
                if let Err(e) = capability.handle(event, ctx) {
                    let name = capability.name();
                    *self.failures.entry(name).or_default() += 1;
                    match capability.criticality() {
                        Criticality::Important => error!(
                            capability = name,
                            event = event.event.kind(),
                            error = %e,
                            "Capability failed, continuing"
                        ),
                        Criticality::Optional => debug!(
                            capability = name,
                            event = event.event.kind(),
                            error = %e,
                            "Optional capability failed"
                        ),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("handlers", &self.handlers().collect::<Vec<_>>())
            .field("failures", &self.failures)
            .finish()
    }
}
