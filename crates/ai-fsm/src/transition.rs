use std::borrow::Cow;

use ai_core::BlackboardError;

use crate::StateId;

/// A guard could not be evaluated.
///
/// The machine treats this as "did not match"; it is never fatal to a tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("missing context value: {0}")]
    Missing(String),

    #[error(transparent)]
    Blackboard(#[from] BlackboardError),

    #[error("guard failed: {0}")]
    Failed(String),
}

/// Pure predicate over the context.
pub type GuardFn<C> = Box<dyn Fn(&C) -> Result<bool, GuardError> + Send>;

pub struct Transition<S, C>
where
    S: StateId,
{
    pub name: Cow<'static, str>,
    pub from: S,
    pub to: S,
    pub priority: i32,
    /// Descendants of `from` that do not inherit this transition.
    excluded: Vec<S>,
    guard: GuardFn<C>,
}

impl<S, C> Transition<S, C>
where
    S: StateId,
{
    pub fn new<G>(from: S, to: S, guard: G) -> Self
    where
        G: Fn(&C) -> Result<bool, GuardError> + Send + 'static,
    {
        Self {
            name: Cow::Owned(format!("{}->{}", from.name(), to.name())),
            from,
            to,
            priority: 0,
            excluded: Vec::new(),
            guard: Box::new(guard),
        }
    }

    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Keeps `state` from inheriting this transition from its ancestor.
    pub fn not_inherited_by(mut self, state: S) -> Self {
        self.excluded.push(state);
        self
    }

    /// Whether a machine in `state` considers this transition.
    pub fn applies_in(&self, state: S) -> bool {
        state == self.from || (state != self.to && !self.excluded.contains(&state))
    }

    pub fn evaluate(&self, ctx: &C) -> Result<bool, GuardError> {
        (self.guard)(ctx)
    }
}

impl<S, C> std::fmt::Debug for Transition<S, C>
where
    S: StateId,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("priority", &self.priority)
            .field("excluded", &self.excluded)
            .finish_non_exhaustive()
    }
}
