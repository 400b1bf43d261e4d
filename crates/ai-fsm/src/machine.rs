use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::{GuardError, StateId, Transition};

/// Entry/exit hook. Receives the context and the caller's effect sink.
///
/// Hooks run synchronously inside `tick` and must not block.
pub type Hook<C, E> = Box<dyn FnMut(&C, &mut E) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    #[error("state `{0}` is not registered")]
    UnknownState(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Max state changes kept in [`StateMachine::history`].
    pub history_limit: usize,
    /// Max guard failures kept in [`StateMachine::guard_failures`].
    pub failure_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            failure_limit: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange<S> {
    pub tick: u64,
    pub from: S,
    pub to: S,
    /// Transition name, `None` for forced changes.
    pub via: Option<Cow<'static, str>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFailure<S> {
    pub tick: u64,
    pub from: S,
    pub to: S,
    pub transition: Cow<'static, str>,
    pub error: GuardError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    pub entries: u64,
    pub ticks_spent: u64,
    pub last_entered: Option<u64>,
}

struct StateEntry<S, C, E>
where
    S: StateId,
{
    transitions: Vec<Transition<S, C>>,
    on_enter: Vec<Hook<C, E>>,
    on_exit: Vec<Hook<C, E>>,
    stats: StateStats,
}

impl<S, C, E> Default for StateEntry<S, C, E>
where
    S: StateId,
{
    fn default() -> Self {
        Self {
            transitions: Vec::new(),
            on_enter: Vec::new(),
            on_exit: Vec::new(),
            stats: StateStats::default(),
        }
    }
}

/// Guarded state machine over a closed state catalog `S`, a read-only context
/// `C` and an effect sink `E` handed to hooks.
pub struct StateMachine<S, C, E>
where
    S: StateId,
{
    states: BTreeMap<S, StateEntry<S, C, E>>,
    current: S,
    entered_at: u64,
    tick: u64,
    transition_count: u64,
    guard_error_count: u64,
    history: VecDeque<StateChange<S>>,
    guard_failures: VecDeque<GuardFailure<S>>,
    config: MachineConfig,
}

impl<S, C, E> StateMachine<S, C, E>
where
    S: StateId,
{
    /// Creates a machine in `initial`, which is registered implicitly.
    pub fn new(initial: S) -> Self {
        let mut states = BTreeMap::new();
        let mut entry = StateEntry::default();
        entry.stats.entries = 1;
        entry.stats.last_entered = Some(0);
        states.insert(initial, entry);

        Self {
            states,
            current: initial,
            entered_at: 0,
            tick: 0,
            transition_count: 0,
            guard_error_count: 0,
            history: VecDeque::new(),
            guard_failures: VecDeque::new(),
            config: MachineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a state. Returns `false` if it was already known.
    pub fn register_state(&mut self, state: S) -> bool {
        if self.states.contains_key(&state) {
            return false;
        }
        self.states.insert(state, StateEntry::default());
        true
    }

    pub fn register_states(&mut self, states: impl IntoIterator<Item = S>) {
        for state in states {
            self.register_state(state);
        }
    }

    pub fn is_registered(&self, state: S) -> bool {
        self.states.contains_key(&state)
    }

    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.states.keys().copied()
    }

    /// Registers a guarded transition named `"from->to"`.
    pub fn register_transition<G>(
        &mut self,
        from: S,
        to: S,
        guard: G,
        priority: i32,
    ) -> Result<(), FsmError>
    where
        G: Fn(&C) -> Result<bool, GuardError> + Send + 'static,
    {
        self.add_transition(Transition::new(from, to, guard).with_priority(priority))
    }

    pub fn add_transition(&mut self, transition: Transition<S, C>) -> Result<(), FsmError> {
        if !self.states.contains_key(&transition.to) {
            return Err(FsmError::UnknownState(transition.to.name()));
        }
        let entry = self
            .states
            .get_mut(&transition.from)
            .ok_or(FsmError::UnknownState(transition.from.name()))?;

        debug!(
            transition = %transition.name,
            priority = transition.priority,
            "Registering transition"
        );

        // Stable insert keeps registration order among equal priorities.
        let at = entry
            .transitions
            .iter()
            .position(|t| t.priority < transition.priority)
            .unwrap_or(entry.transitions.len());
        entry.transitions.insert(at, transition);
        Ok(())
    }

    pub fn on_enter<H>(&mut self, state: S, hook: H) -> Result<(), FsmError>
    where
        H: FnMut(&C, &mut E) + Send + 'static,
    {
        let entry = self
            .states
            .get_mut(&state)
            .ok_or(FsmError::UnknownState(state.name()))?;
        entry.on_enter.push(Box::new(hook));
        Ok(())
    }

    pub fn on_exit<H>(&mut self, state: S, hook: H) -> Result<(), FsmError>
    where
        H: FnMut(&C, &mut E) + Send + 'static,
    {
        let entry = self
            .states
            .get_mut(&state)
            .ok_or(FsmError::UnknownState(state.name()))?;
        entry.on_exit.push(Box::new(hook));
        Ok(())
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn current_name(&self) -> &'static str {
        self.current.name()
    }

    /// `true` if the active state is one of `states` or a descendant of one.
    pub fn is_in(&self, state: S) -> bool {
        self.current.is_within(state)
    }

    /// `true` if `state` was entered within the last `last_n` changes
    /// (or is active now).
    pub fn was_in(&self, state: S, last_n: usize) -> bool {
        self.current == state
            || self
                .history
                .iter()
                .rev()
                .take(last_n)
                .any(|change| change.to == state || change.from == state)
    }

    pub fn ticks_in_state(&self) -> u64 {
        self.tick.saturating_sub(self.entered_at)
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn guard_error_count(&self) -> u64 {
        self.guard_error_count
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &StateChange<S>> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn guard_failures(&self) -> impl DoubleEndedIterator<Item = &GuardFailure<S>> + ExactSizeIterator {
        self.guard_failures.iter()
    }

    pub fn stats(&self, state: S) -> Option<StateStats> {
        self.states.get(&state).map(|entry| entry.stats)
    }

    /// Advances the machine by one tick.
    ///
    /// Evaluates the transitions of the active state and then those inherited
    /// from its ancestors, each group in descending priority. The first guard
    /// returning `true` fires; guard errors are recorded and skipped.
    pub fn tick(&mut self, ctx: &C, effects: &mut E) -> S {
        self.tick = self.tick.saturating_add(1);
        if let Some(entry) = self.states.get_mut(&self.current) {
            entry.stats.ticks_spent = entry.stats.ticks_spent.saturating_add(1);
        }

        let (fired, failures) = self.select(ctx);
        for failure in failures {
            self.record_guard_failure(failure);
        }

        if let Some((to, name)) = fired {
            self.change_state(to, Some(name), ctx, effects);
        }

        self.current
    }

    /// Targets whose guards currently match, in evaluation order.
    pub fn possible_transitions(&self, ctx: &C) -> Vec<S> {
        self.candidates()
            .filter(|t| matches!(t.evaluate(ctx), Ok(true)))
            .map(|t| t.to)
            .collect()
    }

    /// Switches to `state` without evaluating guards. Hooks still run.
    ///
    /// Returns `Ok(false)` if `state` is already active.
    pub fn force(&mut self, state: S, ctx: &C, effects: &mut E) -> Result<bool, FsmError> {
        if !self.states.contains_key(&state) {
            return Err(FsmError::UnknownState(state.name()));
        }
        if state == self.current {
            return Ok(false);
        }
        info!(from = self.current.name(), to = state.name(), "Forcing state");
        self.change_state(state, None, ctx, effects);
        Ok(true)
    }

    /// Returns to `initial`, clearing history and statistics. Hooks do not run.
    pub fn reset(&mut self, initial: S) -> Result<(), FsmError> {
        if !self.states.contains_key(&initial) {
            return Err(FsmError::UnknownState(initial.name()));
        }
        for entry in self.states.values_mut() {
            entry.stats = StateStats::default();
        }
        self.current = initial;
        self.tick = 0;
        self.entered_at = 0;
        self.transition_count = 0;
        self.guard_error_count = 0;
        self.history.clear();
        self.guard_failures.clear();
        if let Some(entry) = self.states.get_mut(&initial) {
            entry.stats.entries = 1;
            entry.stats.last_entered = Some(0);
        }
        Ok(())
    }

    fn candidates(&self) -> impl Iterator<Item = &Transition<S, C>> + '_ {
        let current = self.current;
        let own = self
            .states
            .get(&current)
            .into_iter()
            .flat_map(|entry| entry.transitions.iter());
        let inherited = current
            .ancestors()
            .into_iter()
            .filter_map(move |ancestor| self.states.get(&ancestor))
            .flat_map(|entry| entry.transitions.iter())
            .filter(move |t| t.applies_in(current));
        own.chain(inherited)
    }

    #[allow(clippy::type_complexity)]
    fn select(&self, ctx: &C) -> (Option<(S, Cow<'static, str>)>, Vec<GuardFailure<S>>) {
        let mut failures = Vec::new();
        for transition in self.candidates() {
            match transition.evaluate(ctx) {
                Ok(true) => return (Some((transition.to, transition.name.clone())), failures),
                Ok(false) => {}
                Err(error) => failures.push(GuardFailure {
                    tick: self.tick,
                    from: self.current,
                    to: transition.to,
                    transition: transition.name.clone(),
                    error,
                }),
            }
        }
        (None, failures)
    }

    fn record_guard_failure(&mut self, failure: GuardFailure<S>) {
        warn!(
            transition = %failure.transition,
            error = %failure.error,
            "Guard evaluation failed, treating as no match"
        );
        self.guard_error_count = self.guard_error_count.saturating_add(1);
        self.guard_failures.push_back(failure);
        while self.guard_failures.len() > self.config.failure_limit {
            self.guard_failures.pop_front();
        }
    }

    fn change_state(&mut self, to: S, via: Option<Cow<'static, str>>, ctx: &C, effects: &mut E) {
        let from = self.current;

        if let Some(entry) = self.states.get_mut(&from) {
            for hook in entry.on_exit.iter_mut() {
                hook(ctx, effects);
            }
        }

        self.current = to;
        self.entered_at = self.tick;
        self.transition_count = self.transition_count.saturating_add(1);

        if let Some(entry) = self.states.get_mut(&to) {
            entry.stats.entries = entry.stats.entries.saturating_add(1);
            entry.stats.last_entered = Some(self.tick);
            for hook in entry.on_enter.iter_mut() {
                hook(ctx, effects);
            }
        }

        info!(
            from = from.name(),
            to = to.name(),
            via = via.as_deref().unwrap_or("forced"),
            "State transition"
        );

        self.history.push_back(StateChange {
            tick: self.tick,
            from,
            to,
            via,
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }
}
