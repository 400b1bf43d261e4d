/// Monotonic tick counter. All deadlines and backoff delays are expressed in ticks.
pub type Tick = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    /// Current tick; `0` before the first dispatcher cycle.
    pub tick: Tick,
    /// Nominal wall-clock length of one tick.
    pub interval_ms: u64,
}

impl Default for TickContext {
    fn default() -> Self {
        Self {
            tick: 0,
            interval_ms: 100,
        }
    }
}

impl TickContext {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            tick: 0,
            interval_ms: interval_ms.max(1),
        }
    }

    pub fn advance(&mut self) -> Tick {
        self.tick = self.tick.saturating_add(1);
        self.tick
    }

    pub fn after(&self, ticks: u64) -> Tick {
        self.tick.saturating_add(ticks)
    }

    /// Converts a wall-clock duration to ticks, rounding up.
    pub fn ticks_for_ms(&self, ms: u64) -> u64 {
        ms.div_ceil(self.interval_ms.max(1))
    }
}
