//! The synchronous interior of the limiter.
//!
//! Everything time-dependent in this crate funnels through [`Gate::request`],
//! a pure function of elapsed ticks, the configured rate and the caller
//! identity. Keeping it free of clocks and locks makes it the piece about
//! which we can state proof claims.

use rustc_hash::FxHashMap;

use super::{RATE_DISABLED, TICKS_PER_SECOND};

/// How long a caller is told to back off when the rate is pinned to zero.
/// With a zero rate there is no next-eligible instant to report, so callers
/// are asked to retry after a full interval.
pub(crate) const ZERO_RATE_RETRY_TICKS: u64 = TICKS_PER_SECOND;

/// Admission bookkeeping for all callers of one limiter.
///
/// Per caller the gate records the tick at which that caller next becomes
/// eligible for admission. A grant advances the caller's next-eligible tick
/// by one whole admission interval; a denial reports the gap without
/// consuming anything. The gate also counts grants per one-second window so
/// the owning limiter can report recent throughput.
#[derive(Debug)]
pub(crate) struct Gate {
    /// Tick at which each caller may next be admitted.
    next_eligible: FxHashMap<usize, u64>,
    /// Tick at which the current accounting window opened.
    window_start: u64,
    /// Grants observed in the current accounting window.
    window_grants: u64,
    /// Grants observed in the last completed accounting window.
    last_window_grants: u64,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            next_eligible: FxHashMap::default(),
            window_start: 0,
            window_grants: 0,
            last_window_grants: 0,
        }
    }

    /// Decide admission for `caller_id` at absolute time `ticks_elapsed`
    /// under `max_rate` admissions per second. Returns `0` on a grant and
    /// otherwise the number of ticks the caller should wait.
    ///
    /// Rates above one admission per tick are clamped to one per tick.
    pub(crate) fn request(&mut self, ticks_elapsed: u64, max_rate: u64, caller_id: usize) -> u64 {
        self.roll_window(ticks_elapsed);

        if max_rate == RATE_DISABLED {
            self.window_grants += 1;
            return 0;
        }
        if max_rate == 0 {
            return ZERO_RATE_RETRY_TICKS;
        }

        let interval = TICKS_PER_SECOND.div_ceil(max_rate).max(1);
        let next = self.next_eligible.entry(caller_id).or_insert(0);
        if *next <= ticks_elapsed {
            // Advance from now rather than from the stale next-eligible tick
            // so an idle caller cannot bank a burst.
            *next = ticks_elapsed + interval;
            self.window_grants += 1;
            0
        } else {
            *next - ticks_elapsed
        }
    }

    /// Grants per second over the last completed accounting window, rolling
    /// the window forward first so a long-idle gate reports zero.
    pub(crate) fn recent_grants(&mut self, ticks_elapsed: u64) -> u64 {
        self.roll_window(ticks_elapsed);
        self.last_window_grants
    }

    /// Forget all per-caller state.
    pub(crate) fn forget(&mut self, caller_id: usize) {
        self.next_eligible.remove(&caller_id);
    }

    pub(crate) fn clear(&mut self) {
        self.next_eligible.clear();
        self.window_grants = 0;
        self.last_window_grants = 0;
    }

    fn roll_window(&mut self, ticks_elapsed: u64) {
        let elapsed = ticks_elapsed.saturating_sub(self.window_start);
        if elapsed < TICKS_PER_SECOND {
            return;
        }
        // A gap of more than one window means the most recently completed
        // window saw no grants at all.
        self.last_window_grants = if elapsed < 2 * TICKS_PER_SECOND {
            self.window_grants
        } else {
            0
        };
        self.window_grants = 0;
        self.window_start = ticks_elapsed - (elapsed % TICKS_PER_SECOND);
    }
}

#[cfg(kani)]
mod verification {
    use crate::RATE_DISABLED;
    use crate::gate::Gate;

    /// A disabled rate admits every request immediately.
    #[kani::proof]
    fn disabled_rate_always_admits() {
        let mut gate = Gate::new();
        let ticks_elapsed: u64 = kani::any();
        let caller_id: usize = kani::any();

        let wait = gate.request(ticks_elapsed, RATE_DISABLED, caller_id);
        kani::assert(wait == 0, "Disabled rate must admit immediately.");
    }

    /// A zero rate denies every request with a positive wait.
    #[kani::proof]
    fn zero_rate_never_admits() {
        let mut gate = Gate::new();
        let ticks_elapsed: u64 = kani::any();
        let caller_id: usize = kani::any();

        let wait = gate.request(ticks_elapsed, 0, caller_id);
        kani::assert(wait > 0, "Zero rate must always deny.");
    }

    /// An admitted caller is not eligible again at the same instant.
    #[kani::proof]
    fn grant_blocks_immediate_repeat() {
        let mut gate = Gate::new();
        let ticks_elapsed: u64 = kani::any_where(|t: &u64| *t < u64::MAX / 2);
        let max_rate: u64 = kani::any_where(|r: &u64| *r > 0 && *r < RATE_DISABLED);
        let caller_id: usize = kani::any();

        let first = gate.request(ticks_elapsed, max_rate, caller_id);
        kani::assert(first == 0, "A fresh caller must be admitted.");

        let second = gate.request(ticks_elapsed, max_rate, caller_id);
        kani::assert(second > 0, "A repeat at the same instant must wait.");
    }
}
