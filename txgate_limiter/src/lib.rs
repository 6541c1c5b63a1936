//! The txgate admission limiter.
//!
//! This library is the rate-limiting core of the txgate transaction
//! throttler. It answers exactly one question on the transaction hot path:
//! may this caller proceed right now, and if not, for how long should it back
//! off? The admission ceiling is adjustable at runtime; the intelligence that
//! decides *what* ceiling to impose lives in the txgate rate controller, not
//! here.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::float_cmp)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use tokio::time::{Duration, Instant};

mod gate;
use gate::Gate;

// All internal accounting is in ticks of one microsecond. One interval --
// the period over which the admission rate is expressed and throughput is
// counted -- is one second.
const TICKS_PER_SECOND: u64 = 1_000_000;

/// Sentinel rate at which the limiter admits every request immediately.
pub const RATE_DISABLED: u64 = u64::MAX;

/// Source of elapsed time for a [`Limiter`].
///
/// Implementations must be monotonic; wall-clock time is not acceptable.
/// Production code uses [`MonotonicClock`], tests substitute a manual clock.
pub trait Clock {
    /// Microsecond ticks elapsed since an arbitrary fixed origin.
    fn ticks_elapsed(&self) -> u64;
}

/// A clock that reads real monotonic time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    /// Ticks since this clock was created.
    ///
    /// # Panics
    ///
    /// Panics if more ticks elapse than fit in a `u64`, roughly 584,554
    /// years after creation.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let ticks: u128 = self.start.elapsed().as_micros();
        assert!(
            ticks <= u128::from(u64::MAX),
            "monotonic clock overflowed u64 ticks"
        );
        ticks as u64
    }
}

/// A thread-safe admission limiter with a runtime-adjustable maximum rate.
///
/// Each caller is identified by a small integer id and tracked
/// independently: callers with distinct ids do not slow each other down, and
/// each id is admitted at up to the configured rate. The txgate facade
/// funnels all transactions through a single id, making the configured rate
/// the whole throttler's admission ceiling.
#[derive(Debug)]
pub struct Limiter<C = MonotonicClock> {
    clock: C,
    /// Admissions per second. Read on every request without taking the gate
    /// lock; [`RATE_DISABLED`] admits everything, zero denies everything.
    max_rate: AtomicU64,
    gate: Mutex<Gate>,
}

impl Limiter<MonotonicClock> {
    /// Create a limiter driven by real monotonic time.
    #[must_use]
    pub fn new(max_rate: u64) -> Self {
        Self::with_clock(max_rate, MonotonicClock::default())
    }
}

impl<C> Limiter<C>
where
    C: Clock,
{
    /// Create a limiter with the given clock.
    pub fn with_clock(max_rate: u64, clock: C) -> Self {
        Self {
            clock,
            max_rate: AtomicU64::new(max_rate),
            gate: Mutex::new(Gate::new()),
        }
    }

    /// Decide admission for `caller_id` right now.
    ///
    /// Returns [`Duration::ZERO`] when the caller is admitted and otherwise
    /// the duration the caller should back off before asking again. Any
    /// positive return is a denial; nothing is consumed by it.
    pub fn request_admission(&self, caller_id: usize) -> Duration {
        let ticks = self.clock.ticks_elapsed();
        let max_rate = self.max_rate.load(Ordering::Acquire);
        let wait = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .request(ticks, max_rate, caller_id);
        Duration::from_micros(wait)
    }

    /// Replace the admission ceiling. Takes effect on subsequent requests;
    /// already-scheduled next-eligible times are not revisited.
    pub fn set_max_rate(&self, rate: u64) {
        self.max_rate.store(rate, Ordering::Release);
    }

    /// The current admission ceiling.
    #[must_use]
    pub fn max_rate(&self) -> u64 {
        self.max_rate.load(Ordering::Acquire)
    }

    /// Grants per second observed over the last completed one-second window.
    ///
    /// This is actual admitted throughput, not the configured ceiling; the
    /// rate controller uses it to bound how far it opens the ceiling beyond
    /// what callers demonstrably consume.
    pub fn recent_rate(&self) -> u64 {
        let ticks = self.clock.ticks_elapsed();
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_grants(ticks)
    }

    /// Forget per-caller state for `caller_id`. Called once per known id at
    /// shutdown.
    pub fn release(&self, caller_id: usize) {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(caller_id);
    }

    /// Drop all internal state.
    pub fn close(&self) {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use proptest::prelude::*;

    use super::{Clock, Duration, Limiter, RATE_DISABLED, TICKS_PER_SECOND};

    /// A clock advanced by hand, shared between a test and the limiter under
    /// test.
    #[derive(Debug, Clone, Default)]
    struct ManualClock {
        ticks: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn advance(&self, ticks: u64) {
            self.ticks.fetch_add(ticks, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn ticks_elapsed(&self) -> u64 {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn disabled_rate_admits_everything() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(RATE_DISABLED, clock);

        for _ in 0..1_000 {
            assert_eq!(limiter.request_admission(0), Duration::ZERO);
        }
    }

    #[test]
    fn zero_rate_denies_everything() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(0, clock.clone());

        for _ in 0..100 {
            assert!(limiter.request_admission(0) > Duration::ZERO);
            clock.advance(TICKS_PER_SECOND / 10);
        }
    }

    #[test]
    fn denied_caller_admitted_after_reported_wait() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(10, clock.clone());

        assert_eq!(limiter.request_admission(0), Duration::ZERO);
        let wait = limiter.request_admission(0);
        assert!(wait > Duration::ZERO);

        clock.advance(u64::try_from(wait.as_micros()).expect("wait fits u64"));
        assert_eq!(limiter.request_admission(0), Duration::ZERO);
    }

    #[test]
    fn distinct_callers_do_not_contend() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(10, clock);

        assert_eq!(limiter.request_admission(0), Duration::ZERO);
        // Caller 1 is unaffected by caller 0's consumed slot.
        assert_eq!(limiter.request_admission(1), Duration::ZERO);
    }

    #[test]
    fn release_forgets_scheduled_state() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(1, clock);

        assert_eq!(limiter.request_admission(0), Duration::ZERO);
        assert!(limiter.request_admission(0) > Duration::ZERO);

        limiter.release(0);
        // A released caller starts fresh and is immediately eligible.
        assert_eq!(limiter.request_admission(0), Duration::ZERO);
    }

    #[test]
    fn rate_change_applies_to_subsequent_requests() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(0, clock.clone());

        assert!(limiter.request_admission(0) > Duration::ZERO);

        limiter.set_max_rate(100);
        clock.advance(1);
        assert_eq!(limiter.request_admission(0), Duration::ZERO);
    }

    #[test]
    fn recent_rate_reports_last_completed_window() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(10, clock.clone());

        // Ten grants spread over the first window.
        for _ in 0..10 {
            assert_eq!(limiter.request_admission(0), Duration::ZERO);
            clock.advance(TICKS_PER_SECOND / 10);
        }
        assert_eq!(limiter.recent_rate(), 10);
    }

    #[test]
    fn recent_rate_decays_to_zero_when_idle() {
        let clock = ManualClock::default();
        let limiter = Limiter::with_clock(10, clock.clone());

        assert_eq!(limiter.request_admission(0), Duration::ZERO);
        clock.advance(3 * TICKS_PER_SECOND);
        assert_eq!(limiter.recent_rate(), 0);
    }

    proptest! {
        #[test]
        fn set_then_get_round_trips(rate in any::<u64>()) {
            let limiter = Limiter::with_clock(0, ManualClock::default());
            limiter.set_max_rate(rate);
            prop_assert_eq!(limiter.max_rate(), rate);
        }

        #[test]
        fn grants_per_window_bounded_by_rate(
            rate in 1_u64..=1_000,
            step_divisor in 2_u64..=5,
        ) {
            let clock = ManualClock::default();
            let limiter = Limiter::with_clock(rate, clock.clone());

            let interval = TICKS_PER_SECOND.div_ceil(rate);
            let step = (interval / step_divisor).max(1);

            // Hammer the limiter for one simulated second at a cadence
            // faster than the admission interval.
            let mut grants = 0_u64;
            while clock.ticks_elapsed() < TICKS_PER_SECOND {
                if limiter.request_admission(0) == Duration::ZERO {
                    grants += 1;
                }
                clock.advance(step);
            }
            prop_assert!(grants <= rate);
        }

        #[test]
        fn wait_is_never_longer_than_admission_interval(rate in 1_u64..=1_000_000) {
            let clock = ManualClock::default();
            let limiter = Limiter::with_clock(rate, clock);

            prop_assert_eq!(limiter.request_admission(0), Duration::ZERO);
            let wait = limiter.request_admission(0);
            let interval = TICKS_PER_SECOND.div_ceil(rate);
            prop_assert!(wait.as_micros() <= u128::from(interval));
        }
    }
}
