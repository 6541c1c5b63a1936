//! The lag-driven rate controller.
//!
//! Consumes per-replica replication-lag samples from the health fan-in and
//! periodically recomputes the admission ceiling installed in the
//! [`txgate_limiter::Limiter`], so that observed lag stays below the
//! configured target. The numeric policy itself is the synchronous
//! [`next_rate`] function; the background task only feeds it and pushes its
//! output into the limiter.
//!
//! ## Metrics
//!
//! `lag_samples`: Samples accepted by `record_lag`
//! `rate_adjustments`: Evaluation ticks that changed the installed rate
//! `max_rate`: Gauge reporting the currently installed rate

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

use txgate_limiter::Limiter;

use crate::healthcheck::{TabletHealth, TabletId};

/// Errors produced by [`ControllerConfig`] validation.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The rate installed on open must be positive.
    #[error("initial_rate must be positive")]
    ZeroInitialRate,
    /// The floor must stay positive so a trickle of admissions keeps
    /// flowing and the system can recover observability.
    #[error("min_rate must be positive")]
    ZeroMinRate,
    /// The opening rate may not start below the floor.
    #[error("initial_rate {initial_rate} must be at least min_rate {min_rate}")]
    InitialRateBelowFloor {
        /// Configured opening rate.
        initial_rate: u64,
        /// Configured floor.
        min_rate: u64,
    },
    /// A zero step would freeze the rate in the healthy direction.
    #[error("rate_increase_step must be positive")]
    ZeroIncreaseStep,
    /// The decrease factor must actually decrease.
    #[error("rate_decrease_factor {0} must be within (0, 1)")]
    DecreaseFactorOutOfRange(f64),
    /// Headroom below one would cap the rate under observed throughput.
    #[error("throughput_headroom {0} must be at least 1")]
    HeadroomOutOfRange(f64),
    /// The emergency threshold sits at or above the target, never below.
    #[error("emergency_lag_multiplier {0} must be at least 1")]
    EmergencyMultiplierOutOfRange(f64),
    /// The evaluation loop needs a positive period.
    #[error("evaluation_interval_secs must be positive")]
    ZeroEvaluationInterval,
    /// Samples must survive at least one evaluation tick, otherwise every
    /// tick sees an empty buffer.
    #[error("sample_staleness_secs {staleness} must be at least evaluation_interval_secs {interval}")]
    StalenessBelowInterval {
        /// Configured staleness window.
        staleness: u64,
        /// Configured evaluation period.
        interval: u64,
    },
    /// At least one sample per tablet must be retained.
    #[error("max_samples_per_tablet must be positive")]
    ZeroSamplesPerTablet,
}

fn default_initial_rate() -> u64 {
    100
}

fn default_min_rate() -> u64 {
    5
}

fn default_rate_increase_step() -> u64 {
    10
}

fn default_rate_decrease_factor() -> f64 {
    0.5
}

fn default_throughput_headroom() -> f64 {
    2.0
}

fn default_emergency_lag_multiplier() -> f64 {
    3.0
}

fn default_evaluation_interval_secs() -> u64 {
    2
}

fn default_sample_staleness_secs() -> u64 {
    10
}

fn default_max_samples_per_tablet() -> usize {
    3
}

/// Tuning for the lag-driven rate controller.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Admission rate installed when the throttler opens, before any lag
    /// samples have been observed.
    #[serde(default = "default_initial_rate")]
    pub initial_rate: u64,
    /// Floor below which the rate never drops while the throttler is
    /// enabled.
    #[serde(default = "default_min_rate")]
    pub min_rate: u64,
    /// Additive increase applied per evaluation tick while lag is at or
    /// below the target.
    #[serde(default = "default_rate_increase_step")]
    pub rate_increase_step: u64,
    /// Multiplicative decrease applied per evaluation tick while lag is
    /// above the target.
    #[serde(default = "default_rate_decrease_factor")]
    pub rate_decrease_factor: f64,
    /// How far beyond recently observed throughput the rate may grow. The
    /// growth ceiling is `recent throughput x this factor`.
    #[serde(default = "default_throughput_headroom")]
    pub throughput_headroom: f64,
    /// Lag beyond `target x this multiplier` drops the rate straight to the
    /// floor instead of decreasing gradually.
    #[serde(default = "default_emergency_lag_multiplier")]
    pub emergency_lag_multiplier: f64,
    /// Period of the evaluation loop, in seconds.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// Samples older than this, in seconds, are discarded; a replica with
    /// only stale samples is absent from the computation.
    #[serde(default = "default_sample_staleness_secs")]
    pub sample_staleness_secs: u64,
    /// Most recent samples retained per tablet.
    #[serde(default = "default_max_samples_per_tablet")]
    pub max_samples_per_tablet: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_rate: default_initial_rate(),
            min_rate: default_min_rate(),
            rate_increase_step: default_rate_increase_step(),
            rate_decrease_factor: default_rate_decrease_factor(),
            throughput_headroom: default_throughput_headroom(),
            emergency_lag_multiplier: default_emergency_lag_multiplier(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
            sample_staleness_secs: default_sample_staleness_secs(),
            max_samples_per_tablet: default_max_samples_per_tablet(),
        }
    }
}

impl ControllerConfig {
    /// Check every field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn verify(&self) -> Result<(), Error> {
        if self.initial_rate == 0 {
            return Err(Error::ZeroInitialRate);
        }
        if self.min_rate == 0 {
            return Err(Error::ZeroMinRate);
        }
        if self.initial_rate < self.min_rate {
            return Err(Error::InitialRateBelowFloor {
                initial_rate: self.initial_rate,
                min_rate: self.min_rate,
            });
        }
        if self.rate_increase_step == 0 {
            return Err(Error::ZeroIncreaseStep);
        }
        if !self.rate_decrease_factor.is_finite()
            || self.rate_decrease_factor <= 0.0
            || self.rate_decrease_factor >= 1.0
        {
            return Err(Error::DecreaseFactorOutOfRange(self.rate_decrease_factor));
        }
        if !self.throughput_headroom.is_finite() || self.throughput_headroom < 1.0 {
            return Err(Error::HeadroomOutOfRange(self.throughput_headroom));
        }
        if !self.emergency_lag_multiplier.is_finite() || self.emergency_lag_multiplier < 1.0 {
            return Err(Error::EmergencyMultiplierOutOfRange(
                self.emergency_lag_multiplier,
            ));
        }
        if self.evaluation_interval_secs == 0 {
            return Err(Error::ZeroEvaluationInterval);
        }
        if self.sample_staleness_secs < self.evaluation_interval_secs {
            return Err(Error::StalenessBelowInterval {
                staleness: self.sample_staleness_secs,
                interval: self.evaluation_interval_secs,
            });
        }
        if self.max_samples_per_tablet == 0 {
            return Err(Error::ZeroSamplesPerTablet);
        }
        Ok(())
    }

    /// Overlay `self` on `base`, treating zero fields of `self` as "keep the
    /// base value". Implements the `copy_zero_values = false` update mode.
    fn overlaid_on(self, base: Self) -> Self {
        fn pick_u64(new: u64, base: u64) -> u64 {
            if new == 0 { base } else { new }
        }
        #[allow(clippy::float_cmp)]
        fn pick_f64(new: f64, base: f64) -> f64 {
            if new == 0.0 { base } else { new }
        }
        fn pick_usize(new: usize, base: usize) -> usize {
            if new == 0 { base } else { new }
        }

        Self {
            initial_rate: pick_u64(self.initial_rate, base.initial_rate),
            min_rate: pick_u64(self.min_rate, base.min_rate),
            rate_increase_step: pick_u64(self.rate_increase_step, base.rate_increase_step),
            rate_decrease_factor: pick_f64(self.rate_decrease_factor, base.rate_decrease_factor),
            throughput_headroom: pick_f64(self.throughput_headroom, base.throughput_headroom),
            emergency_lag_multiplier: pick_f64(
                self.emergency_lag_multiplier,
                base.emergency_lag_multiplier,
            ),
            evaluation_interval_secs: pick_u64(
                self.evaluation_interval_secs,
                base.evaluation_interval_secs,
            ),
            sample_staleness_secs: pick_u64(
                self.sample_staleness_secs,
                base.sample_staleness_secs,
            ),
            max_samples_per_tablet: pick_usize(
                self.max_samples_per_tablet,
                base.max_samples_per_tablet,
            ),
        }
    }
}

/// Compute the rate to install given the current rate, recently observed
/// throughput and the worst retained replica lag.
///
/// Below or at the target the rate grows additively, bounded by a ceiling
/// derived from throughput callers actually achieved; the comparison against
/// the target is strict, so lag exactly at the target never decreases the
/// rate. Above the target the rate shrinks multiplicatively, and past the
/// emergency threshold it drops straight to the floor. The result never
/// falls below the floor and never falls below zero growth on a healthy
/// system.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn next_rate(
    cfg: &ControllerConfig,
    target_lag_secs: f64,
    current: u64,
    recent: u64,
    lag_secs: f64,
) -> u64 {
    if lag_secs > target_lag_secs * cfg.emergency_lag_multiplier {
        return cfg.min_rate;
    }
    if lag_secs > target_lag_secs {
        let decreased = (current as f64 * cfg.rate_decrease_factor) as u64;
        return decreased.max(cfg.min_rate);
    }
    let ceiling = ((recent as f64 * cfg.throughput_headroom) as u64).max(current);
    current.saturating_add(cfg.rate_increase_step).min(ceiling)
}

/// One replication-lag reading from one replica, stamped with the monotonic
/// instant at which the fan-in received it.
#[derive(Debug, Clone, Copy)]
struct LagSample {
    lag_secs: f64,
    received_at: Instant,
}

#[derive(Debug)]
struct Shared {
    limiter: Arc<Limiter>,
    target_lag_secs: f64,
    defaults: ControllerConfig,
    config: Mutex<ControllerConfig>,
    samples: Mutex<FxHashMap<TabletId, VecDeque<LagSample>>>,
}

impl Shared {
    fn config(&self) -> ControllerConfig {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, health: &TabletHealth, received_at: Instant) {
        let max_keep = self.config().max_samples_per_tablet;
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let per_tablet = samples.entry(health.tablet.clone()).or_default();
        per_tablet.push_back(LagSample {
            lag_secs: health.replication_lag_secs,
            received_at,
        });
        while per_tablet.len() > max_keep {
            per_tablet.pop_front();
        }
        counter!("lag_samples").increment(1);
    }

    /// One evaluation tick: discard stale samples, aggregate the worst
    /// retained lag and install the policy's answer in the limiter. No
    /// usable samples means no change; silence is not health.
    fn evaluate(&self, now: Instant) {
        let cfg = self.config();
        let staleness = Duration::from_secs(cfg.sample_staleness_secs);

        let worst = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            samples.retain(|_, per_tablet| {
                per_tablet.retain(|s| now.duration_since(s.received_at) <= staleness);
                !per_tablet.is_empty()
            });

            let mut worst: Option<f64> = None;
            for per_tablet in samples.values() {
                // Only the latest reading per replica counts; readings that
                // are not finite non-negative numbers are dropped.
                let Some(latest) = per_tablet.back() else {
                    continue;
                };
                if !latest.lag_secs.is_finite() || latest.lag_secs < 0.0 {
                    continue;
                }
                worst = Some(match worst {
                    Some(w) => w.max(latest.lag_secs),
                    None => latest.lag_secs,
                });
            }
            worst
        };

        let Some(lag_secs) = worst else {
            return;
        };

        let current = self.limiter.max_rate();
        let next = next_rate(
            &cfg,
            self.target_lag_secs,
            current,
            self.limiter.recent_rate(),
            lag_secs,
        );
        if next == current {
            return;
        }
        self.limiter.set_max_rate(next);
        #[allow(clippy::cast_precision_loss)]
        gauge!("max_rate").set(next as f64);
        counter!("rate_adjustments").increment(1);
        debug!(lag_secs, current, next, "adjusted admission rate");
    }
}

/// Hands lag samples from the health fan-in to the controller without
/// transferring ownership of it.
#[derive(Debug, Clone)]
pub(crate) struct LagRecorder {
    shared: Arc<Shared>,
}

impl LagRecorder {
    /// Record one retained health event. Non-blocking beyond a short
    /// critical section on the sample buffer.
    pub(crate) fn record_lag(&self, health: &TabletHealth, received_at: Instant) {
        self.shared.record(health, received_at);
    }
}

/// The lag-driven rate controller for one open interval.
///
/// Constructed by the facade on open; owns the evaluation loop task and is
/// the only component that mutates the limiter's max rate.
#[derive(Debug)]
pub(crate) struct LagController {
    shared: Arc<Shared>,
    shutdown: Option<txgate_signal::Notifier>,
}

impl LagController {
    /// Install `initial_rate` in the limiter and start the evaluation loop.
    pub(crate) fn spawn(
        limiter: Arc<Limiter>,
        max_replication_lag_secs: u64,
        config: ControllerConfig,
    ) -> Self {
        limiter.set_max_rate(config.initial_rate);

        #[allow(clippy::cast_precision_loss)]
        let shared = Arc::new(Shared {
            limiter,
            target_lag_secs: max_replication_lag_secs as f64,
            defaults: ControllerConfig::default(),
            config: Mutex::new(config),
            samples: Mutex::new(FxHashMap::default()),
        });

        let (notifier, listener) = txgate_signal::shutdown();
        let period = Duration::from_secs(config.evaluation_interval_secs);
        tokio::spawn(run(Arc::clone(&shared), listener, period));

        Self {
            shared,
            shutdown: Some(notifier),
        }
    }

    pub(crate) fn recorder(&self) -> LagRecorder {
        LagRecorder {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Replace the tuning parameters. With `copy_zero_values` the new block
    /// replaces the old wholesale; without it, zero fields of the new block
    /// keep their old values. The merged result is re-verified and rejected
    /// wholesale on failure, leaving the old parameters in place.
    ///
    /// The evaluation period is read once at spawn; a changed
    /// `evaluation_interval_secs` takes effect on the next open interval.
    pub(crate) fn update_configuration(
        &self,
        new: ControllerConfig,
        copy_zero_values: bool,
    ) -> Result<(), Error> {
        let mut config = self
            .shared
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let candidate = if copy_zero_values {
            new
        } else {
            new.overlaid_on(*config)
        };
        candidate.verify()?;
        *config = candidate;
        Ok(())
    }

    /// Restore the default tuning parameters.
    pub(crate) fn reset_configuration(&self) {
        let defaults = self.shared.defaults;
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = defaults;
    }

    pub(crate) fn get_configuration(&self) -> ControllerConfig {
        self.shared.config()
    }

    /// Stop the evaluation loop. Returns once the loop task has observed
    /// the shutdown; the rate last installed in the limiter is left as-is.
    pub(crate) async fn close(mut self) {
        if let Some(notifier) = self.shutdown.take() {
            notifier.notify_and_wait().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_tablets(&self) -> usize {
        self.shared
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn run(shared: Arc<Shared>, shutdown: txgate_signal::Listener, period: Duration) {
    let mut ticks = tokio::time::interval(period);
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                shared.evaluate(Instant::now());
            }
            () = &mut shutdown_wait => {
                debug!("rate controller shutting down");
                return;
            }
        }
    }
}
