//! The transaction throttler facade.
//!
//! The tablet server holds one [`Throttler`] per (keyspace, shard) target
//! and drives it through a simple lifecycle: configure once, then open and
//! close repeatedly as the target becomes known or configuration reloads.
//! Between an open and its close the facade owns the limiter, the rate
//! controller, the health fan-in and one fleet watcher per observation
//! cell; outside an open interval none of those exist.
//!
//! Intended usage:
//!
//! ```ignore
//! let mut throttler = Throttler::new(config, collaborators);
//! throttler.init_target(&target);
//! throttler.open().await?;
//!
//! // Before starting a transaction:
//! if throttler.throttle() {
//!     // ask the caller to back off
//! }
//!
//! throttler.close().await;
//! ```
//!
//! ## Metrics
//!
//! `admissions`: Transactions admitted by `throttle`
//! `denials`: Transactions asked to back off by `throttle`

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{error, info, warn};

use txgate_limiter::Limiter;

use crate::config::{Config, ShardTarget};
use crate::controller::{ControllerConfig, LagController};
use crate::healthcheck::{self, HealthCheck, HealthCheckFactory, HealthMonitor};
use crate::topology::{CellWatcher, DEFAULT_REFRESH_INTERVAL, TopologyServer};

/// Caller identity used on the admission path. All transactions funnel
/// through one logical producer, so a single id suffices.
const ADMISSION_CALLER_ID: usize = 0;

/// Errors produced by [`Throttler`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `open` was called before `init_target`.
    #[error("throttler target is not set; call init_target before open")]
    TargetNotSet,
    /// A configuration operation was attempted outside an open interval.
    #[error("throttler is closed")]
    Closed,
    /// The health stream could not be established on open.
    #[error(transparent)]
    HealthCheck(#[from] healthcheck::Error),
    /// A controller configuration update failed validation.
    #[error(transparent)]
    Controller(#[from] crate::controller::Error),
}

/// External capabilities the throttler consumes, injected at construction so
/// tests can substitute deterministic fakes.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Read-only topology directory used by the fleet watchers.
    pub topology: Arc<dyn TopologyServer>,
    /// Constructs the health stream for each open interval.
    pub health_checks: Arc<dyn HealthCheckFactory>,
}

/// Everything a throttler owns while open. Dropped wholesale on close;
/// nothing crosses open intervals.
#[derive(Debug)]
struct OpenState {
    limiter: Arc<Limiter>,
    controller: LagController,
    monitor: HealthMonitor,
    health: Arc<dyn HealthCheck>,
    watchers: Vec<CellWatcher>,
}

/// Admission control for write transactions, governed by the replication
/// lag of the target shard's replicas.
///
/// Only [`throttle`](Throttler::throttle) may be called from many threads
/// concurrently; every other method expects the single owner.
#[derive(Debug)]
pub struct Throttler {
    /// Populated at construction and never modified after.
    config: Config,
    collaborators: Collaborators,
    target: ShardTarget,
    /// Present exactly while the throttler is open.
    state: Option<OpenState>,
}

impl Throttler {
    /// Construct a throttler from `config`.
    ///
    /// Construction never fails: an invalid configuration is logged loudly
    /// and replaced with a disabled one, because the tablet server must not
    /// crash over a bad throttler config. The substituted throttler admits
    /// every transaction.
    #[must_use]
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let config = match config.verify() {
            Ok(()) => {
                info!(
                    enabled = config.enabled,
                    cells = ?config.observation_cells,
                    max_replication_lag_secs = config.max_replication_lag_secs,
                    "initialized transaction throttler"
                );
                config
            }
            Err(err) => {
                error!(
                    %err,
                    "invalid transaction throttler configuration; transaction \
                     throttling will be disabled"
                );
                Config::disabled()
            }
        };
        Self {
            config,
            collaborators,
            target: ShardTarget::default(),
            state: None,
        }
    }

    /// Set the shard identity this throttler governs. Allowed only while
    /// closed; the target is immutable for the duration of an open interval.
    pub fn init_target(&mut self, target: &ShardTarget) {
        if self.state.is_some() {
            warn!("ignoring init_target on an open throttler");
            return;
        }
        self.target = target.clone();
    }

    /// Open the throttler. Must be called before the first `throttle`.
    ///
    /// Idempotent: opening an open throttler is a no-op, as is opening a
    /// disabled one. Constructs the limiter, the rate controller, the
    /// health fan-in and one fleet watcher per observation cell, in that
    /// order; if construction fails partway the already-built pieces are
    /// torn down again and the throttler stays closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotSet`] when no target has been initialized
    /// and [`Error::HealthCheck`] when the health stream cannot be
    /// established. The caller may retry.
    pub async fn open(&mut self) -> Result<(), Error> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.state.is_some() {
            return Ok(());
        }
        if self.target.keyspace.is_empty() || self.target.shard.is_empty() {
            return Err(Error::TargetNotSet);
        }
        info!(
            keyspace = %self.target.keyspace,
            shard = %self.target.shard,
            "opening transaction throttler"
        );

        let limiter = Arc::new(Limiter::new(self.config.controller.initial_rate));
        let controller = LagController::spawn(
            Arc::clone(&limiter),
            self.config.max_replication_lag_secs,
            self.config.controller,
        );

        let health = match self
            .collaborators
            .health_checks
            .create(&self.target.cell, &self.config.observation_cells)
        {
            Ok(health) => health,
            Err(err) => {
                // Roll back what was already built; the state machine must
                // not expose a partially-open throttler.
                controller.close().await;
                limiter.close();
                return Err(err.into());
            }
        };
        let monitor = HealthMonitor::spawn(&health, controller.recorder(), self.target.clone());

        let watchers = self
            .config
            .observation_cells
            .iter()
            .map(|cell| {
                CellWatcher::spawn(
                    Arc::clone(&self.collaborators.topology),
                    Arc::clone(&health),
                    cell.clone(),
                    self.target.keyspace.clone(),
                    self.target.shard.clone(),
                    DEFAULT_REFRESH_INTERVAL,
                )
            })
            .collect();

        self.state = Some(OpenState {
            limiter,
            controller,
            monitor,
            health,
            watchers,
        });
        Ok(())
    }

    /// Close the throttler and release every resource of the open interval.
    ///
    /// Teardown is leaf-first: fleet watchers, then the health fan-in and
    /// its subscription, then the rate controller, then the limiter. Each
    /// step is best-effort and never raises. After this returns no
    /// background task of the interval is still running. Closing a closed
    /// throttler is a no-op.
    pub async fn close(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        for watcher in &mut state.watchers {
            watcher.stop().await;
        }
        state.monitor.close().await;
        state.health.close();
        state.controller.close().await;
        state.limiter.release(ADMISSION_CALLER_ID);
        state.limiter.close();
        info!("transaction throttler closed");
    }

    /// Decide whether the next transaction should back off.
    ///
    /// The hot path: no I/O, no logging, one short critical section. Safe
    /// to call from many threads concurrently. Returns `true` when the
    /// caller should back off, `false` when the transaction may proceed. A
    /// disabled throttler always returns `false`.
    ///
    /// # Panics
    ///
    /// Panics when called on a closed but enabled throttler. Silently
    /// admitting or denying here would mask a lifecycle bug in the caller.
    pub fn throttle(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(state) = self.state.as_ref() else {
            panic!("BUG: throttle() called on a closed Throttler");
        };
        let denied = state.limiter.request_admission(ADMISSION_CALLER_ID) > Duration::ZERO;
        if denied {
            counter!("denials").increment(1);
        } else {
            counter!("admissions").increment(1);
        }
        denied
    }

    /// The admission rate currently installed in the limiter, if open.
    #[must_use]
    pub fn max_rate(&self) -> Option<u64> {
        self.state.as_ref().map(|state| state.limiter.max_rate())
    }

    /// Replace the rate controller's tuning parameters. See
    /// [`ControllerConfig`] for the `copy_zero_values` semantics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] outside an open interval and
    /// [`Error::Controller`] when the new parameters fail validation.
    pub fn update_controller_config(
        &self,
        config: ControllerConfig,
        copy_zero_values: bool,
    ) -> Result<(), Error> {
        let state = self.state.as_ref().ok_or(Error::Closed)?;
        state
            .controller
            .update_configuration(config, copy_zero_values)?;
        Ok(())
    }

    /// Restore the rate controller's default tuning parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] outside an open interval.
    pub fn reset_controller_config(&self) -> Result<(), Error> {
        let state = self.state.as_ref().ok_or(Error::Closed)?;
        state.controller.reset_configuration();
        Ok(())
    }

    /// The rate controller's current tuning parameters, if open.
    #[must_use]
    pub fn controller_config(&self) -> Option<ControllerConfig> {
        self.state
            .as_ref()
            .map(|state| state.controller.get_configuration())
    }
}
