//! Tablet health events, the health stream capability and the fan-in that
//! bridges the stream to the rate controller.
//!
//! The throttler does not speak to tablets itself. It consumes an external
//! health stream through the [`HealthCheck`] capability and isolates the
//! rest of the system from the stream's delivery details: the fan-in filters
//! events down to replicas of the governed shard, stamps them with a
//! monotonic receive time and forwards them to the controller.
//!
//! ## Metrics
//!
//! `health_events`: Events retained by the fan-in and handed to the controller
//! `health_stream_lagged`: Events dropped because the consumer fell behind

use std::{fmt, sync::Arc};

use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ShardTarget;
use crate::controller::LagRecorder;

/// Errors produced while acquiring the health stream.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The stream implementation could not be brought up for the requested
    /// cells.
    #[error("health stream unavailable: {reason}")]
    Unavailable {
        /// Implementation-specific description of the failure.
        reason: String,
    },
}

/// Identity of one tablet within the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabletId {
    /// Cell the tablet lives in.
    pub cell: String,
    /// Identifier unique within the cell.
    pub uid: u32,
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{cell}-{uid}", cell = self.cell, uid = self.uid)
    }
}

/// The role a tablet currently serves for its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletRole {
    /// Accepts writes.
    Primary,
    /// Asynchronous follower; the only role whose lag the throttler
    /// observes.
    Replica,
    /// Read-only follower, never a failover candidate. Serving somewhat
    /// stale data from these is acceptable, so their lag is ignored.
    ReadOnly,
}

/// One event on the health stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletHealth {
    /// The reporting tablet.
    pub tablet: TabletId,
    /// The tablet's current role.
    pub role: TabletRole,
    /// Keyspace the tablet serves.
    pub keyspace: String,
    /// Shard the tablet serves.
    pub shard: String,
    /// Seconds by which the tablet trails its primary's write log. Readings
    /// that are not finite non-negative numbers are discarded downstream.
    pub replication_lag_secs: f64,
}

/// The external health stream, scoped to a set of observation cells.
///
/// Implementations deliver [`TabletHealth`] events for the tablets they have
/// been told about; the fleet watchers keep that membership current through
/// [`add_tablet`](HealthCheck::add_tablet) and
/// [`remove_tablet`](HealthCheck::remove_tablet). Transport, authentication
/// and serialization are the implementation's concern.
pub trait HealthCheck: fmt::Debug + Send + Sync {
    /// Obtain a receiver of health events. Each call is an independent
    /// subscription.
    fn subscribe(&self) -> broadcast::Receiver<TabletHealth>;

    /// Begin delivering events for `tablet`.
    fn add_tablet(&self, tablet: TabletId);

    /// Stop delivering events for `tablet`.
    fn remove_tablet(&self, tablet: &TabletId);

    /// Release every resource held by the stream. Subscriptions observe a
    /// closed channel afterwards.
    fn close(&self);
}

/// Constructs a [`HealthCheck`] per open interval.
///
/// Injected into the facade at construction time so tests can substitute a
/// deterministic stream; there is no process-wide factory state.
pub trait HealthCheckFactory: fmt::Debug + Send + Sync {
    /// Bring up a health stream rooted in `local_cell` and watching `cells`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] when the stream cannot be established.
    fn create(&self, local_cell: &str, cells: &[String]) -> Result<Arc<dyn HealthCheck>, Error>;
}

/// The fan-in consumer for one open interval.
///
/// Exactly one background task reads the subscription; closing returns only
/// after that task has observed the cancellation.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    shutdown: Option<txgate_signal::Notifier>,
}

impl HealthMonitor {
    /// Subscribe to `health` and start the consumer task.
    pub(crate) fn spawn(
        health: &Arc<dyn HealthCheck>,
        recorder: LagRecorder,
        target: ShardTarget,
    ) -> Self {
        let (notifier, listener) = txgate_signal::shutdown();
        let receiver = health.subscribe();
        tokio::spawn(consume(receiver, recorder, target, listener));
        Self {
            shutdown: Some(notifier),
        }
    }

    /// Cancel the consumer task and wait for it to stop.
    pub(crate) async fn close(mut self) {
        if let Some(notifier) = self.shutdown.take() {
            notifier.notify_and_wait().await;
        }
    }
}

async fn consume(
    mut receiver: broadcast::Receiver<TabletHealth>,
    recorder: LagRecorder,
    target: ShardTarget,
    shutdown: txgate_signal::Listener,
) {
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(health) => {
                    // Only replicas count: primaries do not lag themselves
                    // and read-only tablets are not failover candidates.
                    if health.role != TabletRole::Replica {
                        continue;
                    }
                    if health.keyspace != target.keyspace || health.shard != target.shard {
                        continue;
                    }
                    counter!("health_events").increment(1);
                    recorder.record_lag(&health, Instant::now());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    counter!("health_stream_lagged").increment(missed);
                    warn!(missed, "health event consumer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("health stream closed");
                    return;
                }
            },
            () = &mut shutdown_wait => {
                debug!("health event consumer shutting down");
                return;
            }
        }
    }
}
