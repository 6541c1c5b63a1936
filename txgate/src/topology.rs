//! Fleet discovery through the cluster topology service.
//!
//! One [`CellWatcher`] per observation cell keeps the health stream informed
//! about which tablets exist for the governed keyspace and shard. Watchers
//! poll; the topology capability does not need to support watches.
//!
//! ## Metrics
//!
//! `topology_refresh_failures`: Topology reads that failed and will be retried

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::healthcheck::{HealthCheck, TabletId};

/// How often each watcher re-reads cell membership from topology.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Errors produced by a [`TopologyServer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The directory could not be read; the watcher retries on its next
    /// refresh tick.
    #[error("topology read failed: {reason}")]
    ReadFailed {
        /// Implementation-specific description of the failure.
        reason: String,
    },
}

/// Read-only lookup into the cluster topology directory.
#[async_trait]
pub trait TopologyServer: std::fmt::Debug + Send + Sync {
    /// Identities of all tablets serving `keyspace`/`shard` in `cell`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadFailed`] on a transient directory failure.
    async fn list_tablets(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> Result<Vec<TabletId>, Error>;
}

/// Watches one cell's tablet membership for one open interval.
#[derive(Debug)]
pub(crate) struct CellWatcher {
    cell: String,
    shutdown: Option<txgate_signal::Notifier>,
}

impl CellWatcher {
    /// Start the refresh task for `cell`. The first refresh happens
    /// immediately, subsequent ones every `refresh_interval`.
    pub(crate) fn spawn(
        topology: Arc<dyn TopologyServer>,
        health: Arc<dyn HealthCheck>,
        cell: String,
        keyspace: String,
        shard: String,
        refresh_interval: Duration,
    ) -> Self {
        let (notifier, listener) = txgate_signal::shutdown();
        tokio::spawn(watch(
            topology,
            health,
            cell.clone(),
            keyspace,
            shard,
            refresh_interval,
            listener,
        ));
        Self {
            cell,
            shutdown: Some(notifier),
        }
    }

    /// Stop the refresh task and wait for it to exit. Idempotent; a second
    /// call is a no-op.
    pub(crate) async fn stop(&mut self) {
        if let Some(notifier) = self.shutdown.take() {
            notifier.notify_and_wait().await;
            debug!(cell = %self.cell, "cell watcher stopped");
        }
    }
}

async fn watch(
    topology: Arc<dyn TopologyServer>,
    health: Arc<dyn HealthCheck>,
    cell: String,
    keyspace: String,
    shard: String,
    refresh_interval: Duration,
    shutdown: txgate_signal::Listener,
) {
    let mut known: FxHashSet<TabletId> = FxHashSet::default();
    let mut ticks = tokio::time::interval(refresh_interval);
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                refresh(&*topology, &*health, &cell, &keyspace, &shard, &mut known).await;
            }
            () = &mut shutdown_wait => {
                return;
            }
        }
    }
}

/// One refresh pass: read the cell's membership and publish the delta into
/// the health stream. A failed read changes nothing and is retried on the
/// next tick.
async fn refresh(
    topology: &dyn TopologyServer,
    health: &dyn HealthCheck,
    cell: &str,
    keyspace: &str,
    shard: &str,
    known: &mut FxHashSet<TabletId>,
) {
    let tablets = match topology.list_tablets(cell, keyspace, shard).await {
        Ok(tablets) => tablets,
        Err(err) => {
            counter!("topology_refresh_failures").increment(1);
            warn!(%err, cell, "topology refresh failed, will retry");
            return;
        }
    };

    let fresh: FxHashSet<TabletId> = tablets.into_iter().collect();
    for tablet in fresh.difference(known) {
        debug!(tablet = %tablet, cell, "tablet appeared");
        health.add_tablet(tablet.clone());
    }
    for tablet in known.difference(&fresh) {
        debug!(tablet = %tablet, cell, "tablet disappeared");
        health.remove_tablet(tablet);
    }
    *known = fresh;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use tokio::time::Duration;

    use super::{CellWatcher, Error, TopologyServer};
    use crate::healthcheck::{HealthCheck, TabletHealth, TabletId};

    fn tablet(uid: u32) -> TabletId {
        TabletId {
            cell: "zone1".to_string(),
            uid,
        }
    }

    /// Replays a scripted sequence of topology responses, then repeats the
    /// final one.
    #[derive(Debug)]
    struct ScriptedTopology {
        responses: Mutex<VecDeque<Result<Vec<TabletId>, Error>>>,
    }

    impl ScriptedTopology {
        fn new(responses: Vec<Result<Vec<TabletId>, Error>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl TopologyServer for ScriptedTopology {
        async fn list_tablets(
            &self,
            _cell: &str,
            _keyspace: &str,
            _shard: &str,
        ) -> Result<Vec<TabletId>, Error> {
            let mut responses = self.responses.lock().expect("responses lock");
            if responses.len() > 1 {
                return responses.pop_front().expect("non-empty script");
            }
            match responses.front().expect("non-empty script") {
                Ok(tablets) => Ok(tablets.clone()),
                Err(Error::ReadFailed { reason }) => Err(Error::ReadFailed {
                    reason: reason.clone(),
                }),
            }
        }
    }

    /// Records membership calls instead of delivering health events.
    #[derive(Debug)]
    struct RecordingHealth {
        added: Mutex<Vec<TabletId>>,
        removed: Mutex<Vec<TabletId>>,
    }

    impl RecordingHealth {
        fn new() -> Self {
            Self {
                added: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    impl HealthCheck for RecordingHealth {
        fn subscribe(&self) -> broadcast::Receiver<TabletHealth> {
            let (_, receiver) = broadcast::channel(1);
            receiver
        }

        fn add_tablet(&self, tablet: TabletId) {
            self.added.lock().expect("added lock").push(tablet);
        }

        fn remove_tablet(&self, tablet: &TabletId) {
            self.removed.lock().expect("removed lock").push(tablet.clone());
        }

        fn close(&self) {}
    }

    fn spawn_watcher(
        topology: Arc<ScriptedTopology>,
        health: Arc<RecordingHealth>,
    ) -> CellWatcher {
        CellWatcher::spawn(
            topology,
            health,
            "zone1".to_string(),
            "ks".to_string(),
            "0".to_string(),
            Duration::from_secs(30),
        )
    }

    /// Let the watcher task run to quiescence at the current paused instant.
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn membership_deltas_reach_the_health_stream() {
        let topology = Arc::new(ScriptedTopology::new(vec![
            Ok(vec![tablet(1), tablet(2)]),
            Ok(vec![tablet(2), tablet(3)]),
        ]));
        let health = Arc::new(RecordingHealth::new());
        let mut watcher = spawn_watcher(Arc::clone(&topology), Arc::clone(&health));

        // First refresh is immediate.
        settle().await;
        {
            let added = health.added.lock().expect("added lock");
            assert_eq!(added.len(), 2);
            assert!(added.contains(&tablet(1)));
            assert!(added.contains(&tablet(2)));
        }

        // Second refresh sees tablet 1 replaced by tablet 3.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        {
            let added = health.added.lock().expect("added lock");
            let removed = health.removed.lock().expect("removed lock");
            assert!(added.contains(&tablet(3)));
            assert_eq!(*removed, vec![tablet(1)]);
        }

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_retried_without_forgetting_membership() {
        let topology = Arc::new(ScriptedTopology::new(vec![
            Ok(vec![tablet(1)]),
            Err(Error::ReadFailed {
                reason: "directory offline".to_string(),
            }),
            Ok(vec![tablet(1)]),
        ]));
        let health = Arc::new(RecordingHealth::new());
        let mut watcher = spawn_watcher(Arc::clone(&topology), Arc::clone(&health));

        settle().await;
        // The failing tick and the recovery tick.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        // Tablet 1 was added exactly once; the error neither removed it nor
        // re-added it.
        assert_eq!(health.added.lock().expect("added lock").len(), 1);
        assert!(health.removed.lock().expect("removed lock").is_empty());

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let topology = Arc::new(ScriptedTopology::new(vec![Ok(vec![])]));
        let health = Arc::new(RecordingHealth::new());
        let mut watcher = spawn_watcher(topology, health);

        settle().await;
        watcher.stop().await;
        // Second stop is a no-op.
        watcher.stop().await;
    }
}
