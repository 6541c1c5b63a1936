//! Shutdown signaling for txgate.
//!
//! A throttler open interval owns several background tasks -- the rate
//! controller's evaluation loop, the health event consumer, one topology
//! watcher per cell. Closing the interval must not return until every one of
//! those tasks has observed the shutdown and stopped touching shared state.
//!
//! The mechanism has two halves. A [`Notifier`] raises the shutdown signal; a
//! [`Listener`] waits for it and acknowledges receipt. There is one `Notifier`
//! per component and potentially many `Listener` instances, each obtained by
//! cloning. [`Notifier::notify_and_wait`] blocks until every live listener has
//! either acknowledged the signal or dropped.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::debug;

/// Construct a connected [`Notifier`] and [`Listener`] pair.
#[must_use]
pub fn shutdown() -> (Notifier, Listener) {
    let (sender, receiver) = watch::channel(false);
    let live = Arc::new(AtomicU32::new(1));
    let drained = Arc::new(Notify::new());

    let notifier = Notifier {
        sender,
        live: Arc::clone(&live),
        drained: Arc::clone(&drained),
    };
    let listener = Listener {
        receiver,
        live,
        drained,
        acked: false,
    };

    (notifier, listener)
}

/// Raises the shutdown signal for one component's tasks.
#[derive(Debug)]
pub struct Notifier {
    /// Transmission point for the signal.
    sender: watch::Sender<bool>,
    /// Count of listeners that have not yet acknowledged the signal.
    live: Arc<AtomicU32>,
    /// Woken by listeners as they acknowledge, so `notify_and_wait` can
    /// re-check `live` without spinning.
    drained: Arc<Notify>,
}

impl Notifier {
    /// Raise the signal without waiting for acknowledgement.
    pub fn notify(self) {
        let _ = self.sender.send(true);
    }

    /// Raise the signal and wait until every live [`Listener`] has
    /// acknowledged it or dropped.
    pub async fn notify_and_wait(self) {
        let _ = self.sender.send(true);

        // Registration order matters: create the notified future, then check
        // the counter, then await. A listener that acknowledges between the
        // check and the await still wakes us because the future snapshots the
        // notify generation at creation.
        loop {
            let drained = self.drained.notified();

            let live = self.live.load(Ordering::SeqCst);
            if live == 0 {
                return;
            }
            debug!(live, "waiting for tasks to acknowledge shutdown");

            drained.await;
        }
    }
}

/// Waits for the shutdown signal inside a background task.
#[derive(Debug)]
pub struct Listener {
    /// Reception point for the signal.
    receiver: watch::Receiver<bool>,
    /// Count of listeners the notifier is still waiting on. Shared with the
    /// [`Notifier`]; this instance only ever decrements it, exactly once.
    live: Arc<AtomicU32>,
    /// Wakes the notifier after a decrement.
    drained: Arc<Notify>,
    /// Whether this instance has already acknowledged.
    acked: bool,
}

impl Listener {
    /// Wait for the shutdown signal, then acknowledge it.
    ///
    /// Returns immediately if the signal has already been raised. A dropped
    /// [`Notifier`] counts as a raised signal.
    pub async fn recv(mut self) {
        if !*self.receiver.borrow_and_update() {
            // An Err means the notifier dropped without sending, which we
            // treat the same as the signal itself.
            let _ = self.receiver.changed().await;
        }
        self.log_off();
    }

    /// Check for the shutdown signal without blocking, acknowledging it on
    /// first observation. Returns `true` once the signal has been raised.
    pub fn try_recv(&mut self) -> bool {
        if self.acked {
            return true;
        }
        let raised = match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow_and_update(),
            // Notifier dropped; same as raised.
            Err(_) => true,
        };
        if raised {
            self.log_off();
        }
        raised
    }

    /// Decrement the live count and wake the notifier. Idempotent per
    /// instance; every listener accounts for exactly one decrement, whether
    /// through acknowledgement or drop.
    fn log_off(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

impl Clone for Listener {
    fn clone(&self) -> Self {
        self.live.fetch_add(1, Ordering::SeqCst);
        Self {
            receiver: self.receiver.clone(),
            live: Arc::clone(&self.live),
            drained: Arc::clone(&self.drained),
            // A fresh peer acknowledges on its own.
            acked: false,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.log_off();
    }
}
