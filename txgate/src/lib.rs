//! Replication-lag-driven transaction throttling for sharded tablet servers.
//!
//! A tablet server sits in front of a primary replica whose writes feed a
//! fleet of asynchronous followers. When those followers fall behind, every
//! additional write makes recovery harder. This library answers one question
//! on the transaction-begin path -- admit now, or ask the caller to back off?
//! -- using a rolling view of replication lag collected from peer replicas
//! discovered through the cluster topology service.
//!
//! The moving parts: a [`Throttler`] facade owns the lifecycle; a fleet
//! watcher per observation cell keeps the health stream aware of which
//! tablets exist; a fan-in consumer filters and stamps health events; a
//! lag-driven controller turns those samples into an admission ceiling; and
//! the [`txgate_limiter`] crate enforces that ceiling on the hot path.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::float_cmp)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![warn(missing_copy_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod controller;
pub mod healthcheck;
pub mod throttler;
pub mod topology;

pub use config::{Config, ShardTarget};
pub use controller::ControllerConfig;
pub use healthcheck::{HealthCheck, HealthCheckFactory, TabletHealth, TabletId, TabletRole};
pub use throttler::{Collaborators, Throttler};
pub use topology::{DEFAULT_REFRESH_INTERVAL, TopologyServer};
