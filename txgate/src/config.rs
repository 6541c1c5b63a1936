//! Throttler configuration parsing and validation.
//!
//! The tablet server embeds [`Config`] in its own configuration file; the
//! controller tuning block nested inside it is validated by
//! [`crate::controller`]. Validation is total -- every field is checked
//! against its documented range -- and failures are structured errors so the
//! facade can decide what to do with a bad configuration without crashing
//! the tablet server.

use serde::Deserialize;

use crate::controller::{self, ControllerConfig};

/// Errors produced by [`Config`] validation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An enabled throttler needs at least one cell to observe.
    #[error("observation_cells must name at least one cell when enabled")]
    EmptyObservationCells,
    /// The lag ceiling must be positive to be meaningful as a target.
    #[error("max_replication_lag_secs must be positive")]
    ZeroMaxReplicationLag,
    /// The controller tuning block failed its own validation.
    #[error("controller configuration invalid: {0}")]
    Controller(#[from] controller::Error),
}

fn default_max_replication_lag_secs() -> u64 {
    10
}

/// Identity of the shard one throttler instance governs.
///
/// Set once through [`crate::Throttler::init_target`] before opening;
/// immutable for the duration of an open interval.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShardTarget {
    /// The logical database the governed shard belongs to.
    pub keyspace: String,
    /// The shard within the keyspace.
    pub shard: String,
    /// The cell this tablet server lives in.
    pub cell: String,
}

/// Main configuration for a transaction throttler.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Master switch. When false the throttler admits every transaction and
    /// never touches topology or the health stream.
    #[serde(default)]
    pub enabled: bool,
    /// Cells whose replicas contribute replication-lag samples. At least one
    /// is required when the throttler is enabled.
    #[serde(default)]
    pub observation_cells: Vec<String>,
    /// Replication lag, in seconds, above which the controller starts
    /// reducing the admission rate.
    #[serde(default = "default_max_replication_lag_secs")]
    pub max_replication_lag_secs: u64,
    /// Tuning for the lag-driven rate controller.
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Config {
    /// A configuration whose throttler admits everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            observation_cells: Vec::new(),
            max_replication_lag_secs: default_max_replication_lag_secs(),
            controller: ControllerConfig::default(),
        }
    }

    /// Check every field against its documented range.
    ///
    /// A disabled configuration is always valid; nothing else in it is
    /// consulted.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn verify(&self) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        if self.observation_cells.is_empty() {
            return Err(Error::EmptyObservationCells);
        }
        if self.max_replication_lag_secs == 0 {
            return Err(Error::ZeroMaxReplicationLag);
        }
        self.controller.verify()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Error};

    #[test]
    fn config_deserializes() {
        let contents = r#"
enabled: true
observation_cells: ["zone1", "zone2"]
max_replication_lag_secs: 30
controller:
  initial_rate: 200
  min_rate: 10
"#;
        let config: Config = serde_yaml::from_str(contents).expect("valid yaml");
        assert!(config.enabled);
        assert_eq!(
            config.observation_cells,
            vec!["zone1".to_string(), "zone2".to_string()]
        );
        assert_eq!(config.max_replication_lag_secs, 30);
        assert_eq!(config.controller.initial_rate, 200);
        assert_eq!(config.controller.min_rate, 10);
        // Unspecified tuning fields take their defaults.
        assert_eq!(
            config.controller.evaluation_interval_secs,
            crate::controller::ControllerConfig::default().evaluation_interval_secs
        );
        config.verify().expect("config verifies");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = r#"
enabled: true
observation_cells: ["zone1"]
surprise: 1
"#;
        let result: Result<Config, _> = serde_yaml::from_str(contents);
        assert!(result.is_err());
    }

    #[test]
    fn disabled_config_always_verifies() {
        let config = Config {
            enabled: false,
            observation_cells: Vec::new(),
            max_replication_lag_secs: 0,
            ..Config::disabled()
        };
        config.verify().expect("disabled config verifies");
    }

    #[test]
    fn enabled_config_requires_cells() {
        let config = Config {
            enabled: true,
            ..Config::disabled()
        };
        let result = config.verify();
        assert!(matches!(result, Err(Error::EmptyObservationCells)));
    }

    #[test]
    fn enabled_config_requires_positive_lag_ceiling() {
        let config = Config {
            enabled: true,
            observation_cells: vec!["zone1".to_string()],
            max_replication_lag_secs: 0,
            ..Config::disabled()
        };
        let result = config.verify();
        assert!(matches!(result, Err(Error::ZeroMaxReplicationLag)));
    }

    #[test]
    fn controller_errors_propagate() {
        let mut config = Config {
            enabled: true,
            observation_cells: vec!["zone1".to_string()],
            ..Config::disabled()
        };
        config.controller.min_rate = 0;
        let result = config.verify();
        assert!(matches!(result, Err(Error::Controller(_))));
    }
}
