//! Registry Configuration
//!
//! Tunables for heartbeat liveness and the bounded recency index. Values come
//! from the process environment, falling back to defaults:
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `OP_EVENTS_HEARTBEAT_EXPIRE_WINDOW` | 200 | expiry, in percent of the worker's heartbeat frequency |
//! | `OP_EVENTS_HEARTBEAT_DRIFT_MAX` | 16 | seconds of sender/receiver skew before warning |
//! | `OP_EVENTS_MAX_TASKS_IN_MEMORY` | 10000 | index soft bound is twice this |
//! | `OP_EVENTS_HEARTBEAT_HISTORY` | 8 | heartbeat receipts kept per worker |
//! | `OP_EVENTS_HEARTBEAT_FREQ` | 60 | assumed heartbeat frequency when a worker reports none |

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StateError};

pub const DEFAULT_HEARTBEAT_EXPIRE_WINDOW: f64 = 200.0;
pub const DEFAULT_HEARTBEAT_DRIFT_MAX: f64 = 16.0;
pub const DEFAULT_MAX_TASKS_IN_MEMORY: usize = 10_000;
pub const DEFAULT_HEARTBEAT_HISTORY: usize = 8;
pub const DEFAULT_HEARTBEAT_FREQ: f64 = 60.0;

/// Configuration consumed by [`crate::Registry`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Heartbeat expiry as a percentage of the worker's heartbeat frequency
    pub heartbeat_expire_window: f64,

    /// Maximum tolerated |received - reported| before a drift warning
    pub heartbeat_drift_max: f64,

    /// The recency index holds up to twice this many entries
    pub max_tasks_in_memory: usize,

    /// Rolling heartbeat history cap per worker
    pub heartbeat_history: usize,

    /// Heartbeat frequency assumed for workers that never reported one
    pub default_heartbeat_freq: f64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            heartbeat_expire_window: DEFAULT_HEARTBEAT_EXPIRE_WINDOW,
            heartbeat_drift_max: DEFAULT_HEARTBEAT_DRIFT_MAX,
            max_tasks_in_memory: DEFAULT_MAX_TASKS_IN_MEMORY,
            heartbeat_history: DEFAULT_HEARTBEAT_HISTORY,
            default_heartbeat_freq: DEFAULT_HEARTBEAT_FREQ,
        }
    }
}

impl StateConfig {
    /// Build a configuration from `OP_EVENTS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            heartbeat_expire_window: get_config_float(
                "OP_EVENTS_HEARTBEAT_EXPIRE_WINDOW",
                DEFAULT_HEARTBEAT_EXPIRE_WINDOW,
            ),
            heartbeat_drift_max: get_config_float(
                "OP_EVENTS_HEARTBEAT_DRIFT_MAX",
                DEFAULT_HEARTBEAT_DRIFT_MAX,
            ),
            max_tasks_in_memory: get_config_usize(
                "OP_EVENTS_MAX_TASKS_IN_MEMORY",
                DEFAULT_MAX_TASKS_IN_MEMORY,
            ),
            heartbeat_history: get_config_usize(
                "OP_EVENTS_HEARTBEAT_HISTORY",
                DEFAULT_HEARTBEAT_HISTORY,
            ),
            default_heartbeat_freq: get_config_float(
                "OP_EVENTS_HEARTBEAT_FREQ",
                DEFAULT_HEARTBEAT_FREQ,
            ),
        };
        config.validate()?;
        debug!(?config, "Loaded event state configuration");
        Ok(config)
    }

    /// Set the index bound
    pub fn with_max_tasks_in_memory(mut self, max_tasks: usize) -> Self {
        self.max_tasks_in_memory = max_tasks;
        self
    }

    /// Soft threshold at which the recency index is compacted
    pub fn index_threshold(&self) -> usize {
        self.max_tasks_in_memory.saturating_mul(2)
    }

    /// Reject configurations that would make the registry misbehave
    pub fn validate(&self) -> Result<()> {
        if self.max_tasks_in_memory == 0 {
            return Err(StateError::invalid_config("max_tasks_in_memory must be > 0"));
        }
        if self.heartbeat_history == 0 {
            return Err(StateError::invalid_config("heartbeat_history must be > 0"));
        }
        if !(self.heartbeat_expire_window > 0.0) {
            return Err(StateError::invalid_config(
                "heartbeat_expire_window must be positive",
            ));
        }
        if !(self.default_heartbeat_freq > 0.0) {
            return Err(StateError::invalid_config(
                "default_heartbeat_freq must be positive",
            ));
        }
        if !(self.heartbeat_drift_max >= 0.0) {
            return Err(StateError::invalid_config(
                "heartbeat_drift_max must not be negative",
            ));
        }
        Ok(())
    }
}

/// Get a float configuration value.
pub fn get_config_float(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get an unsigned integer configuration value.
pub fn get_config_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index_threshold(), 20_000);
        assert_eq!(config.heartbeat_history, 8);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = StateConfig::default().with_max_tasks_in_memory(0);
        assert!(matches!(config.validate(), Err(StateError::InvalidConfig(_))));
    }

    #[test]
    fn test_get_config_falls_back_on_garbage() {
        std::env::set_var("OP_EVENTS_TEST_GARBAGE_FLOAT", "not-a-number");
        assert_eq!(get_config_float("OP_EVENTS_TEST_GARBAGE_FLOAT", 1.5), 1.5);
        std::env::set_var("OP_EVENTS_TEST_USIZE", " 42 ");
        assert_eq!(get_config_usize("OP_EVENTS_TEST_USIZE", 7), 42);
        assert_eq!(get_config_usize("OP_EVENTS_TEST_UNSET_VAR", 7), 7);
    }
}
