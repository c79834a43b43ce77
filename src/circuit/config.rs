//! Circuit configuration.

use std::time::Duration;

use crate::error::{CircuitError, CircuitResult, ErrorKind};

/// Circuit configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Period of the interval checkpointing service.
    pub checkpoint_interval: Duration,
    /// Deadline of an asynchronous stop hook when the block does not declare its own.
    pub default_stop_timeout: Duration,
    /// Async initializer timeouts at or above this threshold are reported in the debug log.
    pub long_init_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(250),
            default_stop_timeout: Duration::from_secs(10),
            long_init_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero durations.
    pub fn validate(self) -> CircuitResult<Self> {
        if self.checkpoint_interval.is_zero() {
            return Err(invalid("checkpoint_interval must be positive"));
        }
        if self.default_stop_timeout.is_zero() {
            return Err(invalid("default_stop_timeout must be positive"));
        }
        Ok(self)
    }
}

fn invalid(reason: &str) -> CircuitError {
    CircuitError::new(ErrorKind::InvalidConfig {
        reason: reason.to_string(),
    })
}
