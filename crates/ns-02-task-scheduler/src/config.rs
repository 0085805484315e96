//! # Scheduler Configuration
//!
//! Timing and replenishment settings for every state machine a registry
//! spawns.

use crate::domain::{retry_delay, SchedulerError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between run-loop iterations.
    pub poll_interval_ms: u64,

    /// First retry delay; doubles per attempt.
    pub retry_base_delay_ms: u64,

    /// Retry delay ceiling.
    pub retry_max_delay_ms: u64,

    /// Deadline for one request/reply exchange.
    pub operation_timeout_ms: u64,

    /// Allowed drift between the sent and echoed request number before the
    /// context is considered stale.
    pub request_number_tolerance: u64,

    /// Replenish numbers when fewer than this many are spendable.
    /// 0 disables automatic replenishment.
    pub min_spendable_numbers: usize,

    /// Numbers asked for per `GetTransactionNumbers`.
    pub numbers_per_request: u32,

    /// Log in as notary admin once per session when set.
    pub admin_password: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 30_000,
            operation_timeout_ms: 30_000,
            request_number_tolerance: 1,
            min_spendable_numbers: 10,
            numbers_per_request: 50,
            admin_password: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a config for testing (fast polling, no auto-replenish).
    pub fn for_testing() -> Self {
        Self {
            poll_interval_ms: 5,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 50,
            operation_timeout_ms: 1_000,
            request_number_tolerance: 0,
            min_spendable_numbers: 0,
            numbers_per_request: 5,
            admin_password: None,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `NS_POLL_INTERVAL_MS` (default: 50)
    /// - `NS_RETRY_BASE_DELAY_MS` (default: 250)
    /// - `NS_RETRY_MAX_DELAY_MS` (default: 30000)
    /// - `NS_OPERATION_TIMEOUT_MS` (default: 30000)
    /// - `NS_REQUEST_NUMBER_TOLERANCE` (default: 1)
    /// - `NS_MIN_SPENDABLE_NUMBERS` (default: 10)
    /// - `NS_NUMBERS_PER_REQUEST` (default: 50)
    /// - `NS_ADMIN_PASSWORD` (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_ms: parsed("NS_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            retry_base_delay_ms: parsed("NS_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            retry_max_delay_ms: parsed("NS_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            operation_timeout_ms: parsed("NS_OPERATION_TIMEOUT_MS", defaults.operation_timeout_ms),
            request_number_tolerance: parsed(
                "NS_REQUEST_NUMBER_TOLERANCE",
                defaults.request_number_tolerance,
            ),
            min_spendable_numbers: parsed(
                "NS_MIN_SPENDABLE_NUMBERS",
                defaults.min_spendable_numbers,
            ),
            numbers_per_request: parsed("NS_NUMBERS_PER_REQUEST", defaults.numbers_per_request),
            admin_password: env::var("NS_ADMIN_PASSWORD").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Reject settings the run loop cannot work with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "operation_timeout_ms must be positive".into(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(SchedulerError::InvalidConfig(format!(
                "retry_base_delay_ms {} exceeds retry_max_delay_ms {}",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.numbers_per_request == 0 {
            return Err(SchedulerError::InvalidConfig(
                "numbers_per_request must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Delay before retry number `attempt`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        retry_delay(
            attempt,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
