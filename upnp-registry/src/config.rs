//! Configuration types for the upnp-registry crate
//!
//! This module defines the settings that control the Registry's maintenance
//! loop, GENA subscription durations and renewal policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Seconds granted to a subscription whose subscriber lives in this process.
///
/// An in-process subscriber has no network timeout to honor, so the value is
/// the largest duration the Maintainer can still represent.
pub const IN_PROCESS_DURATION_SECONDS: u32 = i32::MAX as u32;

/// Configuration for the Registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between Maintainer sweeps
    /// Default: 1 second
    pub maintenance_interval: Duration,

    /// Duration requested for, and granted to, GENA subscriptions when the
    /// peer does not ask for a shorter one
    /// Default: 1800 seconds (30 minutes)
    pub default_subscription_duration: u32,

    /// Replaces the max-age advertised by every remote device; 0 keeps
    /// remote devices forever
    /// Default: None
    pub remote_device_max_age_override: Option<u32>,

    /// Grant `default_subscription_duration` to every inbound SUBSCRIBE,
    /// whatever TIMEOUT it carries
    /// Default: false
    pub received_subscription_timeout_ignored: bool,

    /// Number of renewal attempts before a remote subscription is ended
    /// Default: 3
    pub max_renewal_attempts: u32,

    /// Maximum number of protocol tasks running at once
    /// Default: 16
    pub executor_concurrency: usize,

    /// How long an inbound NOTIFY waits for an in-flight SUBSCRIBE to finish
    /// Default: 5 seconds
    pub pending_subscription_wait: Duration,

    /// How long `shutdown()` waits for the Maintainer task
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(1),
            default_subscription_duration: 1800,
            remote_device_max_age_override: None,
            received_subscription_timeout_ignored: false,
            max_renewal_attempts: 3,
            executor_concurrency: 16,
            pending_subscription_wait: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    /// Create a new RegistryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RegistryConfig for devices that should wake up less often
    pub fn low_power() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(3),
            executor_concurrency: 4,
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.maintenance_interval == Duration::ZERO {
            return Err(RegistryError::Configuration(
                "Maintenance interval must be greater than 0".to_string(),
            ));
        }

        if self.default_subscription_duration == 0 {
            return Err(RegistryError::Configuration(
                "Default subscription duration must be greater than 0".to_string(),
            ));
        }

        if self.max_renewal_attempts == 0 {
            return Err(RegistryError::Configuration(
                "Max renewal attempts must be greater than 0".to_string(),
            ));
        }

        if self.executor_concurrency == 0 {
            return Err(RegistryError::Configuration(
                "Executor concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Set the interval between Maintainer sweeps
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the default subscription duration in seconds
    pub fn with_default_subscription_duration(mut self, seconds: u32) -> Self {
        self.default_subscription_duration = seconds;
        self
    }

    /// Override the max-age of every remote device
    pub fn with_remote_device_max_age(mut self, seconds: u32) -> Self {
        self.remote_device_max_age_override = Some(seconds);
        self
    }

    /// Ignore the TIMEOUT header of inbound SUBSCRIBE requests
    pub fn with_received_subscription_timeout_ignored(mut self, ignored: bool) -> Self {
        self.received_subscription_timeout_ignored = ignored;
        self
    }

    /// Set the bound on renewal attempts
    pub fn with_max_renewal_attempts(mut self, attempts: u32) -> Self {
        self.max_renewal_attempts = attempts;
        self
    }

    /// Set the executor concurrency
    pub fn with_executor_concurrency(mut self, concurrency: usize) -> Self {
        self.executor_concurrency = concurrency;
        self
    }

    /// Set how long an inbound NOTIFY waits for a pending SUBSCRIBE
    pub fn with_pending_subscription_wait(mut self, wait: Duration) -> Self {
        self.pending_subscription_wait = wait;
        self
    }

    /// Max-age to record for a remote device advertising `advertised` seconds
    pub fn remote_device_max_age(&self, advertised: u32) -> u32 {
        self.remote_device_max_age_override.unwrap_or(advertised)
    }
}
