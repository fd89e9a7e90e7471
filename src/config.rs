//! Manager configuration.
//!
//! All timing knobs live here. Defaults suit a mains-powered lamp a few
//! metres away; hosts override them at construction time or through the
//! runtime setters on [`LampManager`](crate::LampManager).

use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::ble::transport::ScanOptions;
use crate::ble::uuids::POWER_CHARACTERISTIC_UUID;
use crate::error::{Error, Result};

/// Shortest allowed health-check interval.
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential backoff parameters for the reconnection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,
    /// Attempts allowed before the supervisor gives up.
    pub max_attempts: u32,
    /// Upper bound of the random jitter added on each failure.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay that follows `current` after a failed attempt.
    ///
    /// `min(current * 2 + jitter, max_delay)`. Never shorter than `current`
    /// as long as `current <= max_delay`.
    pub fn next_delay(&self, current: Duration, jitter: Duration) -> Duration {
        current
            .saturating_mul(2)
            .saturating_add(jitter)
            .min(self.max_delay)
    }

    /// Draw a jitter value in `0..=max_jitter`.
    pub fn jitter(&self) -> Duration {
        use rand::Rng;

        let bound = self.max_jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Bounded retry used by the command façade.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandPolicy {
    /// Attempts per command, including the first one.
    pub max_attempts: u32,
    /// Pause after a reconnection before the command is retried.
    pub stabilization_delay: Duration,
    /// Longest a single command waits for a reconnection sequence.
    pub reconnect_wait: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stabilization_delay: Duration::from_secs(1),
            reconnect_wait: Duration::from_secs(15),
        }
    }
}

/// Configuration for a [`LampManager`](crate::LampManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// UUID of the characteristic that receives power commands.
    pub control_characteristic_uuid: Uuid,
    /// Handle to fall back on when no characteristic matches the UUID.
    pub legacy_control_handle: Option<u16>,
    /// Filters handed to the adapter when scanning.
    pub scan_options: ScanOptions,
    /// How long `await_ready` waits for the radio to power on.
    pub ready_timeout: Duration,
    /// Bound on establishing the link.
    pub connect_timeout: Duration,
    /// Bound on each service/characteristic discovery step.
    pub discovery_timeout: Duration,
    /// Bound on a single write.
    pub write_timeout: Duration,
    /// Bound on a single read.
    pub read_timeout: Duration,
    /// Period of the health monitor.
    pub health_check_interval: Duration,
    /// Whether link loss triggers reconnection.
    pub auto_reconnect: bool,
    /// Reconnection backoff.
    pub backoff: BackoffPolicy,
    /// Command retry.
    pub commands: CommandPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            control_characteristic_uuid: POWER_CHARACTERISTIC_UUID,
            legacy_control_handle: None,
            scan_options: ScanOptions::default(),
            ready_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            auto_reconnect: true,
            backoff: BackoffPolicy::default(),
            commands: CommandPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Check the configuration for values the manager cannot work with.
    ///
    /// A health-check interval under the floor is clamped (with a warning)
    /// rather than rejected.
    pub fn validated(mut self) -> Result<Self> {
        if self.commands.max_attempts == 0 {
            return Err(Error::InvalidParameter {
                name: "commands.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }

        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(Error::InvalidParameter {
                name: "backoff.max_delay".to_string(),
                value: format!("{:?}", self.backoff.max_delay),
            });
        }

        self.health_check_interval = clamp_health_interval(self.health_check_interval);
        Ok(self)
    }
}

/// Apply the health-check floor.
pub(crate) fn clamp_health_interval(interval: Duration) -> Duration {
    if interval < MIN_HEALTH_CHECK_INTERVAL {
        warn!(
            "Health check interval {:?} below minimum, using {:?}",
            interval, MIN_HEALTH_CHECK_INTERVAL
        );
        MIN_HEALTH_CHECK_INTERVAL
    } else {
        interval
    }
}
