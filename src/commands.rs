//! Lamp commands with bounded retry.
//!
//! Every command is tried a fixed number of times. Between attempts the
//! reconnection supervisor is asked to restore the link, then the link is
//! given a moment to settle. Failures never escape as errors: a command
//! reports `false` (or [`LampState::Unknown`]) once its attempts run out.

use bytes::Bytes;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::ble::reconnect::ReconnectionSupervisor;
use crate::ble::session::Session;
use crate::ble::uuids::{POWER_OFF_PAYLOAD, POWER_ON_PAYLOAD};
use crate::config::CommandPolicy;
use crate::error::Result;

/// Power state read back from the lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LampState {
    /// Lamp is lit.
    On,
    /// Lamp is dark.
    Off,
    /// Could not be read, or the value was not recognised.
    #[default]
    Unknown,
}

impl LampState {
    /// Decode a power characteristic value.
    pub fn from_bytes(value: &[u8]) -> Self {
        match value.first() {
            Some(&byte) if byte == POWER_ON_PAYLOAD[0] => Self::On,
            Some(&byte) if byte == POWER_OFF_PAYLOAD[0] => Self::Off,
            _ => Self::Unknown,
        }
    }

    /// Check if the lamp is known to be on.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

impl std::fmt::Display for LampState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "On"),
            Self::Off => write!(f, "Off"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&Bytes> for LampState {
    fn from(value: &Bytes) -> Self {
        Self::from_bytes(value)
    }
}

/// Power commands on top of a [`Session`].
pub struct CommandFacade {
    session: Arc<Session>,
    supervisor: Arc<ReconnectionSupervisor>,
    policy: RwLock<CommandPolicy>,
}

impl CommandFacade {
    /// Create a façade over a session and its supervisor.
    pub fn new(
        session: Arc<Session>,
        supervisor: Arc<ReconnectionSupervisor>,
        policy: CommandPolicy,
    ) -> Self {
        Self {
            session,
            supervisor,
            policy: RwLock::new(policy),
        }
    }

    /// Current retry policy.
    pub fn policy(&self) -> CommandPolicy {
        self.policy.read().clone()
    }

    /// Replace the retry policy.
    pub fn set_policy(&self, policy: CommandPolicy) {
        *self.policy.write() = policy;
    }

    /// Switch the lamp on. Returns `true` once a write succeeds.
    pub async fn turn_on(&self) -> bool {
        self.write_power("turn_on", &POWER_ON_PAYLOAD).await
    }

    /// Switch the lamp off. Returns `true` once a write succeeds.
    pub async fn turn_off(&self) -> bool {
        self.write_power("turn_off", &POWER_OFF_PAYLOAD).await
    }

    /// Read the lamp's power state.
    pub async fn read_state(&self) -> LampState {
        let value = self
            .with_retry("read_state", |session| async move { session.read().await })
            .await;

        match value {
            Some(value) => {
                let state = LampState::from_bytes(&value);
                debug!("Lamp state {} ({:02x?})", state, value.as_ref());
                state
            }
            None => LampState::Unknown,
        }
    }

    async fn write_power(&self, operation: &str, payload: &'static [u8]) -> bool {
        let written = self
            .with_retry(operation, |session| async move {
                session.write(payload).await
            })
            .await;

        if written.is_some() {
            info!("{} succeeded", operation);
        }
        written.is_some()
    }

    /// Run `op` up to `max_attempts` times, reconnecting between attempts.
    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Option<T>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy();
        let target = self
            .session
            .peripheral_id()
            .unwrap_or_else(|| "<none>".to_string());

        for attempt in 1..=policy.max_attempts {
            match op(self.session.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} on {} succeeded on attempt {}", operation, target, attempt);
                    }
                    return Some(value);
                }
                Err(e) => {
                    warn!(
                        "{} on {} failed (attempt {}/{}): {}",
                        operation, target, attempt, policy.max_attempts, e
                    );
                }
            }

            if attempt == policy.max_attempts {
                break;
            }

            let reconnected = self.supervisor.reconnect_now(policy.reconnect_wait).await;
            debug!(
                "Reconnection before retrying {}: {}",
                operation,
                if reconnected { "link ready" } else { "link not ready" }
            );
            tokio::time::sleep(policy.stabilization_delay).await;
        }

        error!(
            "{} on {} failed after {} attempts",
            operation, target, policy.max_attempts
        );
        None
    }
}
