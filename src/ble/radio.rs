//! Radio readiness gate.
//!
//! Nothing else touches the adapter until the radio reports `PoweredOn`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::ble::transport::{AdapterEvent, RadioAdapter, RadioState};
use crate::error::{Error, Result};

/// Waits for the radio to become usable.
pub struct RadioGate {
    /// Adapter whose power state is tracked.
    adapter: Arc<dyn RadioAdapter>,
    /// Upper bound on waiting out an `Unknown` state.
    ready_timeout: Duration,
}

impl RadioGate {
    /// Create a gate over an adapter.
    pub fn new(adapter: Arc<dyn RadioAdapter>, ready_timeout: Duration) -> Self {
        Self {
            adapter,
            ready_timeout,
        }
    }

    /// Resolve once the radio is powered on.
    ///
    /// Returns immediately when the radio is already on. While the state is
    /// `Unknown` the caller is suspended until the next definite state; any
    /// definite state other than `PoweredOn` fails fast.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] when the radio is off, access is
    /// refused, or no state arrives within the ready timeout.
    pub async fn await_ready(&self) -> Result<()> {
        // Subscribe before sampling so a transition in between is not lost.
        let mut events = self.adapter.events();

        let current = self.adapter.radio_state().await.map_err(|e| {
            warn!("Failed to query radio state: {}", e);
            Error::RadioUnavailable {
                state: RadioState::Unknown,
            }
        })?;

        match current {
            RadioState::PoweredOn => {
                debug!("Radio already powered on");
                return Ok(());
            }
            RadioState::Unknown => {
                debug!("Radio state unknown, waiting for power state");
            }
            state => {
                warn!("Radio unavailable: {}", state);
                return Err(Error::RadioUnavailable { state });
            }
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::StateChanged(RadioState::PoweredOn)) => {
                        info!("Radio powered on");
                        return Ok(());
                    }
                    Ok(AdapterEvent::StateChanged(RadioState::Unknown)) => continue,
                    Ok(AdapterEvent::StateChanged(state)) => {
                        warn!("Radio unavailable: {}", state);
                        return Err(Error::RadioUnavailable { state });
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Radio gate lagged by {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::RadioUnavailable {
                            state: RadioState::Unknown,
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(self.ready_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Radio did not report a power state within {:?}",
                    self.ready_timeout
                );
                Err(Error::RadioUnavailable {
                    state: RadioState::Unknown,
                })
            }
        }
    }
}
