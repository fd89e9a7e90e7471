//! BLE link session.
//!
//! Owns the link to the one active peripheral: connection state, the
//! discovered characteristics, and the selected control characteristic.
//! Link mutations (connect, disconnect) are serialized; reads of the state
//! always see a consistent snapshot.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::scanner::DiscoveredDevice;
use crate::ble::transport::{CharacteristicInfo, RadioAdapter};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Link or discovery in progress.
    Connecting,
    /// Link up and discovery finished.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The identifier of the peripheral.
    pub identifier: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Flag and transport agree the link is up.
    Healthy,
    /// A connect is in flight; nothing to judge yet.
    Pending,
    /// No target remembered; nothing to watch.
    Idle,
    /// Flag says connected but the transport disagrees.
    Stale,
    /// Flag says disconnected while a target is remembered.
    Disconnected,
}

impl HealthStatus {
    /// Check if this status calls for reconnection.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, Self::Stale | Self::Disconnected)
    }
}

/// Point-in-time view of the session for UI state reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkSnapshot {
    /// Identifier of the remembered target.
    pub peripheral_id: Option<String>,
    /// Current connection state.
    pub state: ConnectionState,
    /// UUID of the selected control characteristic.
    pub control_characteristic: Option<Uuid>,
    /// When the current link came up.
    pub connected_since: Option<DateTime<Utc>>,
}

/// Timeouts and selection policy for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// UUID auto-selected as the control characteristic.
    pub control_uuid: Uuid,
    /// Secondary selection by attribute handle.
    pub legacy_handle: Option<u16>,
    /// Bound on establishing the link.
    pub connect_timeout: Duration,
    /// Bound on each discovery step and on transport link queries.
    pub discovery_timeout: Duration,
    /// Bound on a single write.
    pub write_timeout: Duration,
    /// Bound on a single read.
    pub read_timeout: Duration,
}

impl From<&ManagerConfig> for SessionSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            control_uuid: config.control_characteristic_uuid,
            legacy_handle: config.legacy_control_handle,
            connect_timeout: config.connect_timeout,
            discovery_timeout: config.discovery_timeout,
            write_timeout: config.write_timeout,
            read_timeout: config.read_timeout,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

/// Internal state, guarded by a single lock.
#[derive(Debug, Default)]
struct SessionState {
    /// Remembered target; survives link loss, cleared on manual disconnect.
    target: Option<DiscoveredDevice>,
    /// Current connection state.
    connection_state: ConnectionState,
    /// Selected control characteristic.
    control: Option<CharacteristicInfo>,
    /// Everything found during the last discovery.
    characteristics: Vec<CharacteristicInfo>,
    /// When the current link came up.
    connected_since: Option<DateTime<Utc>>,
    /// Bumped whenever a link attempt starts or a link is lost.
    generation: u64,
}

impl SessionState {
    fn clear_link(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.control = None;
        self.characteristics.clear();
        self.connected_since = None;
    }
}

/// The link to a single peripheral.
pub struct Session {
    /// The adapter that carries the link.
    adapter: Arc<dyn RadioAdapter>,
    /// Timeouts and selection policy.
    settings: SessionSettings,
    /// Session state.
    state: RwLock<SessionState>,
    /// Serializes connect and disconnect.
    link_lock: tokio::sync::Mutex<()>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Session {
    /// Create a session over an adapter. No link is opened yet.
    pub fn new(adapter: Arc<dyn RadioAdapter>, settings: SessionSettings) -> Self {
        let (event_tx, _) = broadcast::channel(32);

        Self {
            adapter,
            settings,
            state: RwLock::new(SessionState::default()),
            link_lock: tokio::sync::Mutex::new(()),
            event_tx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Check if connected with a control characteristic selected.
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.connection_state.is_connected() && state.control.is_some()
    }

    /// The remembered target.
    pub fn target(&self) -> Option<DiscoveredDevice> {
        self.state.read().target.clone()
    }

    /// Identifier of the remembered target.
    pub fn peripheral_id(&self) -> Option<String> {
        self.state.read().target.as_ref().map(|t| t.id.clone())
    }

    /// The selected control characteristic.
    pub fn control_characteristic(&self) -> Option<CharacteristicInfo> {
        self.state.read().control.clone()
    }

    /// Characteristics found during the last discovery.
    pub fn discovered_characteristics(&self) -> Vec<CharacteristicInfo> {
        self.state.read().characteristics.clone()
    }

    /// Snapshot for UI state reflection.
    pub fn snapshot(&self) -> LinkSnapshot {
        let state = self.state.read();
        LinkSnapshot {
            peripheral_id: state.target.as_ref().map(|t| t.id.clone()),
            state: state.connection_state,
            control_characteristic: state.control.as_ref().map(|c| c.uuid),
            connected_since: state.connected_since,
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to `target` and discover its characteristics.
    ///
    /// A no-op when already connected to the same target with a control
    /// characteristic selected. A link to a different target, or one that
    /// came up without a control characteristic, is dropped first so
    /// discovery runs again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if the link cannot be established in
    /// time, service discovery fails, or the link drops mid-discovery.
    pub async fn connect(&self, target: &DiscoveredDevice) -> Result<()> {
        let _link = self.link_lock.lock().await;

        let stale_link = {
            let state = self.state.read();
            let same_target =
                state.target.as_ref().map(|t| t.id.as_str()) == Some(target.id.as_str());

            if state.connection_state.is_connected() && same_target && state.control.is_some() {
                debug!("Already connected to {}", target.id);
                return Ok(());
            }

            match (&state.target, state.connection_state) {
                (Some(previous), ConnectionState::Connected | ConnectionState::Connecting) => {
                    Some(previous.id.clone())
                }
                _ => None,
            }
        };

        if let Some(previous) = stale_link {
            debug!("Dropping existing link to {} before connecting", previous);
            self.drop_link(&previous).await;
        }

        let generation = {
            let mut state = self.state.write();
            state.target = Some(target.clone());
            state.clear_link();
            state.connection_state = ConnectionState::Connecting;
            state.generation += 1;
            state.generation
        };
        self.emit(&target.id, ConnectionState::Connecting);

        info!("Connecting to {}", target.id);

        let link =
            tokio::time::timeout(self.settings.connect_timeout, self.adapter.connect(&target.id))
                .await;
        let failure = match link {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no link within {:?}",
                self.settings.connect_timeout
            )),
        };
        if let Some(reason) = failure {
            warn!("connect to {} failed: {}", target.id, reason);
            return Err(self.fail_connect(&target.id, generation, reason));
        }

        // The link is up; discovery starts from a clean slate.
        self.state.write().characteristics.clear();

        let characteristics = match self.discover(&target.id).await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!("service discovery on {} failed: {}", target.id, e);
                self.drop_link(&target.id).await;
                return Err(self.fail_connect(&target.id, generation, e.to_string()));
            }
        };

        let control = self.select_control(&characteristics);
        if control.is_none() {
            warn!(
                "No control characteristic {} on {} ({} characteristics discovered)",
                self.settings.control_uuid,
                target.id,
                characteristics.len()
            );
        }

        {
            let mut state = self.state.write();
            if state.generation != generation || !state.connection_state.is_transitioning() {
                drop(state);
                warn!("Link to {} dropped during discovery", target.id);
                return Err(Error::ConnectFailed {
                    peripheral: target.id.clone(),
                    reason: "link lost during discovery".to_string(),
                });
            }

            state.connection_state = ConnectionState::Connected;
            state.control = control;
            state.characteristics = characteristics;
            state.connected_since = Some(Utc::now());
        }
        self.emit(&target.id, ConnectionState::Connected);

        info!("Connected to {}", target.id);
        Ok(())
    }

    /// Manually disconnect and forget the target.
    ///
    /// Idempotent. The transport is only asked to disconnect when a link is
    /// up or being set up.
    pub async fn disconnect(&self) {
        let _link = self.link_lock.lock().await;

        let (peripheral, had_link) = {
            let state = self.state.read();
            (
                state.target.as_ref().map(|t| t.id.clone()),
                state.connection_state != ConnectionState::Disconnected,
            )
        };

        if let (Some(id), true) = (&peripheral, had_link) {
            info!("Disconnecting from {}", id);
            self.drop_link(id).await;
        }

        {
            let mut state = self.state.write();
            state.clear_link();
            state.target = None;
            state.generation += 1;
        }

        if let (Some(id), true) = (peripheral, had_link) {
            self.emit(&id, ConnectionState::Disconnected);
        }
    }

    /// Handle an unsolicited link-loss report for `peripheral_id`.
    ///
    /// Returns `true` if it concerned the current target and changed state.
    pub fn handle_link_lost(&self, peripheral_id: &str) -> bool {
        let changed = {
            let mut state = self.state.write();
            let is_target = state.target.as_ref().map(|t| t.id.as_str()) == Some(peripheral_id);

            if !is_target || state.connection_state == ConnectionState::Disconnected {
                false
            } else {
                state.clear_link();
                state.generation += 1;
                true
            }
        };

        if changed {
            warn!("Link to {} lost", peripheral_id);
            self.emit(peripheral_id, ConnectionState::Disconnected);
        }
        changed
    }

    /// Force the current target into the disconnected state.
    pub fn mark_link_lost(&self) -> bool {
        match self.peripheral_id() {
            Some(id) => self.handle_link_lost(&id),
            None => false,
        }
    }

    /// Compare the connection flag with the transport's link state.
    pub async fn check_health(&self) -> HealthStatus {
        let (connection_state, peripheral) = {
            let state = self.state.read();
            (
                state.connection_state,
                state.target.as_ref().map(|t| t.id.clone()),
            )
        };

        let id = match (connection_state, peripheral) {
            (_, None) => return HealthStatus::Idle,
            (ConnectionState::Connecting, _) => return HealthStatus::Pending,
            (ConnectionState::Disconnected, Some(_)) => return HealthStatus::Disconnected,
            (ConnectionState::Connected, Some(id)) => id,
        };

        let probe = tokio::time::timeout(
            self.settings.discovery_timeout,
            self.adapter.is_connected(&id),
        )
        .await;

        match probe {
            Ok(Ok(true)) => {
                trace!("Link to {} healthy", id);
                HealthStatus::Healthy
            }
            Ok(Ok(false)) => {
                warn!("Link to {} reported down by transport", id);
                HealthStatus::Stale
            }
            Ok(Err(e)) => {
                warn!("Link query for {} failed: {}", id, e);
                HealthStatus::Stale
            }
            Err(_) => {
                warn!("Link query for {} timed out", id);
                HealthStatus::Stale
            }
        }
    }

    /// Select the control characteristic by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] if no discovered
    /// characteristic has this UUID.
    pub fn select_control_characteristic(&self, uuid: Uuid) -> Result<CharacteristicInfo> {
        let mut state = self.state.write();
        let characteristic = state
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })?;

        info!("Control characteristic set to {}", uuid);
        state.control = Some(characteristic.clone());
        Ok(characteristic)
    }

    /// Select the control characteristic by attribute handle.
    ///
    /// Legacy path for firmware addressed by fixed handles. Prefer
    /// [`select_control_characteristic`](Self::select_control_characteristic).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] if no discovered
    /// characteristic carries this handle.
    pub fn select_control_characteristic_by_handle(
        &self,
        handle: u16,
    ) -> Result<CharacteristicInfo> {
        let mut state = self.state.write();
        let characteristic = state
            .characteristics
            .iter()
            .find(|c| c.handle == Some(handle))
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: format!("handle {:#06x}", handle),
            })?;

        info!(
            "Control characteristic set to legacy handle {:#06x} ({})",
            handle, characteristic.uuid
        );
        state.control = Some(characteristic.clone());
        Ok(characteristic)
    }

    /// Write a payload to the control characteristic. No retry.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`], [`Error::NoCharacteristicSelected`], or
    /// [`Error::WriteFailed`] (also on timeout).
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let (id, characteristic) = self.control_target("write")?;

        if !characteristic.is_writable() {
            warn!("write on {}: {} is not writable", id, characteristic.uuid);
            return Err(Error::WriteFailed {
                reason: format!("characteristic {} is not writable", characteristic.uuid),
            });
        }

        let kind = characteristic.preferred_write_kind();
        let outcome = tokio::time::timeout(
            self.settings.write_timeout,
            self.adapter.write(&id, &characteristic, payload, kind),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                trace!("Wrote {} bytes to {} on {}", payload.len(), characteristic.uuid, id);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("write on {} failed: {}", id, e);
                Err(Error::WriteFailed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("write on {} timed out", id);
                Err(Error::WriteFailed {
                    reason: format!("no completion within {:?}", self.settings.write_timeout),
                })
            }
        }
    }

    /// Read the control characteristic.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`], [`Error::NoCharacteristicSelected`], or
    /// [`Error::ReadFailed`] (also on timeout).
    pub async fn read(&self) -> Result<Bytes> {
        let (id, characteristic) = self.control_target("read")?;

        if !characteristic.supports_read {
            warn!("read on {}: {} is not readable", id, characteristic.uuid);
            return Err(Error::ReadFailed {
                reason: format!("characteristic {} is not readable", characteristic.uuid),
            });
        }

        let outcome = tokio::time::timeout(
            self.settings.read_timeout,
            self.adapter.read(&id, &characteristic),
        )
        .await;

        match outcome {
            Ok(Ok(value)) => {
                trace!("Read {} bytes from {} on {}", value.len(), characteristic.uuid, id);
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!("read on {} failed: {}", id, e);
                Err(Error::ReadFailed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("read on {} timed out", id);
                Err(Error::ReadFailed {
                    reason: format!("no completion within {:?}", self.settings.read_timeout),
                })
            }
        }
    }

    /// Resolve the peripheral and characteristic for a data operation.
    fn control_target(&self, operation: &str) -> Result<(String, CharacteristicInfo)> {
        let state = self.state.read();
        let id = state
            .target
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_else(|| "<none>".to_string());

        if !state.connection_state.is_connected() {
            debug!("{} on {} rejected: not connected", operation, id);
            return Err(Error::NotConnected);
        }

        match &state.control {
            Some(characteristic) => Ok((id, characteristic.clone())),
            None => {
                debug!("{} on {} rejected: no control characteristic", operation, id);
                Err(Error::NoCharacteristicSelected)
            }
        }
    }

    /// Service discovery, then characteristic discovery for every service
    /// concurrently. A failing service contributes no characteristics.
    async fn discover(&self, id: &str) -> Result<Vec<CharacteristicInfo>> {
        let timeout = self.settings.discovery_timeout;

        let services = tokio::time::timeout(timeout, self.adapter.discover_services(id))
            .await
            .map_err(|_| Error::Timeout {
                operation: "service discovery".to_string(),
            })??;

        debug!("Discovered {} services on {}", services.len(), id);

        let lookups = services.iter().map(|service| async move {
            match tokio::time::timeout(timeout, self.adapter.discover_characteristics(id, *service))
                .await
            {
                Ok(Ok(characteristics)) => {
                    debug!(
                        "Service {} on {}: {} characteristics",
                        service,
                        id,
                        characteristics.len()
                    );
                    characteristics
                }
                Ok(Err(e)) => {
                    warn!(
                        "characteristic discovery for service {} on {} failed: {}",
                        service, id, e
                    );
                    Vec::new()
                }
                Err(_) => {
                    warn!(
                        "characteristic discovery for service {} on {} timed out",
                        service, id
                    );
                    Vec::new()
                }
            }
        });

        Ok(join_all(lookups).await.into_iter().flatten().collect())
    }

    /// Pick the control characteristic: UUID match first (writable
    /// preferred), then the legacy handle if one is configured.
    fn select_control(&self, characteristics: &[CharacteristicInfo]) -> Option<CharacteristicInfo> {
        let uuid = self.settings.control_uuid;
        let by_uuid = characteristics
            .iter()
            .filter(|c| c.uuid == uuid)
            .max_by_key(|c| c.is_writable());

        if let Some(characteristic) = by_uuid {
            debug!("Selected control characteristic {}", characteristic.uuid);
            return Some(characteristic.clone());
        }

        let handle = self.settings.legacy_handle?;
        let by_handle = characteristics.iter().find(|c| c.handle == Some(handle))?;
        warn!(
            "No characteristic matches {}, falling back to legacy handle {:#06x}",
            uuid, handle
        );
        Some(by_handle.clone())
    }

    /// Ask the transport to drop a link, logging rather than failing.
    async fn drop_link(&self, id: &str) {
        match tokio::time::timeout(self.settings.connect_timeout, self.adapter.disconnect(id)).await
        {
            Ok(Ok(())) => debug!("Link to {} closed", id),
            Ok(Err(e)) => warn!("disconnect from {} failed: {}", id, e),
            Err(_) => warn!("disconnect from {} timed out", id),
        }
    }

    /// Roll a failed connect back to `Disconnected`, keeping the target.
    fn fail_connect(&self, id: &str, generation: u64, reason: String) -> Error {
        let reverted = {
            let mut state = self.state.write();
            if state.generation == generation {
                state.clear_link();
                true
            } else {
                false
            }
        };
        if reverted {
            self.emit(id, ConnectionState::Disconnected);
        }

        Error::ConnectFailed {
            peripheral: id.to_string(),
            reason,
        }
    }

    /// Publish a state change.
    fn emit(&self, id: &str, state: ConnectionState) {
        debug!("Connection state for {}: {}", id, state);
        let _ = self.event_tx.send(ConnectionEvent {
            identifier: id.to_string(),
            state,
        });
    }
}
