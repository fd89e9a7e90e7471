//! Lamp manager: the host-facing entry point.
//!
//! Composes the radio gate, scanner, session, health monitor, reconnection
//! supervisor and command façade over one radio adapter. Exactly one lamp
//! link is managed at a time.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::btleplug_adapter::BtleplugAdapter;
use crate::ble::monitor::HealthMonitor;
use crate::ble::radio::RadioGate;
use crate::ble::reconnect::{ReconnectionState, ReconnectionSupervisor};
use crate::ble::scanner::{DiscoveredDevice, Scanner};
use crate::ble::session::{
    ConnectionEvent, ConnectionState, LinkSnapshot, Session, SessionSettings,
};
use crate::ble::transport::{AdapterEvent, CharacteristicInfo, RadioAdapter, RadioState};
use crate::commands::{CommandFacade, LampState};
use crate::config::{CommandPolicy, ManagerConfig};
use crate::error::{Error, Result};

/// Handle for a registered callback. Unregisters on drop.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Central manager for one BLE lamp.
pub struct LampManager {
    /// Radio readiness gate.
    radio: RadioGate,
    /// Scanner for discovery passes.
    scanner: Scanner,
    /// The lamp link.
    session: Arc<Session>,
    /// Periodic link health check.
    monitor: Arc<HealthMonitor>,
    /// Reconnection with backoff.
    supervisor: Arc<ReconnectionSupervisor>,
    /// Retrying power commands.
    commands: CommandFacade,
    /// Last radio state observed.
    radio_state: Arc<RwLock<RadioState>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Adapter event pump.
    background_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LampManager {
    /// Create a manager on the host's first Bluetooth adapter with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default()).await
    }

    /// Create a manager on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration
    /// is invalid.
    pub async fn with_config(config: ManagerConfig) -> Result<Self> {
        let adapter = BtleplugAdapter::new().await?;
        Self::with_adapter(Arc::new(adapter), config)
    }

    /// Create a manager over any [`RadioAdapter`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is invalid.
    pub fn with_adapter(adapter: Arc<dyn RadioAdapter>, config: ManagerConfig) -> Result<Self> {
        let config = config.validated()?;

        let session = Arc::new(Session::new(
            adapter.clone(),
            SessionSettings::from(&config),
        ));
        let monitor = Arc::new(HealthMonitor::new(config.health_check_interval));
        let supervisor = Arc::new(ReconnectionSupervisor::new(
            session.clone(),
            monitor.clone(),
            config.backoff.clone(),
            config.auto_reconnect,
        ));
        let commands = CommandFacade::new(
            session.clone(),
            supervisor.clone(),
            config.commands.clone(),
        );
        let radio_state = Arc::new(RwLock::new(RadioState::Unknown));

        let pump = Self::spawn_event_pump(
            adapter.events(),
            supervisor.clone(),
            radio_state.clone(),
        );

        Ok(Self {
            radio: RadioGate::new(adapter.clone(), config.ready_timeout),
            scanner: Scanner::new(adapter, config.scan_options.clone()),
            session,
            monitor,
            supervisor,
            commands,
            radio_state,
            callback_counter: AtomicU64::new(0),
            background_handle: Mutex::new(Some(pump)),
        })
    }

    /// Wait until the radio is powered on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if the radio is off or access is
    /// refused. Retrying is up to the caller.
    pub async fn await_ready(&self) -> Result<()> {
        match self.radio.await_ready().await {
            Ok(()) => {
                *self.radio_state.write() = RadioState::PoweredOn;
                Ok(())
            }
            Err(e) => {
                if let Error::RadioUnavailable { state } = &e {
                    *self.radio_state.write() = *state;
                }
                Err(e)
            }
        }
    }

    /// Run one discovery pass. See [`Scanner::scan`].
    ///
    /// # Errors
    ///
    /// Returns an error if a scan is already running or cannot be started.
    pub async fn scan(
        &self,
        duration: Duration,
        name_filter: Option<&str>,
    ) -> Result<Vec<DiscoveredDevice>> {
        self.scanner.scan(duration, name_filter).await
    }

    /// Check if a scan pass is running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a lamp and start watching the link.
    ///
    /// Clears a previous manual-disconnect abort and a previous give-up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if the link cannot be established.
    pub async fn connect(&self, device: &DiscoveredDevice) -> Result<()> {
        // Cancel any running sequence before taking over the link.
        self.supervisor.abort();
        self.supervisor.rearm();
        self.monitor.stop();

        match self.session.connect(device).await {
            Ok(()) => {
                self.supervisor.reset();
                self.supervisor.start_monitor();
                Ok(())
            }
            Err(e) => {
                warn!("connect to {} failed: {}", device.id, e);
                Err(e)
            }
        }
    }

    /// Disconnect and forget the lamp. Idempotent.
    ///
    /// Stops the health monitor and cancels reconnection until the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        // Abort before stopping the monitor, or a finishing sequence can restart it.
        self.supervisor.abort();
        self.monitor.stop();
        self.session.disconnect().await;
    }

    /// Switch the lamp on. Returns `true` on success.
    pub async fn turn_on(&self) -> bool {
        self.commands.turn_on().await
    }

    /// Switch the lamp off. Returns `true` on success.
    pub async fn turn_off(&self) -> bool {
        self.commands.turn_off().await
    }

    /// Read the lamp's power state.
    pub async fn read_state(&self) -> LampState {
        self.commands.read_state().await
    }

    /// Enable or disable automatic reconnection on link loss.
    ///
    /// Enabling re-arms a supervisor that gave up and starts reconnecting
    /// right away if the remembered lamp is not connected.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.supervisor.set_auto_reconnect(enabled);
    }

    /// Set the reconnection attempt ceiling.
    pub fn set_max_reconnection_attempts(&self, max_attempts: u32) {
        self.supervisor.set_max_attempts(max_attempts);
    }

    /// Set the health-check period in seconds. Values under the floor are
    /// clamped. A running monitor is restarted with the new period.
    pub fn set_health_check_interval(&self, seconds: u64) -> Duration {
        let applied = self.monitor.set_interval(Duration::from_secs(seconds));
        if self.monitor.is_running() {
            debug!("Restarting health monitor with {:?}", applied);
            self.supervisor.start_monitor();
        }
        applied
    }

    /// Replace the retry policy used by lamp commands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `max_attempts` is zero.
    pub fn set_command_policy(&self, policy: CommandPolicy) -> Result<()> {
        if policy.max_attempts == 0 {
            return Err(Error::InvalidParameter {
                name: "commands.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        debug!("Command policy set to {:?}", policy);
        self.commands.set_policy(policy);
        Ok(())
    }

    /// Current retry policy used by lamp commands.
    pub fn command_policy(&self) -> CommandPolicy {
        self.commands.policy()
    }

    /// Set the first reconnection delay in milliseconds.
    pub fn set_initial_reconnection_delay(&self, millis: u64) {
        self.supervisor
            .set_initial_delay(Duration::from_millis(millis));
    }

    /// Check if a lamp is connected.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Identifier of the current (or remembered) lamp.
    pub fn current_peripheral_id(&self) -> Option<String> {
        self.session.peripheral_id()
    }

    /// Get the connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Reconnection counters.
    pub fn reconnection_state(&self) -> ReconnectionState {
        self.supervisor.state()
    }

    /// Last radio state observed.
    pub fn radio_state(&self) -> RadioState {
        *self.radio_state.read()
    }

    /// The selected control characteristic.
    pub fn control_characteristic(&self) -> Option<CharacteristicInfo> {
        self.session.control_characteristic()
    }

    /// Characteristics found on the current link.
    pub fn discovered_characteristics(&self) -> Vec<CharacteristicInfo> {
        self.session.discovered_characteristics()
    }

    /// Snapshot of the link for UI state reflection.
    pub fn snapshot(&self) -> LinkSnapshot {
        self.session.snapshot()
    }

    /// Select the control characteristic by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] if it was not discovered.
    pub fn select_control_characteristic(&self, uuid: Uuid) -> Result<CharacteristicInfo> {
        self.session.select_control_characteristic(uuid)
    }

    /// Select the control characteristic by legacy attribute handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] if no discovered
    /// characteristic has this handle.
    pub fn select_control_characteristic_by_handle(
        &self,
        handle: u16,
    ) -> Result<CharacteristicInfo> {
        self.session.select_control_characteristic_by_handle(handle)
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.session.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.session.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection callback lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Disconnect and stop all background work.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down lamp manager");

        self.disconnect().await;

        if let Some(handle) = self.background_handle.lock().take() {
            handle.abort();
        }

        Ok(())
    }

    /// Turn adapter events into session transitions.
    fn spawn_event_pump(
        mut events: broadcast::Receiver<AdapterEvent>,
        supervisor: Arc<ReconnectionSupervisor>,
        radio_state: Arc<RwLock<RadioState>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Disconnected { peripheral_id }) => {
                        supervisor.on_link_lost(&peripheral_id);
                    }
                    Ok(AdapterEvent::StateChanged(state)) => {
                        let previous = std::mem::replace(&mut *radio_state.write(), state);
                        if previous != state {
                            info!("Radio state: {} -> {}", previous, state);
                        }
                    }
                    Ok(AdapterEvent::Advertisement(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event pump lagged, {} adapter events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            debug!("Lamp manager event pump ended");
        })
    }
}

impl Drop for LampManager {
    fn drop(&mut self) {
        if let Some(handle) = self.background_handle.get_mut().take() {
            handle.abort();
        }
        self.supervisor.abort();
        self.monitor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::MockRadioAdapter;
    use crate::config::MIN_HEALTH_CHECK_INTERVAL;

    fn manager_with(mock: MockRadioAdapter) -> (LampManager, broadcast::Sender<AdapterEvent>) {
        let (tx, _) = broadcast::channel(16);
        let events_tx = tx.clone();
        let mut mock = mock;
        mock.expect_events().returning(move || events_tx.subscribe());

        let manager = LampManager::with_adapter(Arc::new(mock), ManagerConfig::default()).unwrap();
        (manager, tx)
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = ManagerConfig {
            commands: crate::config::CommandPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = LampManager::with_adapter(Arc::new(MockRadioAdapter::new()), config);
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn test_fresh_manager_state() {
        let (manager, _tx) = manager_with(MockRadioAdapter::new());

        assert!(!manager.is_connected());
        assert_eq!(manager.current_peripheral_id(), None);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert_eq!(manager.radio_state(), RadioState::Unknown);
        assert!(!manager.reconnection_state().in_progress);

        // Nothing connected: no adapter calls.
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_setters() {
        let (manager, _tx) = manager_with(MockRadioAdapter::new());

        manager.set_max_reconnection_attempts(4);
        manager.set_initial_reconnection_delay(250);
        let state = manager.reconnection_state();
        assert_eq!(state.max_attempts, 4);
        assert_eq!(state.current_delay, Duration::from_millis(250));

        assert_eq!(
            manager.set_health_check_interval(0),
            MIN_HEALTH_CHECK_INTERVAL
        );
        assert_eq!(
            manager.set_health_check_interval(20),
            Duration::from_secs(20)
        );
    }

    #[tokio::test]
    async fn test_radio_state_tracks_adapter_events() {
        let (manager, tx) = manager_with(MockRadioAdapter::new());

        tx.send(AdapterEvent::StateChanged(RadioState::PoweredOff))
            .unwrap();
        for _ in 0..10 {
            if manager.radio_state() == RadioState::PoweredOff {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.radio_state(), RadioState::PoweredOff);
    }
}
