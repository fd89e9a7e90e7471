//! Connecting, characteristic selection, and link teardown.

mod common;

use common::{
    firmware_characteristic, lamp, manager, manager_with_config, power_characteristic, settle,
    FakeAdapter, FIRMWARE_REVISION_UUID, LAMP_ID,
};
use lamp_rust_ble::ble::uuids::{
    DEVICE_INFO_SERVICE_UUID, LEGACY_POWER_HANDLE, POWER_CHARACTERISTIC_UUID,
};
use lamp_rust_ble::ble::{Session, SessionSettings};
use lamp_rust_ble::{
    CharacteristicInfo, ConnectionState, Error, ManagerConfig, RadioAdapter, WriteKind,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn test_connect_discovers_and_selects_control() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    let mut events = manager.subscribe_connection_events();

    tokio_test::assert_ok!(manager.connect(&lamp()).await);

    assert!(manager.is_connected());
    assert_eq!(manager.current_peripheral_id().as_deref(), Some(LAMP_ID));
    assert_eq!(manager.discovered_characteristics().len(), 2);
    assert_eq!(
        manager.control_characteristic().map(|c| c.uuid),
        Some(POWER_CHARACTERISTIC_UUID)
    );

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert!(snapshot.connected_since.is_some());

    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connecting);
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_power_writes_are_fire_and_forget() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    manager.connect(&lamp()).await.unwrap();

    assert!(manager.turn_on().await);
    assert!(manager.turn_off().await);

    assert_eq!(adapter.writes(), vec![vec![0x01], vec![0x00]]);
    assert_eq!(
        adapter.write_kinds(),
        vec![WriteKind::WithoutResponse, WriteKind::WithoutResponse]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    manager.connect(&lamp()).await.unwrap();

    manager.disconnect().await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    manager.disconnect().await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    assert_eq!(adapter.disconnect_calls(), 1);
    assert!(!adapter.link_up());
    assert!(manager.control_characteristic().is_none());
    assert!(manager.discovered_characteristics().is_empty());
    assert_eq!(manager.current_peripheral_id(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_uuid_needs_explicit_selection() {
    let other = CharacteristicInfo {
        uuid: Uuid::from_u128(0x932c32bd_0005_47a2_835a_a8d455b859dd),
        ..power_characteristic(None)
    };
    let adapter = FakeAdapter::with_characteristics(vec![other.clone(), firmware_characteristic()]);
    let manager = manager(&adapter);

    tokio_test::assert_ok!(manager.connect(&lamp()).await);
    assert!(manager.is_connected());
    assert!(manager.control_characteristic().is_none());

    assert!(matches!(
        manager.select_control_characteristic(POWER_CHARACTERISTIC_UUID),
        Err(Error::CharacteristicNotFound { .. })
    ));

    let selected = manager.select_control_characteristic(other.uuid).unwrap();
    assert_eq!(selected.uuid, other.uuid);
    assert!(manager.turn_on().await);
    assert_eq!(adapter.writes(), vec![vec![0x01]]);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_handle_fallback() {
    let legacy = CharacteristicInfo {
        uuid: Uuid::from_u128(0x0000_fff1_0000_1000_8000_00805f9b34fb),
        ..power_characteristic(Some(LEGACY_POWER_HANDLE))
    };
    let adapter = FakeAdapter::with_characteristics(vec![legacy.clone(), firmware_characteristic()]);
    let config = ManagerConfig {
        legacy_control_handle: Some(LEGACY_POWER_HANDLE),
        ..Default::default()
    };
    let manager = manager_with_config(&adapter, config);

    manager.connect(&lamp()).await.unwrap();
    assert_eq!(manager.control_characteristic(), Some(legacy));

    // Explicit selection by handle also works on other characteristics.
    let firmware = manager.select_control_characteristic_by_handle(0x0030).unwrap();
    assert_eq!(firmware.uuid, FIRMWARE_REVISION_UUID);
    assert!(matches!(
        manager.select_control_characteristic_by_handle(0x0099),
        Err(Error::CharacteristicNotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_reported() {
    let adapter = FakeAdapter::new();
    adapter.fail_all_connects(true);
    let manager = manager(&adapter);

    let err = manager.connect(&lamp()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed { .. }));
    assert!(err.is_recoverable());
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    // A failed explicit connect does not start background reconnection.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(adapter.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_hang_becomes_write_failed() {
    let adapter = FakeAdapter::new();
    let session = Session::new(adapter.clone() as Arc<dyn RadioAdapter>, SessionSettings::default());
    session.connect(&lamp()).await.unwrap();

    adapter.hang_writes(true);
    let started = Instant::now();
    let result = session.write(&[0x01]).await;

    assert!(matches!(result, Err(Error::WriteFailed { .. })));
    assert_eq!(started.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_session_primitives_reject_without_link() {
    let adapter = FakeAdapter::new();
    let session = Session::new(adapter as Arc<dyn RadioAdapter>, SessionSettings::default());

    assert!(matches!(session.write(&[0x01]).await, Err(Error::NotConnected)));
    assert!(matches!(session.read().await, Err(Error::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_event_resets_state() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    manager.set_auto_reconnect(false);
    manager.connect(&lamp()).await.unwrap();

    adapter.drop_link();
    settle().await;

    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(manager.control_characteristic().is_none());
    // The target is kept so the link can be restored later.
    assert_eq!(manager.current_peripheral_id().as_deref(), Some(LAMP_ID));
}

#[tokio::test(start_paused = true)]
async fn test_connection_callback() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = manager.on_connection_changed(move |event| sink.lock().push(event.state));

    manager.connect(&lamp()).await.unwrap();
    settle().await;
    manager.disconnect().await;
    settle().await;

    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );

    handle.unregister();
    manager.connect(&lamp()).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_hang_fails_at_connect_timeout() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    adapter.hang_connects(true);

    let started = Instant::now();
    let result = manager.connect(&lamp()).await;

    assert!(matches!(result, Err(Error::ConnectFailed { .. })));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(!manager.reconnection_state().in_progress);
}

#[tokio::test(start_paused = true)]
async fn test_service_discovery_hang_fails_and_drops_link() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    adapter.hang_service_discovery(true);

    let started = Instant::now();
    let result = manager.connect(&lamp()).await;

    assert!(matches!(result, Err(Error::ConnectFailed { .. })));
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(!adapter.link_up());
    assert_eq!(adapter.disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_service_contributes_no_characteristics() {
    let adapter = FakeAdapter::new();
    let manager = manager(&adapter);
    adapter.hang_characteristics_for(Some(DEVICE_INFO_SERVICE_UUID));

    let started = Instant::now();
    tokio_test::assert_ok!(manager.connect(&lamp()).await);

    // Both services are looked up together, so only one timeout elapses.
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(manager.is_connected());

    let uuids: Vec<Uuid> = manager
        .discovered_characteristics()
        .iter()
        .map(|c| c.uuid)
        .collect();
    assert_eq!(uuids, vec![POWER_CHARACTERISTIC_UUID]);
    assert_eq!(
        manager.control_characteristic().map(|c| c.uuid),
        Some(POWER_CHARACTERISTIC_UUID)
    );
}
