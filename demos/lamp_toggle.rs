//! Lamp toggle example
//!
//! Demonstrates the full lamp lifecycle:
//! - Waiting for the Bluetooth radio
//! - Scanning with early exit on a name match
//! - Connecting and toggling the lamp
//! - Automatic reconnection while the example keeps running
//!
//! Run with: cargo run --example lamp_toggle
//!
//! To look for a differently named lamp:
//!   cargo run --example lamp_toggle -- --name "Desk"

use lamp_rust_ble::{ConnectionState, Error, LampManager, LampState, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,lamp_rust_ble=debug")
        .init();

    println!("Lamp Toggle");
    println!("===========\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let name = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "Lamp".to_string());

    let manager = LampManager::new().await?;

    println!("Waiting for Bluetooth radio...");
    manager.await_ready().await?;

    println!("Scanning for \"{}\" (up to 10s)...\n", name);
    let devices = manager
        .scan(Duration::from_secs(10), Some(&name))
        .await?;

    for device in &devices {
        println!(
            "  {} {:<24} {}",
            device.id,
            device.display_name.as_deref().unwrap_or("(unnamed)"),
            device
                .signal_strength
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_default()
        );
    }
    println!();

    let lamp = devices
        .iter()
        .find(|d| d.name_matches(&name))
        .ok_or_else(|| Error::DeviceNotFound {
            identifier: name.clone(),
        })?;

    println!("Connecting to {}...", lamp.id);
    manager.connect(lamp).await?;

    let _watcher = manager.on_connection_changed(|event| {
        if event.state == ConnectionState::Disconnected {
            println!("  [link to {} lost]", event.identifier);
        }
    });

    match manager.read_state().await {
        LampState::Unknown => println!("Current state could not be read"),
        state => println!("Current state: {}", state),
    }

    for round in 1..=5 {
        let ok = if round % 2 == 1 {
            manager.turn_off().await
        } else {
            manager.turn_on().await
        };
        println!(
            "Toggle {}: {} ({})",
            round,
            if ok { "ok" } else { "failed" },
            manager.read_state().await
        );

        let reconnection = manager.reconnection_state();
        if reconnection.in_progress {
            println!(
                "  reconnecting: attempt {}/{}",
                reconnection.attempt, reconnection.max_attempts
            );
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    println!("\nLeaving the lamp on.");
    manager.turn_on().await;

    manager.shutdown().await?;
    Ok(())
}
