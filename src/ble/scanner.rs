//! BLE scanning functionality.
//!
//! Runs time-boxed discovery passes that can end early on a name match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, trace, warn};

use crate::ble::transport::{AdapterEvent, Advertisement, RadioAdapter, ScanOptions};
use crate::error::{Error, Result};

/// Fold an adapter's address/id pair into the single identifier used
/// everywhere downstream.
///
/// The hardware address wins when present. Platforms that hide it (an
/// empty or all-zero address) fall back to the platform id. The result is
/// lowercased so the same device always maps to the same string.
pub fn normalize_peripheral_id(address: Option<&str>, id: &str) -> String {
    let usable_address = address
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .filter(|addr| addr.chars().any(|c| c.is_ascii_hexdigit() && c != '0'));

    usable_address.unwrap_or(id.trim()).to_lowercase()
}

/// A peripheral seen during a scan pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Normalized identifier; the only id field downstream code reads.
    pub id: String,
    /// Advertised name.
    pub display_name: Option<String>,
    /// Signal strength in dBm.
    pub signal_strength: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a device record from an identifier alone.
    ///
    /// Useful when the host already knows the id from its own cache.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            signal_strength: None,
        }
    }

    /// Build a device record from a raw advertisement.
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        Self {
            id: normalize_peripheral_id(advertisement.address.as_deref(), &advertisement.id),
            display_name: advertisement.local_name.clone(),
            signal_strength: advertisement.rssi,
        }
    }

    /// Case-insensitive substring match against the display name.
    pub fn name_matches(&self, filter: &str) -> bool {
        self.display_name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&filter.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Devices collected during one pass, unique by id, in discovery order.
#[derive(Debug, Default)]
pub(crate) struct DiscoverySet {
    order: Vec<String>,
    devices: HashMap<String, DiscoveredDevice>,
}

impl DiscoverySet {
    /// Insert a device or refresh the record already held for its id.
    ///
    /// A later advertisement without a name keeps the earlier name.
    pub(crate) fn upsert(&mut self, device: DiscoveredDevice) {
        match self.devices.get_mut(&device.id) {
            Some(existing) => {
                if device.display_name.is_some() {
                    existing.display_name = device.display_name;
                }
                if device.signal_strength.is_some() {
                    existing.signal_strength = device.signal_strength;
                }
            }
            None => {
                self.order.push(device.id.clone());
                self.devices.insert(device.id.clone(), device);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn into_devices(mut self) -> Vec<DiscoveredDevice> {
        self.order
            .iter()
            .filter_map(|id| self.devices.remove(id))
            .collect()
    }
}

/// Time-boxed BLE scanner.
pub struct Scanner {
    /// The adapter used for scanning.
    adapter: Arc<dyn RadioAdapter>,
    /// Filters passed to the adapter.
    options: ScanOptions,
    /// Whether a pass is currently running.
    is_scanning: Arc<AtomicBool>,
}

/// Owns a running pass until it ends, however it ends.
///
/// Dropping an armed guard (the scan future was cancelled) clears the
/// running flag and stops the adapter scan on a spawned task.
struct ScanGuard {
    adapter: Arc<dyn RadioAdapter>,
    is_scanning: Arc<AtomicBool>,
    radio_scanning: bool,
}

impl ScanGuard {
    /// Claim the scanner; `None` if a pass is already running.
    fn acquire(adapter: &Arc<dyn RadioAdapter>, is_scanning: &Arc<AtomicBool>) -> Option<Self> {
        if is_scanning.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            adapter: Arc::clone(adapter),
            is_scanning: Arc::clone(is_scanning),
            radio_scanning: false,
        })
    }

    /// Stop the adapter scan and release the scanner.
    async fn finish(mut self) {
        if self.radio_scanning {
            self.radio_scanning = false;
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.is_scanning.store(false, Ordering::SeqCst);
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if self.radio_scanning {
            debug!("Scan cancelled, stopping adapter scan");
            let adapter = Arc::clone(&self.adapter);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = adapter.stop_scan().await {
                            warn!("Failed to stop cancelled scan: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to stop cancelled scan"),
            }
        }
        self.is_scanning.store(false, Ordering::SeqCst);
    }
}

impl Scanner {
    /// Create a scanner over an adapter.
    pub fn new(adapter: Arc<dyn RadioAdapter>, options: ScanOptions) -> Self {
        Self {
            adapter,
            options,
            is_scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if a pass is running.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Run one discovery pass.
    ///
    /// Collects advertisements for `duration`. When `name_filter` is given
    /// (and not empty) the pass resolves as soon as an advertised name
    /// contains it, case-insensitively, returning everything collected so
    /// far. The adapter is always returned to idle before this resolves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanInProgress`] if another pass is running, or the
    /// adapter error if scanning cannot be started.
    pub async fn scan(
        &self,
        duration: Duration,
        name_filter: Option<&str>,
    ) -> Result<Vec<DiscoveredDevice>> {
        let Some(mut guard) = ScanGuard::acquire(&self.adapter, &self.is_scanning) else {
            debug!("Scan requested while another is running");
            return Err(Error::ScanInProgress);
        };

        let name_filter = name_filter.filter(|f| !f.is_empty());
        info!(
            "Starting BLE scan for {:?} (name filter: {:?})",
            duration, name_filter
        );

        // Subscribe before starting so no early advertisement is missed.
        let events = self.adapter.events();

        if let Err(e) = self.adapter.start_scan(self.options.clone()).await {
            warn!("Failed to start scan: {}", e);
            guard.finish().await;
            return Err(e);
        }
        guard.radio_scanning = true;

        let found = Self::collect(events, duration, name_filter).await;
        guard.finish().await;

        info!("Scan finished with {} device(s)", found.len());
        Ok(found.into_devices())
    }

    /// Drain adapter events until the deadline or a name match.
    ///
    /// Takes the receiver by value so the listener is detached on return.
    async fn collect(
        mut events: broadcast::Receiver<AdapterEvent>,
        duration: Duration,
        name_filter: Option<&str>,
    ) -> DiscoverySet {
        let mut found = DiscoverySet::default();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Scan window elapsed");
                    break;
                }
                event = events.recv() => match event {
                    Ok(AdapterEvent::Advertisement(advertisement)) => {
                        let device = DiscoveredDevice::from_advertisement(&advertisement);
                        trace!("Advertisement from {} ({:?})", device.id, device.display_name);

                        let matched = name_filter
                            .map(|filter| device.name_matches(filter))
                            .unwrap_or(false);
                        found.upsert(device);

                        if matched {
                            info!("Device matching {:?} found, ending scan early", name_filter);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Scanner lagged, {} adapter events dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Adapter event channel closed during scan");
                        break;
                    }
                }
            }
        }

        found
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.is_scanning.store(false, Ordering::SeqCst);
    }
}
