//! Periodic link health monitor.
//!
//! One monitor task per session at most. Starting a monitor always stops the
//! previous one first, and the task ends itself after reporting a link that
//! needs recovery; whoever restores the link starts a fresh one.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::ble::session::{HealthStatus, Session};
use crate::config::clamp_health_interval;

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    /// Sequence number of this monitor instance.
    id: u64,
    /// The periodic task.
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Sequence number of this monitor instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the task is still ticking.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Periodic health checker for a [`Session`].
pub struct HealthMonitor {
    /// Tick period.
    interval: RwLock<Duration>,
    /// The running instance, if any.
    handle: Mutex<Option<MonitorHandle>>,
    /// Monitor instance counter.
    counter: AtomicU64,
}

impl HealthMonitor {
    /// Create a stopped monitor. The interval is clamped to the floor.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: RwLock::new(clamp_health_interval(interval)),
            handle: Mutex::new(None),
            counter: AtomicU64::new(0),
        }
    }

    /// Current tick period.
    pub fn interval(&self) -> Duration {
        *self.interval.read()
    }

    /// Change the tick period, returning the value actually applied.
    ///
    /// A running monitor keeps its old period until it is restarted.
    pub fn set_interval(&self, interval: Duration) -> Duration {
        let interval = clamp_health_interval(interval);
        *self.interval.write() = interval;
        interval
    }

    /// Check if a monitor task is ticking.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(MonitorHandle::is_running)
            .unwrap_or(false)
    }

    /// Id of the current monitor instance.
    pub fn current_id(&self) -> Option<u64> {
        self.handle.lock().as_ref().map(MonitorHandle::id)
    }

    /// Start monitoring `session`, replacing any running monitor.
    ///
    /// `on_unhealthy` is called once, from the monitor task, with the first
    /// status that needs recovery; the task then ends.
    pub fn start<F>(&self, session: Arc<Session>, on_unhealthy: F) -> u64
    where
        F: Fn(HealthStatus) + Send + Sync + 'static,
    {
        let interval = self.interval();
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut slot = self.handle.lock();
        if let Some(previous) = slot.take() {
            debug!("Replacing health monitor #{}", previous.id);
            previous.task.abort();
        }

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let status = session.check_health().await;
                trace!("Health monitor #{} tick: {:?}", id, status);

                if status.needs_recovery() {
                    debug!("Health monitor #{} reporting {:?}", id, status);
                    on_unhealthy(status);
                    break;
                }
            }

            debug!("Health monitor #{} ended", id);
        });

        debug!("Health monitor #{} started ({:?})", id, interval);
        *slot = Some(MonitorHandle { id, task });
        id
    }

    /// Stop the running monitor. Returns `true` if one was running.
    pub fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                let was_running = handle.is_running();
                handle.task.abort();
                debug!("Health monitor #{} stopped", handle.id);
                was_running
            }
            None => false,
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.task.abort();
        }
    }
}
