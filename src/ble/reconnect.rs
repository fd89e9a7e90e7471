//! Reconnection supervisor.
//!
//! Re-establishes a lost link with exponential backoff. At most one
//! reconnection sequence runs at a time; concurrent triggers while a
//! sequence is in flight are no-ops.
//!
//! ```text
//! Idle -> Attempting -> Idle        (link restored)
//!              |
//!              +------> Attempting  (failure, after backoff)
//!              +------> GivenUp     (attempt > max_attempts)
//!              +------> Aborted     (manual disconnect)
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ble::monitor::HealthMonitor;
use crate::ble::session::{HealthStatus, Session};
use crate::config::BackoffPolicy;

/// Phase of the reconnection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SupervisorPhase {
    /// Nothing running.
    #[default]
    Idle,
    /// A sequence is running.
    Attempting,
    /// The attempt ceiling was hit; needs re-arming or a fresh connect.
    GivenUp,
    /// Stopped by a manual disconnect; needs a fresh connect.
    Aborted,
}

impl std::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Attempting => write!(f, "Attempting"),
            Self::GivenUp => write!(f, "GivenUp"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Snapshot of the supervisor's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectionState {
    /// Attempts made in the current sequence.
    pub attempt: u32,
    /// Delay before the next attempt.
    pub current_delay: Duration,
    /// Whether a sequence is running.
    pub in_progress: bool,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// State machine phase.
    pub phase: SupervisorPhase,
}

/// How a reconnection sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Reconnected,
    GivenUp,
    Aborted,
    NoTarget,
}

/// Mutable counters, guarded by one lock.
#[derive(Debug)]
struct Progress {
    attempt: u32,
    current_delay: Duration,
    phase: SupervisorPhase,
}

/// Drives reconnection for a [`Session`].
pub struct ReconnectionSupervisor {
    /// The session to reconnect.
    session: Arc<Session>,
    /// Health monitor restarted after every successful reconnection.
    monitor: Arc<HealthMonitor>,
    /// Backoff parameters.
    policy: RwLock<BackoffPolicy>,
    /// Attempt counter, delay and phase.
    progress: Mutex<Progress>,
    /// Whether link loss triggers reconnection.
    auto_reconnect: AtomicBool,
    /// Set by a manual disconnect; cleared by an explicit connect.
    aborted: AtomicBool,
    /// Phase broadcast for callers that wait on a sequence.
    phase_tx: watch::Sender<SupervisorPhase>,
    /// The running sequence.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionSupervisor {
    /// Create an idle supervisor.
    pub fn new(
        session: Arc<Session>,
        monitor: Arc<HealthMonitor>,
        policy: BackoffPolicy,
        auto_reconnect: bool,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SupervisorPhase::Idle);

        Self {
            session,
            monitor,
            progress: Mutex::new(Progress {
                attempt: 0,
                current_delay: policy.initial_delay,
                phase: SupervisorPhase::Idle,
            }),
            policy: RwLock::new(policy),
            auto_reconnect: AtomicBool::new(auto_reconnect),
            aborted: AtomicBool::new(false),
            phase_tx,
            task: Mutex::new(None),
        }
    }

    /// Snapshot of the counters.
    pub fn state(&self) -> ReconnectionState {
        let max_attempts = self.policy.read().max_attempts;
        let progress = self.progress.lock();
        ReconnectionState {
            attempt: progress.attempt,
            current_delay: progress.current_delay,
            in_progress: progress.phase == SupervisorPhase::Attempting,
            max_attempts,
            phase: progress.phase,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SupervisorPhase {
        self.progress.lock().phase
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorPhase> {
        self.phase_tx.subscribe()
    }

    /// Current backoff parameters.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy.read().clone()
    }

    /// Check if link loss triggers reconnection.
    pub fn is_auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Enable or disable automatic reconnection.
    ///
    /// Enabling also re-arms a supervisor that gave up, and starts a
    /// sequence right away when a remembered lamp is not connected, since
    /// no further link-loss report will arrive for it. Returns `true` if
    /// a sequence was started.
    pub fn set_auto_reconnect(self: &Arc<Self>, enabled: bool) -> bool {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });

        if !enabled {
            return false;
        }

        {
            let mut progress = self.progress.lock();
            if progress.phase == SupervisorPhase::GivenUp {
                self.reset_locked(&mut progress);
                self.set_phase_locked(&mut progress, SupervisorPhase::Idle);
            }
        }

        if self.session.target().is_some() && !self.session.is_connected() {
            return self.trigger("auto-reconnect enabled");
        }
        false
    }

    /// Change the attempt ceiling.
    pub fn set_max_attempts(&self, max_attempts: u32) {
        self.policy.write().max_attempts = max_attempts;
        debug!("Max reconnection attempts set to {}", max_attempts);
    }

    /// Change the initial delay. Takes effect immediately when idle.
    pub fn set_initial_delay(&self, delay: Duration) {
        {
            let mut policy = self.policy.write();
            policy.initial_delay = delay;
            if policy.max_delay < delay {
                policy.max_delay = delay;
            }
        }

        let mut progress = self.progress.lock();
        if progress.phase != SupervisorPhase::Attempting {
            progress.current_delay = delay;
        }
        debug!("Initial reconnection delay set to {:?}", delay);
    }

    /// Reset the counters to attempt 0 and the initial delay.
    pub fn reset(&self) {
        let mut progress = self.progress.lock();
        self.reset_locked(&mut progress);
    }

    /// Clear a manual-disconnect abort and a give-up. Called on explicit connect.
    pub fn rearm(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        let mut progress = self.progress.lock();
        if progress.phase != SupervisorPhase::Attempting {
            self.reset_locked(&mut progress);
            self.set_phase_locked(&mut progress, SupervisorPhase::Idle);
        }
    }

    /// Stop any running or scheduled reconnection until the next [`rearm`](Self::rearm).
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);

        let mut progress = self.progress.lock();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if progress.phase == SupervisorPhase::Attempting {
            info!("Reconnection aborted");
        }
        self.set_phase_locked(&mut progress, SupervisorPhase::Aborted);
    }

    /// Automatic trigger (link loss, health check).
    ///
    /// Returns `true` if this call started a sequence. A no-op when one is
    /// already running, auto-reconnect is off, the supervisor gave up, or a
    /// manual disconnect happened.
    pub fn trigger(self: &Arc<Self>, reason: &str) -> bool {
        if !self.is_auto_reconnect() {
            debug!("Auto-reconnect disabled, ignoring {}", reason);
            return false;
        }
        self.begin(reason, false)
    }

    /// Reconnect on behalf of a command and wait for the outcome.
    ///
    /// Joins a running sequence instead of starting a second one, and
    /// re-arms a supervisor that gave up since a command is an explicit
    /// request. Waits at most `wait`; the sequence keeps running in the
    /// background past that. Returns whether the session is ready.
    pub async fn reconnect_now(self: &Arc<Self>, wait: Duration) -> bool {
        if self.session.is_ready() {
            return true;
        }
        if self.session.target().is_none() {
            debug!("No remembered target to reconnect to");
            return false;
        }

        self.begin("command retry", true);

        // Subscribe after starting, so the wait sees `Attempting` or a later phase.
        let mut phase = self.subscribe();
        let finished = tokio::time::timeout(
            wait,
            phase.wait_for(|p| *p != SupervisorPhase::Attempting),
        )
        .await
        .map(|settled| settled.is_ok());

        match finished {
            Ok(true) => self.session.is_ready(),
            Ok(false) => false,
            Err(_) => {
                warn!("Reconnection still running after {:?}", wait);
                false
            }
        }
    }

    /// React to an unsolicited link-loss report.
    pub fn on_link_lost(self: &Arc<Self>, peripheral_id: &str) -> bool {
        if !self.session.handle_link_lost(peripheral_id) {
            return false;
        }
        self.monitor.stop();
        self.trigger("link lost");
        true
    }

    /// Start (or restart) the health monitor wired back to this supervisor.
    ///
    /// Refused after a manual disconnect; returns the monitor id otherwise.
    pub fn start_monitor(self: &Arc<Self>) -> Option<u64> {
        if self.aborted.load(Ordering::SeqCst) {
            debug!("Not starting health monitor after manual disconnect");
            return None;
        }

        let supervisor = Arc::downgrade(self);
        let id = self.monitor.start(self.session.clone(), move |status| {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_unhealthy(status);
            }
        });

        // An abort that raced the start must not leave a monitor behind.
        if self.aborted.load(Ordering::SeqCst) {
            self.monitor.stop();
            return None;
        }
        Some(id)
    }

    fn handle_unhealthy(self: &Arc<Self>, status: HealthStatus) {
        if status == HealthStatus::Stale {
            self.session.mark_link_lost();
        }
        self.trigger("health check");
    }

    /// Start a sequence unless one is running. Single-flight point.
    fn begin(self: &Arc<Self>, reason: &str, rearm: bool) -> bool {
        let mut progress = self.progress.lock();

        if self.aborted.load(Ordering::SeqCst) {
            debug!("Reconnection disabled after manual disconnect ({})", reason);
            return false;
        }

        match progress.phase {
            SupervisorPhase::Attempting => {
                debug!("Reconnection already in progress, ignoring {}", reason);
                return false;
            }
            SupervisorPhase::GivenUp if !rearm => {
                debug!("Reconnection gave up, ignoring {}", reason);
                return false;
            }
            SupervisorPhase::GivenUp | SupervisorPhase::Aborted => {
                self.reset_locked(&mut progress);
            }
            SupervisorPhase::Idle => {}
        }

        info!("Starting reconnection ({})", reason);
        self.set_phase_locked(&mut progress, SupervisorPhase::Attempting);

        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = supervisor.run_sequence().await;
            supervisor.finish(outcome);
        });
        *self.task.lock() = Some(task);
        true
    }

    /// The backoff loop.
    async fn run_sequence(self: &Arc<Self>) -> Outcome {
        let Some(target) = self.session.target() else {
            warn!("Reconnection requested with no remembered target");
            return Outcome::NoTarget;
        };

        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Outcome::Aborted;
            }

            let max_attempts = self.policy.read().max_attempts;
            let (attempt, delay) = {
                let mut progress = self.progress.lock();
                progress.attempt += 1;
                (progress.attempt, progress.current_delay)
            };

            if attempt > max_attempts {
                error!(
                    "Giving up on {} after {} reconnection attempts",
                    target.id, max_attempts
                );
                return Outcome::GivenUp;
            }

            info!(
                "Reconnection attempt {}/{} to {} in {:?}",
                attempt, max_attempts, target.id, delay
            );
            tokio::time::sleep(delay).await;

            if self.aborted.load(Ordering::SeqCst) {
                return Outcome::Aborted;
            }

            match self.session.connect(&target).await {
                Ok(()) => {
                    if self.aborted.load(Ordering::SeqCst) {
                        return Outcome::Aborted;
                    }
                    info!("Reconnected to {} on attempt {}", target.id, attempt);
                    self.reset();
                    self.start_monitor();
                    return Outcome::Reconnected;
                }
                Err(e) => {
                    let policy = self.policy.read().clone();
                    let next = policy.next_delay(delay, policy.jitter());
                    self.progress.lock().current_delay = next;
                    warn!(
                        "Reconnection attempt {}/{} to {} failed: {} (next delay {:?})",
                        attempt, max_attempts, target.id, e, next
                    );
                }
            }
        }
    }

    fn finish(&self, outcome: Outcome) {
        let mut progress = self.progress.lock();
        let phase = if self.aborted.load(Ordering::SeqCst) {
            SupervisorPhase::Aborted
        } else {
            match outcome {
                Outcome::Reconnected | Outcome::NoTarget => SupervisorPhase::Idle,
                Outcome::GivenUp => SupervisorPhase::GivenUp,
                Outcome::Aborted => SupervisorPhase::Aborted,
            }
        };
        self.set_phase_locked(&mut progress, phase);
    }

    fn reset_locked(&self, progress: &mut Progress) {
        progress.attempt = 0;
        progress.current_delay = self.policy.read().initial_delay;
    }

    fn set_phase_locked(&self, progress: &mut Progress, phase: SupervisorPhase) {
        if progress.phase != phase {
            debug!("Reconnection phase: {} -> {}", progress.phase, phase);
        }
        progress.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
