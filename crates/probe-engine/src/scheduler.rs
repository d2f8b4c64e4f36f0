//! Repeating-loop controller.
//!
//! ```text
//! Idle --start--> Probing --round done--> Waiting --timer--> Probing ...
//!   ^                |                       |
//!   +------stop------+-----------stop--------+
//! ```
//!
//! Each `start` opens a session with its own stop channel, so a loop that is
//! still unwinding after `stop` can never be confused with a newer one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::checker::Prober;
use crate::dispatcher::{Dispatcher, RoundOutcome, stop_requested};
use crate::events::{EventBus, ProbeEvent};
use crate::progress::ProgressSnapshot;
use crate::settings::{ProbeDefaults, ProbeSettings};
use crate::store::{AssetRepository, ConfigStore, HistoryStore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No assets to probe")]
    NoAssets,
    #[error("A probe run is already active")]
    AlreadyRunning,
    #[error("Failed to load assets: {0:#}")]
    Repository(anyhow::Error),
}

/// Scheduler state; `Probing` and `Waiting` are the two phases of looping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Probing,
    Waiting,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self != RunState::Idle
    }
}

/// Combined view returned by [`Scheduler::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub state: RunState,
    pub progress: ProgressSnapshot,
}

struct Session {
    id: u64,
    stop: watch::Sender<bool>,
}

struct Inner {
    dispatcher: Dispatcher,
    repository: Arc<dyn AssetRepository>,
    config: Arc<dyn ConfigStore>,
    defaults: ProbeDefaults,
    bus: EventBus,
    state: watch::Sender<RunState>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session unless one is active; returns its id and stop receiver
    fn open_session(&self, initial: RunState) -> Option<(u64, watch::Receiver<bool>)> {
        let mut session = self.lock_session();
        if session.is_some() {
            return None;
        }
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        *session = Some(Session { id, stop });
        self.state.send_replace(initial);
        drop(session);

        self.bus.publish_status(true);
        Some((id, stop_rx))
    }

    /// Close the active session, or only session `id` when given
    fn close_session(&self, id: Option<u64>) -> bool {
        let mut session = self.lock_session();
        let matches = match (session.as_ref(), id) {
            (Some(active), Some(id)) => active.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        if let Some(active) = session.take() {
            let _ = active.stop.send(true);
        }
        self.state.send_replace(RunState::Idle);
        drop(session);

        self.bus.publish_status(false);
        true
    }

    /// Move between looping phases unless the session was stopped meanwhile
    fn set_phase(&self, stop: &watch::Receiver<bool>, phase: RunState) -> bool {
        let _session = self.lock_session();
        if *stop.borrow() {
            return false;
        }
        self.state.send_replace(phase);
        true
    }

    async fn probe_round(&self, stop: &watch::Receiver<bool>) -> Option<RoundOutcome> {
        let settings = ProbeSettings::load(self.config.as_ref(), &self.defaults).await;
        match self.repository.list_all().await {
            Ok(assets) => Some(
                self.dispatcher
                    .run_round(assets, settings.concurrency, settings.active_proxy().cloned(), stop.clone())
                    .await,
            ),
            Err(e) => {
                warn!("Failed to load assets, skipping round: {:#}", e);
                None
            }
        }
    }

    async fn run_loop(self: Arc<Self>, interval_override: Option<Duration>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            if let Some(RoundOutcome::AlreadyRunning) = self.probe_round(&stop).await {
                debug!("Previous round still unwinding, skipping this iteration");
            }

            if *stop.borrow() {
                break;
            }

            let interval = match interval_override {
                Some(interval) => interval,
                None => ProbeSettings::load(self.config.as_ref(), &self.defaults).await.interval,
            };

            if !self.set_phase(&stop, RunState::Waiting) {
                break;
            }
            debug!(interval_ms = interval.as_millis() as u64, "Waiting for next probe round");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_requested(&mut stop) => break,
            }

            if !self.set_phase(&stop, RunState::Probing) {
                break;
            }
        }
        debug!("Probe loop exited");
    }
}

/// Owns run state and drives rounds back to back
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        prober: Arc<dyn Prober>,
        repository: Arc<dyn AssetRepository>,
        config: Arc<dyn ConfigStore>,
        history: Arc<dyn HistoryStore>,
        defaults: ProbeDefaults,
    ) -> Self {
        let bus = EventBus::new();
        let dispatcher = Dispatcher::new(prober, repository.clone(), history, bus.clone());
        let (state, _) = watch::channel(RunState::Idle);

        Self {
            inner: Arc::new(Inner {
                dispatcher,
                repository,
                config,
                defaults,
                bus,
                state,
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Observe engine events
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.inner.bus.subscribe()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.dispatcher.progress()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state();
        SchedulerStatus { running: state.is_running(), state, progress: self.progress() }
    }

    /// Start looping. A no-op when already looping; fails with
    /// [`SchedulerError::NoAssets`] when there is nothing to probe.
    pub async fn start(&self, interval_override: Option<Duration>) -> Result<(), SchedulerError> {
        if self.is_running() {
            debug!("Probe loop already running");
            return Ok(());
        }

        self.ensure_assets().await?;

        let Some((_, stop)) = self.inner.open_session(RunState::Probing) else {
            debug!("Probe loop already running");
            return Ok(());
        };
        info!(interval_override_ms = interval_override.map(|d| d.as_millis() as u64), "Probe loop started");

        tokio::spawn(self.inner.clone().run_loop(interval_override, stop));
        Ok(())
    }

    /// Probe every asset once, without looping
    pub async fn run_once(&self) -> Result<RoundOutcome, SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.ensure_assets().await?;

        let (id, stop) = self.inner.open_session(RunState::Probing).ok_or(SchedulerError::AlreadyRunning)?;
        let outcome = self.inner.probe_round(&stop).await;
        self.inner.close_session(Some(id));

        outcome.ok_or_else(|| SchedulerError::Repository(anyhow::anyhow!("asset list unavailable")))
    }

    /// Stop looping. Safe to call in any state; in-flight probes finish on
    /// their own but no further round starts.
    pub fn stop(&self) {
        if self.inner.close_session(None) {
            info!("Probe loop stopped");
        } else {
            debug!("Stop requested while idle");
        }
    }

    async fn ensure_assets(&self) -> Result<(), SchedulerError> {
        let assets = self.inner.repository.list_all().await.map_err(SchedulerError::Repository)?;
        if assets.is_empty() {
            return Err(SchedulerError::NoAssets);
        }
        Ok(())
    }
}
