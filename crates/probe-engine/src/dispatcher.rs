//! Bounded-concurrency round executor.
//!
//! A round keeps up to `concurrency` probes in flight and refills a slot as
//! soon as any probe resolves, so a few slow targets never hold back the rest.
//! Results are applied by the probe tasks themselves, gated by the round's
//! [`RunToken`]; a stopped round detaches its in-flight probes and lets them
//! finish on their own.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::asset::{Asset, AssetStatus};
use crate::checker::Prober;
use crate::events::EventBus;
use crate::progress::{HistoryRecorder, ProgressSnapshot, ProgressTracker, RunToken};
use crate::settings::{ProxyConfig, clamp_concurrency};
use crate::store::{AssetRepository, HistoryStore};

/// How a call to [`Dispatcher::run_round`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every asset was probed and the history sample was recorded
    Completed { token: RunToken, snapshot: ProgressSnapshot },
    /// A stop was observed before the queue drained
    Cancelled { token: RunToken, snapshot: ProgressSnapshot },
    /// Another round was already running; nothing was done
    AlreadyRunning,
}

impl RoundOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RoundOutcome::Completed { .. })
    }
}

/// State shared between the coordinator and its probe tasks
struct Shared {
    prober: Arc<dyn Prober>,
    repository: Arc<dyn AssetRepository>,
    tracker: ProgressTracker,
    bus: EventBus,
    /// Held shared from a result's token check through its status write, and
    /// exclusively while a new round takes its token
    round_gate: RwLock<()>,
}

impl Shared {
    async fn probe_one(&self, asset: Asset, proxy: Option<&ProxyConfig>, token: RunToken) {
        let alive = match AssertUnwindSafe(self.prober.probe(&asset, proxy)).catch_unwind().await {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                warn!(asset_id = asset.id, protocol = %asset.protocol, "Probe fault, counting as dead: {:#}", e);
                self.bus.publish_fault(asset.id, format!("{:#}", e));
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(asset_id = asset.id, protocol = %asset.protocol, "Probe panicked, counting as dead: {}", message);
                self.bus.publish_fault(asset.id, message);
                false
            }
        };

        let _gate = self.round_gate.read().await;
        if self.tracker.record(token, alive).is_none() {
            return;
        }

        let status = AssetStatus::from_alive(alive);
        let now = Utc::now();
        if let Err(e) = self.repository.update_status(asset.id, status, now).await {
            warn!(asset_id = asset.id, "Failed to store asset status: {:#}", e);
        }
        self.bus.publish_asset(asset.checked(status, now));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "probe panicked".to_string()
    }
}

/// Releases the single-round guard when dropped
struct RoundGuard<'a>(&'a AtomicBool);

impl<'a> RoundGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).ok().map(|_| Self(flag))
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves once `stop` reads `true`; never resolves if the sender is gone
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs probe rounds over a set of assets
pub struct Dispatcher {
    shared: Arc<Shared>,
    recorder: HistoryRecorder,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        prober: Arc<dyn Prober>,
        repository: Arc<dyn AssetRepository>,
        history: Arc<dyn HistoryStore>,
        bus: EventBus,
    ) -> Self {
        let recorder = HistoryRecorder::new(repository.clone(), history, bus.clone());
        Self {
            shared: Arc::new(Shared {
                prober,
                repository,
                tracker: ProgressTracker::with_bus(bus.clone()),
                bus,
                round_gate: RwLock::new(()),
            }),
            recorder,
            running: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current (or last) round
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.tracker.snapshot()
    }

    pub fn current_token(&self) -> RunToken {
        self.shared.tracker.current_token()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Probe every asset once with at most `concurrency` probes in flight.
    ///
    /// Setting `stop` to `true` ends dispatching at the next boundary; the
    /// round then reports [`RoundOutcome::Cancelled`] and records no history.
    ///
    /// The concurrency bound applies per round. Probes detached by a stopped
    /// round keep running until their own timeouts, so right after a restart
    /// up to twice `concurrency` sockets may be open. Their results are
    /// dropped once the new round has taken its token, and the new round
    /// waits for any status write they already started.
    pub async fn run_round(
        &self,
        assets: Vec<Asset>,
        concurrency: usize,
        proxy: Option<ProxyConfig>,
        mut stop: watch::Receiver<bool>,
    ) -> RoundOutcome {
        let Some(_guard) = RoundGuard::acquire(&self.running) else {
            debug!("Probe round already running, ignoring request");
            return RoundOutcome::AlreadyRunning;
        };

        let limit = clamp_concurrency(concurrency.try_into().unwrap_or(i64::MAX));
        let total = assets.len();
        let (token, _) = {
            let _exclusive = self.shared.round_gate.write().await;
            self.shared.tracker.begin_round(total as u64)
        };
        info!(round = %token, total, concurrency = limit, proxied = proxy.is_some(), "Starting probe round");

        let proxy = proxy.map(Arc::new);
        let mut queue: VecDeque<Asset> = assets.into();
        let mut in_flight = JoinSet::new();
        let mut cancelled = false;

        loop {
            if *stop.borrow() {
                cancelled = true;
                break;
            }

            while in_flight.len() < limit {
                let Some(asset) = queue.pop_front() else { break };
                let shared = self.shared.clone();
                let proxy = proxy.clone();
                in_flight.spawn(async move { shared.probe_one(asset, proxy.as_deref(), token).await });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    if let Some(Err(e)) = joined {
                        error!(round = %token, "Probe task failed: {}", e);
                    }
                }
                _ = stop_requested(&mut stop) => {
                    cancelled = true;
                    break;
                }
            }
        }

        let snapshot = self.shared.tracker.snapshot();

        if cancelled || *stop.borrow() || !self.shared.tracker.is_current(token) {
            let detached = in_flight.len();
            in_flight.detach_all();
            info!(
                round = %token,
                processed = snapshot.processed,
                total = snapshot.total,
                in_flight = detached,
                remaining = queue.len(),
                "Probe round stopped before completion"
            );
            return RoundOutcome::Cancelled { token, snapshot };
        }

        info!(round = %token, processed = snapshot.processed, alive = snapshot.alive, "Probe round completed");
        if let Err(e) = self.recorder.record_round(token).await {
            warn!(round = %token, "Failed to record round history: {:#}", e);
        }

        RoundOutcome::Completed { token, snapshot }
    }
}
