//! Round progress and history recording.
//!
//! The run token and the progress snapshot live behind one mutex so that a
//! token check and the update it guards can never interleave with a new round
//! starting.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::events::EventBus;
use crate::store::{AssetRepository, HistoryPoint, HistoryStore};

/// Round generation; incremented exactly once per round start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunToken(u64);

impl RunToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `processed <= total` and `alive <= processed` at all times
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    pub alive: u64,
}

#[derive(Debug, Default)]
struct RoundState {
    token: RunToken,
    snapshot: ProgressSnapshot,
}

/// Current round's progress, updated one probe at a time.
///
/// Snapshots are published while the lock is held, so observers receive them
/// in the order they were produced.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<RoundState>,
    bus: Option<EventBus>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self { state: Mutex::default(), bus: Some(bus) }
    }

    /// Start a new round: bump the token and reset the snapshot atomically
    pub fn begin_round(&self, total: u64) -> (RunToken, ProgressSnapshot) {
        let mut state = self.lock();
        state.token = RunToken(state.token.0 + 1);
        state.snapshot = ProgressSnapshot { processed: 0, total, alive: 0 };
        self.publish(state.snapshot);
        (state.token, state.snapshot)
    }

    pub fn current_token(&self) -> RunToken {
        self.lock().token
    }

    pub fn is_current(&self, token: RunToken) -> bool {
        self.current_token() == token
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot
    }

    /// Apply one probe result. Returns `None` when `token` is stale, in which
    /// case nothing changes.
    pub fn record(&self, token: RunToken, alive: bool) -> Option<ProgressSnapshot> {
        let mut state = self.lock();
        if state.token != token {
            debug!(stale = %token, current = %state.token, "Discarding stale probe result");
            return None;
        }
        let snapshot = &mut state.snapshot;
        if snapshot.processed >= snapshot.total {
            return None;
        }
        snapshot.processed += 1;
        if alive {
            snapshot.alive += 1;
        }
        let snapshot = *snapshot;
        self.publish(snapshot);
        Some(snapshot)
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        if let Some(bus) = &self.bus {
            bus.publish_progress(snapshot);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Appends one history sample per naturally completed round
pub struct HistoryRecorder {
    assets: Arc<dyn AssetRepository>,
    history: Arc<dyn HistoryStore>,
    bus: EventBus,
    last_recorded: Mutex<Option<RunToken>>,
}

impl HistoryRecorder {
    pub fn new(assets: Arc<dyn AssetRepository>, history: Arc<dyn HistoryStore>, bus: EventBus) -> Self {
        Self { assets, history, bus, last_recorded: Mutex::new(None) }
    }

    /// Record the sample for `token`'s round. A second call for the same
    /// round is a no-op returning `None`.
    pub async fn record_round(&self, token: RunToken) -> Result<Option<HistoryPoint>> {
        {
            let mut last = self.last_recorded.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|recorded| recorded >= token) {
                return Ok(None);
            }
            *last = Some(token);
        }

        let counts = self.assets.aggregate_counts().await?;
        let point = HistoryPoint {
            timestamp: Utc::now(),
            total_count: counts.total,
            alive_count: counts.alive,
        };
        self.history.append(point.total_count, point.alive_count, point.timestamp).await?;
        info!(round = %token, total = counts.total, alive = counts.alive, "Recorded round history");

        self.bus.publish_round_complete(counts.total, counts.alive);
        Ok(Some(point))
    }
}
