use tokio::sync::broadcast;
use tracing::debug;

use crate::asset::Asset;
use crate::progress::ProgressSnapshot;

const BUS_CAPACITY: usize = 1024;

/// Notifications pushed to observers of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// Snapshot after a probe resolved (or after a round reset)
    Progress(ProgressSnapshot),
    /// Looping started or stopped
    Status { running: bool },
    /// An asset got a new status
    AssetUpdated(Asset),
    /// A probe faulted and was counted as dead
    ProbeFault { asset_id: i64, message: String },
    /// A round finished naturally and its history sample was recorded
    RoundComplete { total: u64, alive: u64 },
}

/// Broadcast bus owned by one scheduler; observers call [`EventBus::subscribe`].
///
/// Slow subscribers lag and lose the oldest events rather than blocking probes.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProbeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.tx.subscribe()
    }

    pub fn publish_progress(&self, snapshot: ProgressSnapshot) {
        self.publish(ProbeEvent::Progress(snapshot));
    }

    pub fn publish_status(&self, running: bool) {
        debug!(running, "Event bus: publishing status change");
        self.publish(ProbeEvent::Status { running });
    }

    pub fn publish_asset(&self, asset: Asset) {
        self.publish(ProbeEvent::AssetUpdated(asset));
    }

    pub fn publish_fault(&self, asset_id: i64, message: String) {
        self.publish(ProbeEvent::ProbeFault { asset_id, message });
    }

    pub fn publish_round_complete(&self, total: u64, alive: u64) {
        debug!(total, alive, "Event bus: publishing round complete");
        self.publish(ProbeEvent::RoundComplete { total, alive });
    }

    fn publish(&self, ev: ProbeEvent) {
        // Ignore errors if there are no receivers
        let _ = self.tx.send(ev);
    }
}
