//! Probe engine - liveness probing for harvested network assets
//!
//! This library decides whether assets (ip/port/protocol tuples) are currently
//! reachable. It runs rounds of bounded-concurrency probes, keeps a progress
//! snapshot, records a history sample per completed round and repeats on a
//! schedule whose settings are re-read from a [`ConfigStore`] at every boundary.
//!
//! Persistence is not part of this crate: callers provide an
//! [`AssetRepository`], a [`ConfigStore`] and a [`HistoryStore`].

pub mod asset;
pub mod checker;
pub mod dispatcher;
pub mod events;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod tunnel;

#[cfg(test)]
mod testing;

// Re-export main types
pub use asset::{Asset, AssetStatus, Protocol};
pub use checker::{LivenessProbe, Prober};
pub use dispatcher::{Dispatcher, RoundOutcome};
pub use events::{EventBus, ProbeEvent};
pub use progress::{HistoryRecorder, ProgressSnapshot, ProgressTracker, RunToken};
pub use scheduler::{RunState, Scheduler, SchedulerError, SchedulerStatus};
pub use settings::{ProbeDefaults, ProbeSettings, ProxyConfig};
pub use store::{AssetCounts, AssetRepository, ConfigStore, HistoryPoint, HistoryStore, MemoryStore};
pub use tunnel::{ProxyTunnel, TunnelError};
