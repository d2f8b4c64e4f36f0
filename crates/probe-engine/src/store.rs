//! Collaborator contracts consumed by the engine, plus an in-memory
//! implementation for headless use and tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::asset::{Asset, AssetStatus};

/// Aggregate asset counts across the whole repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCounts {
    pub total: u64,
    pub alive: u64,
}

/// One time-series sample, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub total_count: u64,
    pub alive_count: u64,
}

/// Source of the assets to probe and sink for their status
#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// All known assets, already validated
    async fn list_all(&self) -> Result<Vec<Asset>>;

    /// Record the outcome of one probe
    async fn update_status(&self, id: i64, status: AssetStatus, at: DateTime<Utc>) -> Result<()>;

    /// Current total/alive counts
    async fn aggregate_counts(&self) -> Result<AssetCounts>;
}

/// Key/value configuration, read fresh at every round boundary
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Append-only round history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, total_count: u64, alive_count: u64, at: DateTime<Utc>) -> Result<()>;

    /// Oldest-first, at most `limit` points
    async fn list(&self, limit: usize) -> Result<Vec<HistoryPoint>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    assets: Vec<Asset>,
    config: HashMap<String, String>,
    history: Vec<HistoryPoint>,
}

/// Process-local store implementing all three contracts
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: Vec<Asset>) -> Self {
        let store = Self::new();
        store.lock().assets = assets;
        store
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.lock().config.insert(key.to_string(), value.to_string());
    }

    pub fn push_asset(&self, asset: Asset) {
        self.lock().assets.push(asset);
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.lock().assets.clone()
    }

    pub fn history(&self) -> Vec<HistoryPoint> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AssetRepository for MemoryStore {
    async fn list_all(&self) -> Result<Vec<Asset>> {
        Ok(self.assets())
    }

    async fn update_status(&self, id: i64, status: AssetStatus, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let asset = inner
            .assets
            .iter_mut()
            .find(|asset| asset.id == id)
            .ok_or_else(|| anyhow!("Unknown asset id {}", id))?;
        asset.status = status;
        asset.last_check = Some(at);
        Ok(())
    }

    async fn aggregate_counts(&self) -> Result<AssetCounts> {
        let inner = self.lock();
        let alive = inner.assets.iter().filter(|a| a.status == AssetStatus::Alive).count();
        Ok(AssetCounts { total: inner.assets.len() as u64, alive: alive as u64 })
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().config.get(key).cloned())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, total_count: u64, alive_count: u64, at: DateTime<Utc>) -> Result<()> {
        self.lock().history.push(HistoryPoint { timestamp: at, total_count, alive_count });
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryPoint>> {
        let inner = self.lock();
        let mut points = inner.history.clone();
        points.sort_by_key(|p| p.timestamp);
        points.truncate(limit);
        Ok(points)
    }
}
