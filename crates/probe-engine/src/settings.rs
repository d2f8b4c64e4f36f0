//! Live probe settings read from the [`ConfigStore`] at round boundaries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::ConfigStore;

pub const KEY_CONCURRENCY: &str = "probe_concurrency";
pub const KEY_INTERVAL: &str = "probe_interval";
pub const KEY_PROXY_URL: &str = "proxy_url";
pub const KEY_PROXY_ENABLED: &str = "proxy_enabled";

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 1000;

/// Clamp an externally supplied concurrency into `[1, 1000]`
pub fn clamp_concurrency(requested: i64) -> usize {
    requested.clamp(MIN_CONCURRENCY as i64, MAX_CONCURRENCY as i64) as usize
}

/// Forward proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub enabled: bool,
}

impl ProxyConfig {
    /// A proxy is mandated only when it is enabled and has a URL
    pub fn is_mandated(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }
}

/// Fallbacks for keys missing from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDefaults {
    pub concurrency: usize,
    pub interval_seconds: u64,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self { concurrency: 200, interval_seconds: 30 }
    }
}

/// Settings in effect for one round (and the wait that follows it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub concurrency: usize,
    pub interval: Duration,
    pub proxy: Option<ProxyConfig>,
}

impl ProbeSettings {
    /// Read the current settings. Store failures and unparsable values fall
    /// back to `defaults`.
    pub async fn load(store: &dyn ConfigStore, defaults: &ProbeDefaults) -> Self {
        let concurrency = match read(store, KEY_CONCURRENCY).await {
            Some(raw) => raw.trim().parse::<i64>().map(clamp_concurrency).unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring unparsable {}", KEY_CONCURRENCY);
                clamp_concurrency(defaults.concurrency as i64)
            }),
            None => clamp_concurrency(defaults.concurrency as i64),
        };

        let interval_seconds = match read(store, KEY_INTERVAL).await {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring unparsable {}", KEY_INTERVAL);
                defaults.interval_seconds
            }),
            None => defaults.interval_seconds,
        };

        let proxy = match read(store, KEY_PROXY_URL).await {
            Some(url) => {
                let enabled = read(store, KEY_PROXY_ENABLED)
                    .await
                    .is_some_and(|raw| raw.trim() == "true");
                Some(ProxyConfig { url, enabled })
            }
            None => None,
        };

        Self { concurrency, interval: Duration::from_secs(interval_seconds), proxy }
    }

    /// The proxy to route through, if one is mandated
    pub fn active_proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref().filter(|proxy| proxy.is_mandated())
    }
}

async fn read(store: &dyn ConfigStore, key: &str) -> Option<String> {
    match store.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, "Config read failed, using default: {}", e);
            None
        }
    }
}
