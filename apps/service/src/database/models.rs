use chrono::{DateTime, TimeZone, Utc};
use probe_engine::{Asset, AssetStatus, Protocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Why a stored asset row cannot be probed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("missing ip address")]
    MissingIp,
    #[error("invalid ip address '{0}'")]
    InvalidIp(String),
    #[error("missing port for {0} asset")]
    MissingPort(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Asset row as stored; every column is nullable text because rows come
/// from imports as well as from `assets add`
#[derive(Debug, Clone, Default)]
pub struct AssetRow {
    pub id: i64,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub port: Option<String>,
    pub protocol: Option<String>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub last_check: Option<i64>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = RowError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        let protocol = Protocol::parse(row.protocol.as_deref().unwrap_or_default());
        let ip = parse_ip(row.ip.as_deref())?;
        let port = parse_port(row.port.as_deref(), &protocol)?;

        Ok(Asset {
            id: row.id,
            host: row.host.unwrap_or_default(),
            ip,
            port,
            protocol,
            region: row.region.filter(|region| !region.trim().is_empty()),
            status: row.status.as_deref().map(AssetStatus::parse).unwrap_or_default(),
            last_check: row.last_check.map(millis_to_datetime),
        })
    }
}

fn parse_ip(raw: Option<&str>) -> Result<IpAddr, RowError> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty()).ok_or(RowError::MissingIp)?;
    raw.parse().map_err(|_| RowError::InvalidIp(raw.to_string()))
}

/// ICMP rows may omit the port; every other protocol needs 1..=65535
fn parse_port(raw: Option<&str>, protocol: &Protocol) -> Result<u16, RowError> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None if *protocol == Protocol::Icmp => Ok(0),
        None => Err(RowError::MissingPort(protocol.to_string())),
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port > 0 || *protocol == Protocol::Icmp => Ok(port),
            _ => Err(RowError::InvalidPort(raw.to_string())),
        },
    }
}

/// Input for `assets add`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAsset {
    pub host: String,
    pub ip: String,
    pub port: Option<u16>,
    pub protocol: String,
    pub region: Option<String>,
}

impl NewAsset {
    /// Apply the same checks as rows read back from the table
    pub fn validate(&self) -> Result<(), RowError> {
        let protocol = Protocol::parse(&self.protocol);
        parse_ip(Some(&self.ip))?;
        let port = self.port.map(|port| port.to_string());
        parse_port(port.as_deref(), &protocol)?;
        Ok(())
    }
}

/// Per-region asset counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStats {
    pub region: String,
    pub total: u64,
    pub alive: u64,
}

pub fn datetime_to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}
