use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Liveness status of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    #[default]
    Unknown,
    Alive,
    Dead,
}

impl AssetStatus {
    pub fn from_alive(alive: bool) -> Self {
        if alive { AssetStatus::Alive } else { AssetStatus::Dead }
    }

    /// Parse a stored status label; anything unrecognised is `Unknown`
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "alive" => AssetStatus::Alive,
            "dead" => AssetStatus::Dead,
            _ => AssetStatus::Unknown,
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetStatus::Unknown => write!(f, "unknown"),
            AssetStatus::Alive => write!(f, "alive"),
            AssetStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Protocol family used to decide which liveness strategy applies.
///
/// Anything that is not ICMP or HTTP(S) is probed at the transport layer; the
/// original service label (`ssh`, `mysql`, ...) is kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "service")]
pub enum Protocol {
    Icmp,
    Http,
    Https,
    Tcp(String),
}

impl Protocol {
    /// Case-insensitive parse; never fails
    pub fn parse(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        match label.as_str() {
            "icmp" => Protocol::Icmp,
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            _ => Protocol::Tcp(label),
        }
    }

    /// URL scheme for the HTTP family
    pub fn scheme(&self) -> Option<&'static str> {
        match self {
            Protocol::Http => Some("http"),
            Protocol::Https => Some("https"),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
            Protocol::Tcp(service) if service.is_empty() => write!(f, "tcp"),
            Protocol::Tcp(service) => write!(f, "{}", service),
        }
    }
}

/// A network endpoint whose reachability is tracked over time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub region: Option<String>,
    pub status: AssetStatus,
    pub last_check: Option<DateTime<Utc>>,
}

impl Asset {
    /// Create a never-checked asset
    pub fn new(id: i64, host: impl Into<String>, ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self {
            id,
            host: host.into(),
            ip,
            port,
            protocol,
            region: None,
            status: AssetStatus::Unknown,
            last_check: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Copy of this asset carrying a fresh check outcome
    pub fn checked(&self, status: AssetStatus, at: DateTime<Utc>) -> Self {
        Self { status, last_check: Some(at), ..self.clone() }
    }
}
