//! HTTP CONNECT reachability through a forward proxy.
//!
//! The tunnel is never used for data: once the proxy answers the CONNECT the
//! socket is shut down.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

const TUNNEL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_STATUS_LINE: u64 = 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid proxy URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Proxy URL has no host: {0}")]
    MissingHost(String),
    #[error("Proxy URL has no port and no known default: {0}")]
    MissingPort(String),
}

/// Tests TCP reachability of a target through a proxy's CONNECT method
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    timeout: Duration,
}

impl Default for ProxyTunnel {
    fn default() -> Self {
        Self { timeout: TUNNEL_TIMEOUT }
    }
}

impl ProxyTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// `Ok(true)` iff the proxy answers the CONNECT with status 200.
    ///
    /// Connection errors, timeouts and any other status are `Ok(false)`; only
    /// an unusable proxy URL is an error.
    pub async fn check_through_proxy(&self, proxy_url: &str, target: SocketAddr) -> Result<bool, TunnelError> {
        let url = Url::parse(proxy_url)?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::MissingHost(proxy_url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TunnelError::MissingPort(proxy_url.to_string()))?;

        let request = connect_request(&url, target);

        match timeout(self.timeout, exchange(&host, port, &request)).await {
            Ok(Ok(Some(status))) => {
                debug!(%target, status, "Proxy answered CONNECT");
                Ok(status == 200)
            }
            Ok(Ok(None)) => {
                debug!(%target, "Proxy sent no usable status line");
                Ok(false)
            }
            Ok(Err(e)) => {
                debug!(%target, "Proxy CONNECT failed: {}", e);
                Ok(false)
            }
            Err(_) => {
                debug!(%target, "Proxy CONNECT timed out");
                Ok(false)
            }
        }
    }
}

fn connect_request(proxy: &Url, target: SocketAddr) -> String {
    let auth_header = if proxy.username().is_empty() {
        String::new()
    } else {
        let token = Base64.encode(format!("{}:{}", proxy.username(), proxy.password().unwrap_or("")));
        format!("Proxy-Authorization: Basic {}\r\n", token)
    };

    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{auth_header}\r\n")
}

/// Send the CONNECT and read only the status line, then tear the socket down
async fn exchange(host: &str, port: u16, request: &str) -> std::io::Result<Option<u16>> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut line = String::new();
    BufReader::new(&mut stream).take(MAX_STATUS_LINE).read_line(&mut line).await?;

    let _ = stream.shutdown().await;
    drop(stream);

    Ok(parse_status_line(&line))
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
