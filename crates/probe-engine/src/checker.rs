use anyhow::{Result, anyhow};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::asset::{Asset, Protocol};
use crate::settings::ProxyConfig;
use crate::tunnel::ProxyTunnel;

const ICMP_WAIT: Duration = Duration::from_secs(2);
const ICMP_HARD_LIMIT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_TIMEOUT: Duration = Duration::from_secs(3);

/// Liveness strategy seam used by the dispatcher
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// `Ok(false)` when the target is unreachable, `Err` when the probe itself
    /// could not be carried out (bad proxy URL, missing ping binary, ...)
    async fn probe(&self, asset: &Asset, proxy: Option<&ProxyConfig>) -> Result<bool>;
}

/// ICMP echo through the OS `ping` utility
pub struct IcmpChecker {
    wait: Duration,
    hard_limit: Duration,
}

impl IcmpChecker {
    pub fn new(wait: Duration, hard_limit: Duration) -> Self {
        Self { wait, hard_limit }
    }

    pub async fn check(&self, ip: IpAddr) -> Result<bool> {
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w"]).arg(self.wait.as_millis().to_string());
        } else {
            cmd.args(["-c", "1", "-W"]).arg(self.wait.as_secs().max(1).to_string());
        }
        cmd.arg(ip.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(self.hard_limit, cmd.status()).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => Err(anyhow!("Failed to launch ping: {}", e)),
            Err(_) => {
                debug!(%ip, "ping did not exit in time");
                Ok(false)
            }
        }
    }
}

/// HTTP/HTTPS checker.
///
/// Any response at all, 5xx included, proves the service is reachable; only
/// transport failures count as dead. Redirects are not followed.
pub struct HttpChecker {
    timeout: Duration,
    direct: reqwest::Client,
    proxied: RwLock<Option<(String, reqwest::Client)>>,
}

impl HttpChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Probed targets commonly serve self-signed certificates
        let direct = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()?;

        Ok(Self { timeout, direct, proxied: RwLock::new(None) })
    }

    pub async fn check(&self, asset: &Asset, proxy: Option<&ProxyConfig>) -> Result<bool> {
        let scheme = asset
            .protocol
            .scheme()
            .ok_or_else(|| anyhow!("Protocol {} is not HTTP", asset.protocol))?;
        let url = format!("{}://{}", scheme, asset.socket_addr());

        let client = match proxy {
            Some(proxy) => self.proxied_client(&proxy.url)?,
            None => self.direct.clone(),
        };

        match client.get(&url).send().await {
            Ok(response) => {
                debug!(%url, status = response.status().as_u16(), "HTTP target answered");
                Ok(true)
            }
            Err(e) => {
                debug!(%url, "HTTP request failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Client routed only through `proxy_url`; rebuilt when the URL changes
    fn proxied_client(&self, proxy_url: &str) -> Result<reqwest::Client> {
        if let Some((url, client)) = self.proxied.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if url == proxy_url {
                return Ok(client.clone());
            }
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .build()?;

        *self.proxied.write().unwrap_or_else(PoisonError::into_inner) = Some((proxy_url.to_string(), client.clone()));
        Ok(client)
    }
}

/// TCP port checker
pub struct TcpChecker {
    timeout_duration: Duration,
}

impl TcpChecker {
    pub fn new(timeout_duration: Duration) -> Self {
        Self { timeout_duration }
    }

    pub async fn check(&self, target: SocketAddr) -> Result<bool> {
        match timeout(self.timeout_duration, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(true)
            }
            Ok(Err(e)) => {
                debug!(%target, "TCP connection failed: {}", e);
                Ok(false)
            }
            Err(_) => {
                debug!(%target, "TCP connection timeout");
                Ok(false)
            }
        }
    }
}

/// Protocol-dispatching liveness probe
pub struct LivenessProbe {
    icmp: IcmpChecker,
    http: HttpChecker,
    tcp: TcpChecker,
    tunnel: ProxyTunnel,
}

impl LivenessProbe {
    pub fn new() -> Result<Self> {
        Ok(Self {
            icmp: IcmpChecker::new(ICMP_WAIT, ICMP_HARD_LIMIT),
            http: HttpChecker::new(HTTP_TIMEOUT)?,
            tcp: TcpChecker::new(TCP_TIMEOUT),
            tunnel: ProxyTunnel::new(),
        })
    }

    /// Alive/dead for one asset; never fails
    pub async fn check_asset(&self, asset: &Asset, proxy: Option<&ProxyConfig>) -> bool {
        match self.probe(asset, proxy).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(asset_id = asset.id, protocol = %asset.protocol, "Probe fault, counting as dead: {:#}", e);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Prober for LivenessProbe {
    async fn probe(&self, asset: &Asset, proxy: Option<&ProxyConfig>) -> Result<bool> {
        let proxy = proxy.filter(|p| p.is_mandated());

        match (&asset.protocol, proxy) {
            // Echo requests cannot travel through an HTTP proxy
            (Protocol::Icmp, Some(_)) => Ok(false),
            (Protocol::Icmp, None) => self.icmp.check(asset.ip).await,
            (Protocol::Http | Protocol::Https, proxy) => self.http.check(asset, proxy).await,
            (Protocol::Tcp(_), Some(proxy)) => {
                Ok(self.tunnel.check_through_proxy(&proxy.url, asset.socket_addr()).await?)
            }
            (Protocol::Tcp(_), None) => self.tcp.check(asset.socket_addr()).await,
        }
    }
}
