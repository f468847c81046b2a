//! HTTP signalling between the old process and its standby successor.

use crate::HandoffError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Path of the readiness endpoint.
pub const READY_PATH: &str = "/ready";
/// Path of the handoff endpoint.
pub const REPLACE_PATH: &str = "/replace";

/// Build an `http://` URL for `path` on a listening address.
///
/// Unspecified addresses (`0.0.0.0`, `::`) are replaced by the loopback
/// address of the same family, since they cannot be dialled.
///
/// # Example
///
/// ```rust
/// use binswap::handoff_url;
///
/// let url = handoff_url("0.0.0.0:8081".parse().unwrap(), "/replace");
/// assert_eq!(url, "http://127.0.0.1:8081/replace");
/// ```
pub fn handoff_url(addr: SocketAddr, path: &str) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}{}", SocketAddr::new(ip, addr.port()), path)
}

/// Client side of the handoff protocol.
#[async_trait]
pub trait HandoffClient: Send + Sync + 'static {
    /// Whether the standby process at `addr` answers its readiness endpoint.
    async fn is_ready(&self, addr: SocketAddr) -> bool;

    /// Ask the standby process at `addr` to take over the production address.
    async fn replace(&self, addr: SocketAddr) -> Result<(), HandoffError>;
}

/// Handoff client using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpHandoffClient {
    client: reqwest::Client,
    replace_timeout: Duration,
}

impl HttpHandoffClient {
    /// Create a client whose `/replace` call gives up after `replace_timeout`.
    pub fn new(replace_timeout: Duration) -> Result<Self, reqwest::Error> {
        // The standby process is always local; never route through a proxy.
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            replace_timeout,
        })
    }
}

#[async_trait]
impl HandoffClient for HttpHandoffClient {
    async fn is_ready(&self, addr: SocketAddr) -> bool {
        let url = handoff_url(addr, READY_PATH);
        match self.client.get(&url).timeout(Duration::from_secs(1)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "standby not ready");
                false
            }
        }
    }

    async fn replace(&self, addr: SocketAddr) -> Result<(), HandoffError> {
        let url = handoff_url(addr, REPLACE_PATH);
        let resp = self
            .client
            .get(&url)
            .timeout(self.replace_timeout)
            .send()
            .await
            .map_err(|e| HandoffError::Replace {
                addr,
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(HandoffError::Replace {
                addr,
                message: format!("{status}: {}", body.trim()),
            })
        }
    }
}
