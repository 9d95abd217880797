//! Stream addresses.

use std::net::SocketAddr;
use tokio::net::TcpStream;
use url::{Host, Url};

use super::{RtspError, DEFAULT_PORT};

/// A parsed `rtsp://` address with credentials split off.
#[derive(Debug, Clone, PartialEq)]
pub struct RtspUrl {
    /// The URL handed to the source (no user info).
    pub url: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl RtspUrl {
    pub fn parse(address: &str) -> Result<Self, RtspError> {
        let mut url = Url::parse(address.trim())
            .map_err(|e| RtspError::Url(format!("{}: {}", address, e)))?;

        if url.scheme() != "rtsp" {
            return Err(RtspError::Url(format!(
                "{}: unsupported scheme {}",
                address,
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(RtspError::Url(format!("{}: missing host", address))),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            url: url.to_string(),
            host,
            port,
            credentials,
        })
    }

    async fn resolve(&self) -> Result<SocketAddr, RtspError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| RtspError::Resolve {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        addrs.next().ok_or_else(|| RtspError::Resolve {
            host: self.host.clone(),
            reason: "no addresses found".to_string(),
        })
    }

    /// Resolve the host and open one TCP connection to the RTSP port.
    ///
    /// `rtspsrc` reports every connect failure as the same generic error, so
    /// this runs first to tell a refused port from a bad host or a timeout.
    pub async fn check_reachable(&self) -> Result<(), RtspError> {
        let addr = self.resolve().await?;
        TcpStream::connect(addr).await?;
        Ok(())
    }
}
