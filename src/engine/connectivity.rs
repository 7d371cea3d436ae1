//! Network availability checks made before starting a refresh.

#![allow(missing_docs)]

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::core::errors::{Result, TwsError};

pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Treats the network as always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Online when a TCP handshake with the stream host succeeds in time.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    authority: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(authority: impl Into<String>, timeout: Duration) -> Self {
        Self {
            authority: authority.into(),
            timeout,
        }
    }

    /// Probe the host and port that `url` would connect to.
    pub fn for_url(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url).map_err(|e| TwsError::InvalidEndpoint {
            url: url.to_string(),
            details: e.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| TwsError::InvalidEndpoint {
            url: url.to_string(),
            details: "missing host".to_string(),
        })?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| TwsError::InvalidEndpoint {
                url: url.to_string(),
                details: "unknown port".to_string(),
            })?;
        Ok(Self::new(format!("{host}:{port}"), timeout))
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn resolve(&self) -> Option<SocketAddr> {
        self.authority.to_socket_addrs().ok()?.next()
    }
}

impl Connectivity for TcpProbe {
    fn is_online(&self) -> bool {
        self.resolve()
            .is_some_and(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}
