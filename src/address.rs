//! Node identity.

use std::{fmt, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::MembershipError;

/// A `(host, port)` pair uniquely identifying a node.
///
/// Addresses are immutable once created. Ordering is lexical on the host and then numeric on the port,
/// which gives directories a stable key order for reproducible sampling.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Creates a new address from a host name or IP literal and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a copy of this address with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Address::new(self.host.clone(), port)
    }

    /// Returns `true` if another node could connect to this address: a non-empty host and a non-zero port.
    pub fn is_dialable(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MembershipError::InvalidAddress(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(MembershipError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| MembershipError::InvalidAddress(s.to_string()))?;

        Ok(Address::new(host, port))
    }
}
