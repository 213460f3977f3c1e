//! Host address representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Default host HTTP port for GameStream servers.
pub const DEFAULT_HTTP_PORT: u16 = 47989;

/// Default host HTTPS port. The real HTTPS port is advertised by the host in
/// serverinfo; this is only the common value.
pub const DEFAULT_HTTPS_PORT: u16 = 47984;

/// An address:port pair for reaching a host. The address may be a hostname,
/// an IPv4 literal, or an IPv6 literal (stored without brackets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddress {
    pub address: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Format for embedding in a URL, bracketing IPv6 literals.
    pub fn to_url_host(&self) -> String {
        if self.address.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Parsed IP address, if the address is a literal rather than a hostname.
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// True if the address is an RFC 1918 IPv4 literal.
    pub fn is_site_local_v4(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(v4)) => {
                let o = v4.octets();
                o[0] == 10
                    || (o[0] == 172 && (16..=31).contains(&o[1]))
                    || (o[0] == 192 && o[1] == 168)
            }
            _ => false,
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url_host())
    }
}
