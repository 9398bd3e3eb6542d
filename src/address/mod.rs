//! Remote address records and their conversion to native socket addresses
//!
//! A remote endpoint is described either by an already-resolved record
//! (IPv4 bits or two IPv6 halves, plus a port) or by a host name that the
//! transport resolves when it opens a channel.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: {0}")]
    Invalid(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Host part of a resolved address record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvedHost {
    /// IPv4 address as a big-endian 32-bit value
    V4 { bits: u32 },
    /// IPv6 address split into its high and low 64 bits
    V6 { high: u64, low: u64 },
}

/// An already-resolved remote address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedAddress {
    pub host: ResolvedHost,
    pub port: u16,
}

impl ResolvedAddress {
    /// IPv4 record from its dotted octets
    pub fn v4(octets: [u8; 4], port: u16) -> Self {
        Self {
            host: ResolvedHost::V4 {
                bits: u32::from_be_bytes(octets),
            },
            port,
        }
    }

    /// IPv6 record from its two 64-bit halves
    pub fn v6(high: u64, low: u64, port: u16) -> Self {
        Self {
            host: ResolvedHost::V6 { high, low },
            port,
        }
    }

    /// Convert into a socket address that can be dialed
    pub fn to_native_address(&self) -> SocketAddr {
        let ip = match self.host {
            ResolvedHost::V4 { bits } => IpAddr::V4(Ipv4Addr::from(bits)),
            ResolvedHost::V6 { high, low } => {
                IpAddr::V6(Ipv6Addr::from(((high as u128) << 64) | low as u128))
            }
        };
        SocketAddr::new(ip, self.port)
    }
}

impl From<ResolvedAddress> for SocketAddr {
    fn from(addr: ResolvedAddress) -> Self {
        addr.to_native_address()
    }
}

impl From<SocketAddr> for ResolvedAddress {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => ResolvedHost::V4 { bits: u32::from(ip) },
            IpAddr::V6(ip) => {
                let bits = u128::from(ip);
                ResolvedHost::V6 {
                    high: (bits >> 64) as u64,
                    low: bits as u64,
                }
            }
        };
        Self {
            host,
            port: addr.port(),
        }
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_native_address())
    }
}

/// Remote endpoint a tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    /// Literal IP address and port
    Resolved(ResolvedAddress),
    /// Host name and port, resolved by the transport
    Named { host: String, port: u16 },
}

impl RemoteAddress {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            RemoteAddress::Resolved(addr) => addr.port,
            RemoteAddress::Named { port, .. } => *port,
        }
    }

    /// Get the resolved record, if no lookup is needed
    pub fn resolved(&self) -> Option<ResolvedAddress> {
        match self {
            RemoteAddress::Resolved(addr) => Some(*addr),
            RemoteAddress::Named { .. } => None,
        }
    }
}

impl From<ResolvedAddress> for RemoteAddress {
    fn from(addr: ResolvedAddress) -> Self {
        RemoteAddress::Resolved(addr)
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddress::Resolved(addr.into())
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddress::Resolved(addr) => write!(f, "{}", addr),
            RemoteAddress::Named { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for RemoteAddress {
    type Err = AddressError;

    /// Accepts `1.2.3.4:22`, `[::1]:22` and `host.name:22`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Invalid(format!("missing port in '{}'", s)))?;
        let port = parse_port(port)?;

        if host.is_empty() {
            return Err(AddressError::Invalid(format!("missing host in '{}'", s)));
        }
        if host.starts_with('[') || host.contains(':') {
            // Bracketed or bare IPv6 that failed SocketAddr parsing
            return Err(AddressError::Invalid(format!("malformed IPv6 address '{}'", s)));
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(AddressError::Invalid(format!("invalid host name '{}'", host)));
        }

        Ok(RemoteAddress::Named {
            host: host.to_string(),
            port,
        })
    }
}

pub(crate) fn parse_port(s: &str) -> Result<u16, AddressError> {
    s.parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(s.to_string()))
}
