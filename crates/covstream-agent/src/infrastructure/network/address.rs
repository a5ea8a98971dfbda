//! Bind address resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::lookup_host;
use tracing::debug;

/// Address value meaning "all local interfaces".
pub const WILDCARD_ADDRESS: &str = "*";

/// Where the listening socket binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAddress {
    /// Every local IPv4 interface (`0.0.0.0`).
    Any,
    /// One specific local address.
    Host(IpAddr),
}

impl BindAddress {
    pub fn ip(&self) -> IpAddr {
        match self {
            BindAddress::Any => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            BindAddress::Host(ip) => *ip,
        }
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip(), port)
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("bind address is empty")]
    Empty,
    #[error("cannot resolve bind address {address:?}: {source}")]
    Lookup {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("bind address {0:?} did not resolve to any address")]
    NoAddresses(String),
}

/// Resolves a configured bind address.
///
/// `*` means every interface; IP literals (IPv6 optionally in brackets) are
/// used as is; anything else is looked up as a host name and the first
/// result wins.
pub async fn resolve_bind_address(address: &str) -> Result<BindAddress, AddressError> {
    let address = address.trim();
    if address == WILDCARD_ADDRESS {
        return Ok(BindAddress::Any);
    }
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if let Some(ip) = parse_ip_literal(address) {
        return Ok(BindAddress::Host(ip));
    }

    let mut resolved = lookup_host((address, 0))
        .await
        .map_err(|source| AddressError::Lookup {
            address: address.to_string(),
            source,
        })?;
    let first = resolved
        .next()
        .ok_or_else(|| AddressError::NoAddresses(address.to_string()))?;
    debug!(%address, ip = %first.ip(), "resolved bind address");
    Ok(BindAddress::Host(first.ip()))
}

fn parse_ip_literal(address: &str) -> Option<IpAddr> {
    let unbracketed = address
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(address);
    unbracketed.parse().ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
