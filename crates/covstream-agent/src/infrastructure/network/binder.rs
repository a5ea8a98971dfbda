//! Listening socket setup with a single port fallback.
//!
//! The agent listens on a configured port (6300 by default).  When several
//! agents start on one machine the port is often already taken, so instead
//! of failing outright the binder tries the next port exactly once:
//!
//! ```text
//! bind(P) ── ok ──────────────────────────────────────────► listening on P
//!    │
//!    └─ address in use ─► notify registry(P+1) ─► bind(P+1) ─► listening on P+1
//!                                                    │
//!                                                    └─ error ─► BindError
//! ```
//!
//! Any other bind failure (permission denied, address not available) is
//! returned immediately.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, warn};

use crate::application::registration::{RegistrationMessage, RegistrationNotifier};
use crate::infrastructure::network::address::BindAddress;

/// Pending-connection backlog.  Only one collector is served at a time.
pub const LISTEN_BACKLOG: u32 = 1;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("port {0} is in use and there is no higher port to fall back to")]
    NoFallbackPort(u16),
}

impl BindError {
    /// Returns `true` if the failure was caused by the port being taken.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, BindError::Io { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// A listening socket and the port it actually got.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub local_addr: SocketAddr,
    /// `true` when the configured port was taken and the next one was used.
    pub fell_back: bool,
}

impl BoundListener {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// Binds listening sockets and announces port fallbacks.
pub struct PortBinder {
    notifier: Arc<dyn RegistrationNotifier>,
    registry_url: Option<String>,
}

impl PortBinder {
    pub fn new(notifier: Arc<dyn RegistrationNotifier>, registry_url: Option<String>) -> Self {
        Self {
            notifier,
            registry_url,
        }
    }

    /// Binds `address:port`, or `address:port+1` if `port` is in use.
    ///
    /// Port `0` lets the operating system choose; the chosen port is reported
    /// in [`BoundListener::local_addr`].  Must be called from within a Tokio
    /// runtime.
    pub fn bind(&self, address: BindAddress, port: u16) -> Result<BoundListener, BindError> {
        let first = match open_listener(address.socket_addr(port)) {
            Ok((listener, local_addr)) => {
                return Ok(BoundListener {
                    listener,
                    local_addr,
                    fell_back: false,
                })
            }
            Err(e) => e,
        };
        if !first.is_address_in_use() {
            return Err(first);
        }

        let next = fallback_port(port)?;
        warn!(
            ip = %address.ip(),
            port,
            fallback = next,
            "port in use; falling back to the next port"
        );
        self.announce_port(next);

        let (listener, local_addr) = open_listener(address.socket_addr(next))?;
        Ok(BoundListener {
            listener,
            local_addr,
            fell_back: true,
        })
    }

    fn announce_port(&self, port: u16) {
        match self.registry_url.as_deref() {
            Some(url) => self
                .notifier
                .notify(url, &RegistrationMessage::update_port(port)),
            None => debug!(port, "no registry configured; port change not announced"),
        }
    }
}

/// The one port tried after `port` turned out to be in use.
pub fn fallback_port(port: u16) -> Result<u16, BindError> {
    port.checked_add(1).ok_or(BindError::NoFallbackPort(port))
}

fn open_listener(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), BindError> {
    let to_error = |source: io::Error| BindError::Io { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(to_error)?;
    // On Windows SO_REUSEADDR lets a second socket take over a bound port,
    // which would hide exactly the conflict we fall back on.
    #[cfg(not(windows))]
    socket.set_reuseaddr(true).map_err(to_error)?;
    socket.bind(addr).map_err(to_error)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(to_error)?;
    let local_addr = listener.local_addr().map_err(to_error)?;
    Ok((listener, local_addr))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
