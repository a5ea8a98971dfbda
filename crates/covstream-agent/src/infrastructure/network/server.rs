//! TcpServerOutput: serves execution data to one collector at a time.
//!
//! # Architecture
//!
//! ```text
//!   startup()                 accept loop task                 caller
//!   ─────────                 ────────────────                 ──────
//!   resolve + bind ──spawn──► accept ─► Session::new ─┐
//!                               ▲       (active = s)  │
//!                               │       open + serve ◄┘    write_execution_data()
//!                               │            │                 │ clone active
//!                               └── close ◄──┘                 └► s.write_snapshot()
//!
//!   shutdown(): listener_closed = true, stop signal, close active,
//!               await the accept loop task
//! ```
//!
//! The endpoint state (`listener_closed`, the accept loop phase, and the
//! active session) lives behind one `std::sync::Mutex` that is never held
//! across an `.await`.  Installing a new session and shutting down both
//! happen under that lock, so a session accepted during shutdown is either
//! closed by `shutdown` or dropped by the loop; it can never outlive it.
//!
//! Errors on the accept loop are reported through the [`ExceptionLogger`]
//! unless the listener is being closed, in which case they are the expected
//! result of shutting down and are dropped silently.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use covstream_core::ExecutionDataSource;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::application::output::{AgentOutput, ExceptionLogger};
use crate::application::registration::{LoggingNotifier, RegistrationNotifier};
use crate::infrastructure::network::address::{resolve_bind_address, AddressError};
use crate::infrastructure::network::binder::{BindError, PortBinder};
use crate::infrastructure::network::session::{Session, SessionError};

/// Default collector port.
pub const DEFAULT_PORT: u16 = 6300;
/// Default bind address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("output is already started")]
    AlreadyStarted,
    #[error("output was never started")]
    NotStarted,
    #[error("accept loop terminated abnormally: {0}")]
    AcceptLoop(String),
}

/// Where and how the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// `*`, an IP literal, or a host name.
    pub address: String,
    /// Port to try first; `0` lets the operating system choose.
    pub port: u16,
    /// Registry told about the new port when the server falls back.
    pub registry_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            registry_url: None,
        }
    }
}

/// Phase of the accept loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptLoopState {
    /// Not started yet.
    Idle,
    Running,
    /// The loop has seen the listener close and is releasing it.
    Stopping,
    /// The loop has exited and the listening socket is closed.
    Stopped,
}

#[derive(Debug)]
struct EndpointState {
    listener_closed: bool,
    loop_state: AcceptLoopState,
    local_addr: Option<SocketAddr>,
    active: Option<Arc<Session>>,
}

type SharedEndpoint = Arc<Mutex<EndpointState>>;

fn lock_endpoint(endpoint: &SharedEndpoint) -> MutexGuard<'_, EndpointState> {
    // The state stays consistent across panics: every update is a plain store.
    endpoint.lock().unwrap_or_else(|e| e.into_inner())
}

enum Lifecycle {
    Idle,
    Running {
        stop_tx: watch::Sender<bool>,
        worker: JoinHandle<()>,
    },
    Stopped,
}

/// [`AgentOutput`] that listens for a collector on a TCP port.
///
/// At most one collector is served at a time; a new connection is accepted
/// once the current one ends.  [`write_execution_data`] pushes a snapshot to
/// the connected collector, if there is one.
///
/// [`write_execution_data`]: AgentOutput::write_execution_data
pub struct TcpServerOutput {
    settings: ServerSettings,
    data: Arc<dyn ExecutionDataSource>,
    logger: Arc<dyn ExceptionLogger>,
    notifier: Arc<dyn RegistrationNotifier>,
    endpoint: SharedEndpoint,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl TcpServerOutput {
    pub fn new(
        settings: ServerSettings,
        data: Arc<dyn ExecutionDataSource>,
        logger: Arc<dyn ExceptionLogger>,
    ) -> Self {
        Self {
            settings,
            data,
            logger,
            notifier: Arc::new(LoggingNotifier),
            endpoint: Arc::new(Mutex::new(EndpointState {
                listener_closed: false,
                loop_state: AcceptLoopState::Idle,
                local_addr: None,
                active: None,
            })),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
        }
    }

    /// Replaces the notifier used to announce a port fallback.
    pub fn with_notifier(mut self, notifier: Arc<dyn RegistrationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock_endpoint(&self.endpoint).local_addr
    }

    pub fn accept_loop_state(&self) -> AcceptLoopState {
        lock_endpoint(&self.endpoint).loop_state
    }

    /// Peer address of the active session, if it is still open.
    pub fn active_peer(&self) -> Option<SocketAddr> {
        lock_endpoint(&self.endpoint)
            .active
            .as_ref()
            .filter(|s| !s.is_closed())
            .map(|s| s.peer())
    }
}

#[async_trait]
impl AgentOutput for TcpServerOutput {
    type Error = OutputError;

    /// Resolves the address, binds the port (with fallback), and starts the
    /// accept loop.
    async fn startup(&self) -> Result<(), OutputError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(OutputError::AlreadyStarted);
        }

        let address = resolve_bind_address(&self.settings.address).await?;
        let binder = PortBinder::new(self.notifier.clone(), self.settings.registry_url.clone());
        let bound = binder.bind(address, self.settings.port)?;
        let local_addr = bound.local_addr;

        {
            let mut endpoint = lock_endpoint(&self.endpoint);
            endpoint.local_addr = Some(local_addr);
            endpoint.loop_state = AcceptLoopState::Running;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_loop = AcceptLoop {
            listener: bound.listener,
            endpoint: self.endpoint.clone(),
            data: self.data.clone(),
            logger: self.logger.clone(),
            stop_rx,
        };
        let worker = tokio::spawn(
            accept_loop
                .run()
                .instrument(info_span!("accept_loop", port = local_addr.port())),
        );
        *lifecycle = Lifecycle::Running { stop_tx, worker };

        info!(%local_addr, fell_back = bound.fell_back, "execution data server listening");
        Ok(())
    }

    /// Closes the listener and the active session, then waits for the accept
    /// loop to exit.  Calling it again after a successful shutdown is a no-op.
    async fn shutdown(&self) -> Result<(), OutputError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (stop_tx, worker) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { stop_tx, worker } => (stop_tx, worker),
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                return Err(OutputError::NotStarted);
            }
            Lifecycle::Stopped => {
                debug!("execution data server already shut down");
                return Ok(());
            }
        };

        {
            let mut endpoint = lock_endpoint(&self.endpoint);
            endpoint.listener_closed = true;
            // The receiver only disappears when the loop has already exited.
            let _ = stop_tx.send(true);
            if let Some(session) = endpoint.active.as_ref() {
                session.close();
            }
        }

        worker
            .await
            .map_err(|e| OutputError::AcceptLoop(e.to_string()))?;
        info!("execution data server shut down");
        Ok(())
    }

    /// Writes a snapshot to the active collector.  Without a collector this
    /// does nothing and succeeds.
    async fn write_execution_data(&self, reset: bool) -> Result<(), OutputError> {
        // Clone the reference and release the lock before writing; a session
        // swapped in meanwhile simply misses this snapshot.
        let session = lock_endpoint(&self.endpoint).active.clone();
        match session {
            Some(session) => Ok(session.write_snapshot(reset).await?),
            None => {
                trace!("no collector connected; snapshot skipped");
                Ok(())
            }
        }
    }
}

/// State moved into the accept loop task.
struct AcceptLoop {
    listener: TcpListener,
    endpoint: SharedEndpoint,
    data: Arc<dyn ExecutionDataSource>,
    logger: Arc<dyn ExceptionLogger>,
    stop_rx: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            if self.listener_closed() {
                break;
            }
            let accepted = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.serve_connection(stream, peer).await,
                Err(e) => {
                    if self.listener_closed() {
                        break;
                    }
                    self.logger.log_exception(&e);
                }
            }
        }

        lock_endpoint(&self.endpoint).loop_state = AcceptLoopState::Stopping;
        let AcceptLoop {
            listener, endpoint, ..
        } = self;
        drop(listener);
        lock_endpoint(&endpoint).loop_state = AcceptLoopState::Stopped;
        debug!("accept loop stopped");
    }

    fn listener_closed(&self) -> bool {
        lock_endpoint(&self.endpoint).listener_closed
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let installed = {
            let mut endpoint = lock_endpoint(&self.endpoint);
            if endpoint.listener_closed {
                debug!(%peer, "connection dropped: server is shutting down");
                return;
            }
            Session::new(stream, peer, self.data.clone()).map(|session| {
                let session = Arc::new(session);
                endpoint.active = Some(session.clone());
                session
            })
        };
        let session = match installed {
            Ok(session) => session,
            Err(e) => {
                self.logger.log_exception(&e);
                return;
            }
        };
        info!(%peer, "collector connected");

        let result = match session.open().await {
            Ok(()) => session.serve().await,
            Err(e) => Err(e),
        };
        session.close();

        match result {
            Ok(()) => info!(%peer, "collector disconnected"),
            Err(e) if self.listener_closed() => {
                debug!(%peer, "session ended during shutdown: {e}")
            }
            Err(e) => self.logger.log_exception(&e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::output::TracingExceptionLogger;
    use covstream_core::ExecutionStore;

    fn output(address: &str) -> TcpServerOutput {
        TcpServerOutput::new(
            ServerSettings {
                address: address.to_string(),
                port: 0,
                registry_url: None,
            },
            Arc::new(ExecutionStore::new("unit")),
            Arc::new(TracingExceptionLogger),
        )
    }

    #[test]
    fn test_default_settings_listen_on_loopback_6300() {
        let settings = ServerSettings::default();
        assert_eq!(settings.address, "127.0.0.1");
        assert_eq!(settings.port, 6300);
        assert!(settings.registry_url.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_before_startup_is_rejected() {
        let output = output("127.0.0.1");
        assert!(matches!(
            output.shutdown().await,
            Err(OutputError::NotStarted)
        ));
        assert_eq!(output.accept_loop_state(), AcceptLoopState::Idle);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let output = output("127.0.0.1");

        output.startup().await.unwrap();
        assert_eq!(output.accept_loop_state(), AcceptLoopState::Running);
        assert!(output.local_addr().is_some());
        assert!(matches!(
            output.startup().await,
            Err(OutputError::AlreadyStarted)
        ));

        output.shutdown().await.unwrap();
        assert_eq!(output.accept_loop_state(), AcceptLoopState::Stopped);
        output.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_without_collector_is_a_no_op() {
        let output = output("127.0.0.1");
        output.startup().await.unwrap();

        assert!(output.write_execution_data(true).await.is_ok());
        assert!(output.active_peer().is_none());

        output.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_address_fails_startup_and_allows_retry() {
        let output = output("");
        assert!(matches!(
            output.startup().await,
            Err(OutputError::Address(AddressError::Empty))
        ));
        assert!(matches!(
            output.shutdown().await,
            Err(OutputError::NotStarted)
        ));
    }
}
