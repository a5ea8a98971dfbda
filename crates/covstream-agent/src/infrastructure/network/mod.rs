//! Network infrastructure for the agent.
//!
//! # Sub-modules
//!
//! - **`address`** – Turns the configured bind address (`*`, an IP literal,
//!   or a host name) into something a socket can bind to.
//!
//! - **`binder`** – Binds the listening socket, falling back to the next port
//!   once if the configured one is taken, and announces the fallback.
//!
//! - **`session`** – One connected collector: handshake, command handling,
//!   and snapshot writes.  Closing a session unblocks everything waiting on it.
//!
//! - **`server`** – [`TcpServerOutput`](server::TcpServerOutput), the
//!   `AgentOutput` that owns the listener, the accept loop, and the active
//!   session.
//!
//! - **`collector`** – The other end of the wire: connects to an agent and
//!   requests dumps.  Used by the `dump` subcommand and by tests.

pub mod address;
pub mod binder;
pub mod collector;
pub mod server;
pub mod session;
