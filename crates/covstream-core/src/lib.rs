//! # covstream-core
//!
//! Shared library for covstream containing the execution-data wire protocol
//! and the domain types that describe collected coverage.
//!
//! This crate is used by both the agent-side server and the collector client.
//! It has zero dependencies on network sockets or async runtimes: everything
//! here works on plain byte slices and in-memory data.
//!
//! # Architecture overview
//!
//! covstream streams execution data (which code probes were hit) from a
//! running process to an external collector over TCP.  This crate defines:
//!
//! - **`protocol`** – How execution data travels over the wire.  The stream
//!   is a sequence of self-describing *blocks*, each starting with a one-byte
//!   block type (header, session info, execution data, commands).
//!
//! - **`domain`** – The data model: a [`SessionInfo`] describing one
//!   collection period, the per-class [`ExecutionRecord`]s, the
//!   [`ExecutionDataSource`] seam the server pulls snapshots from, and the
//!   in-memory [`ExecutionStore`] reference implementation.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `covstream_core::ExecutionStore` instead of the full module path.
pub use domain::execution::{
    ExecutionDataSource, ExecutionRecord, ExecutionStore, SessionInfo,
};
pub use protocol::blocks::Block;
pub use protocol::codec::{decode_block, encode_block, ProtocolError};
pub use protocol::reader::BlockReader;
