//! Domain entities for covstream.
//!
//! This module contains the execution-data model with no I/O dependencies.
//! Code in the agent's infrastructure layer (sockets, config files, HTTP)
//! depends on these types, but nothing here depends on it, which keeps the
//! model testable on any platform without setup.

/// Execution data: session info, per-class probe records and the store.
///
/// See [`execution::ExecutionStore`] for the main type.
pub mod execution;
