//! Application layer: the seams the agent runtime talks through.
//!
//! Nothing in here opens sockets or touches the file system.  The traits are
//! implemented by adapters in [`crate::infrastructure`], which keeps the
//! lifecycle driver (the binary, or an embedding host) independent of how
//! execution data actually leaves the process.
//!
//! # Sub-modules
//!
//! - **`output`** – The [`AgentOutput`](output::AgentOutput) lifecycle trait
//!   and the [`ExceptionLogger`](output::ExceptionLogger) sink for errors that
//!   happen on background tasks.
//!
//! - **`registration`** – The message sent to an external registry when the
//!   listening port changes, and the notifier trait that delivers it.

pub mod output;
pub mod registration;
