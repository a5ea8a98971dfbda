//! Infrastructure layer: sockets, HTTP, and configuration files.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `covstream_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod registry;
pub mod storage;
