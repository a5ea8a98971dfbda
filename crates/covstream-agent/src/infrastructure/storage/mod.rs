//! Storage infrastructure: the agent configuration file.
//!
//! The `config` sub-module reads the TOML file (from an explicit path or the
//! platform config directory), falls back to defaults when it does not exist,
//! and can write a fresh default file for the `init-config` subcommand.

pub mod config;
