//! Agent output lifecycle and background error reporting.
//!
//! An *output* is the channel through which the agent makes execution data
//! available.  The runtime drives every output the same way:
//!
//! ```text
//! startup()  ──►  write_execution_data(reset)*  ──►  shutdown()
//! ```
//!
//! Work that happens on background tasks (accepting connections, serving
//! collector commands) cannot return errors to the caller, so it reports them
//! through an [`ExceptionLogger`] instead.

use async_trait::async_trait;
use tracing::error;

/// Lifecycle contract for an execution data output.
///
/// All methods take `&self` so one output can be shared between the task that
/// waits for the shutdown signal and the tasks that trigger dumps.
#[async_trait]
pub trait AgentOutput: Send + Sync {
    /// Error returned by the lifecycle operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Acquires the output's resources and starts any background work.
    async fn startup(&self) -> Result<(), Self::Error>;

    /// Releases every resource acquired by [`startup`](Self::startup) and
    /// waits for background work to finish.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Emits the current execution data, clearing it afterwards when `reset`
    /// is `true`.
    async fn write_execution_data(&self, reset: bool) -> Result<(), Self::Error>;
}

/// Sink for errors raised on background tasks.
pub trait ExceptionLogger: Send + Sync {
    fn log_exception(&self, error: &(dyn std::error::Error + 'static));
}

/// [`ExceptionLogger`] that writes the error and its source chain to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionLogger;

impl ExceptionLogger for TracingExceptionLogger {
    fn log_exception(&self, error: &(dyn std::error::Error + 'static)) {
        error!("{}", render_chain(error));
    }
}

/// Formats `error` followed by each of its sources, separated by `: `.
pub fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("accept failed")]
    struct Outer(#[source] io::Error);

    #[test]
    fn test_render_chain_includes_every_source() {
        let error = Outer(io::Error::new(io::ErrorKind::Other, "too many open files"));
        assert_eq!(render_chain(&error), "accept failed: too many open files");
    }

    #[test]
    fn test_render_chain_of_leaf_error_is_its_message() {
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(render_chain(&error), "reset by peer");
    }

    #[test]
    fn test_tracing_logger_accepts_any_error() {
        // No subscriber is installed; this only checks the call is infallible.
        TracingExceptionLogger.log_exception(&io::Error::new(io::ErrorKind::Other, "boom"));
    }
}
