//! Port-change announcements for an external registry.
//!
//! When the configured port is taken and the server binds the next one
//! instead, anything that discovered the agent by its configured port would
//! look in the wrong place.  If a registry URL is configured, the server
//! announces the new port with a small JSON message:
//!
//! ```json
//! {"action":"updatePort","port":6301}
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a [`RegistrationMessage`] asks the registry to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationAction {
    /// The agent now listens on [`RegistrationMessage::port`].
    UpdatePort,
}

/// Body of a registry notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    pub action: RegistrationAction,
    pub port: u16,
}

impl RegistrationMessage {
    pub fn update_port(port: u16) -> Self {
        Self {
            action: RegistrationAction::UpdatePort,
            port,
        }
    }
}

/// Delivers [`RegistrationMessage`]s.
///
/// Delivery is fire-and-forget: `notify` must return promptly and must never
/// fail the caller.  Implementations report delivery problems themselves.
pub trait RegistrationNotifier: Send + Sync {
    fn notify(&self, url: &str, message: &RegistrationMessage);
}

/// Notifier that only logs; used when no registry is reachable or wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl RegistrationNotifier for LoggingNotifier {
    fn notify(&self, url: &str, message: &RegistrationMessage) {
        debug!(%url, port = message.port, "registry notification skipped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
