//! Registry notification over HTTP.
//!
//! Messages are POSTed as JSON to the configured registry URL on a spawned
//! task.  The caller never waits for the request and never sees its outcome;
//! success is logged at `info`, any failure at `warn`.

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::application::registration::{RegistrationMessage, RegistrationNotifier};

/// Connect timeout used unless configured otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// [`RegistrationNotifier`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("covstream-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl RegistrationNotifier for HttpNotifier {
    fn notify(&self, url: &str, message: &RegistrationMessage) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(%url, port = message.port, "no async runtime; registry notification dropped");
            return;
        };
        let request = self.client.post(url).json(message);
        let url = url.to_string();
        let port = message.port;

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    info!(%url, port, %status, "registry notified: {body}");
                }
                Ok(response) => {
                    warn!(%url, port, status = %response.status(), "registry rejected port update")
                }
                Err(e) => warn!(%url, port, "registry notification failed: {e}"),
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
