//! Out-of-band exception sink.
//!
//! When a run dies on an uncaught error, a short summary plus the error
//! chain can be fired at a remote janitor endpoint so broken deployments
//! surface without log access. Notification failures are logged and never
//! propagated: the janitor must not be able to break the bot further.

use std::time::Duration;

use tracing::{debug, warn};

pub struct Janitor {
    http: reqwest::Client,
    remote_url: String,
}

impl Janitor {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            remote_url: remote_url.into(),
        }
    }

    pub async fn error(&self, summary: &str, message: &str) {
        let endpoint = format!("{}/message", self.remote_url.trim_end_matches('/'));
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());

        let result = self
            .http
            .post(&endpoint)
            .form(&[
                ("hostname", hostname.as_str()),
                ("summary", summary),
                ("message", message),
            ])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(endpoint, "janitor notified");
            }
            Ok(response) => {
                warn!(endpoint, status = %response.status(), "janitor rejected the report");
            }
            Err(e) => {
                warn!(endpoint, error = %e, "could not reach the janitor");
            }
        }
    }
}
