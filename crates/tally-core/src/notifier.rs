//! Best-effort callback notifications.
//!
//! Every endpoint registered during a window receives one
//! `POST <endpoint>?count=<count>` with an empty body once the window is
//! flushed. Calls are made one after another; each one is independent, so a
//! failing endpoint never stops the rest from being tried. Nothing is
//! retried.

use std::time::Duration;

use crate::{Error, Result};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single endpoint notification.
#[derive(Debug)]
pub struct Delivery {
    /// Endpoint that was notified.
    pub url: String,
    /// Response status, or the failure that prevented one.
    pub result: Result<u16>,
}

impl Delivery {
    /// True when the endpoint answered with a 2xx status.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sends count notifications to callback endpoints.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    /// Create a notifier whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    /// Notify each endpoint of `count`, logging every outcome.
    pub async fn notify(&self, endpoints: &[String], count: u64) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(endpoints.len());

        for url in endpoints {
            let result = self.post(url, count).await;
            match &result {
                Ok(status) => {
                    tracing::info!(url = %url, status, "POST[{}] returned {}", url, status);
                    metrics::counter!("notify_requests_total", "outcome" => "success").increment(1);
                }
                Err(e) => {
                    tracing::error!(url = %url, error = %e, "Failed to POST to {}", url);
                    metrics::counter!("notify_requests_total", "outcome" => "failure").increment(1);
                }
            }
            deliveries.push(Delivery {
                url: url.clone(),
                result,
            });
        }

        deliveries
    }

    async fn post(&self, url: &str, count: u64) -> Result<u16> {
        let failure = |reason: String| Error::NotifyFailure {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .post(url)
            .query(&[("count", count)])
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("status {}", status.as_u16())));
        }
        Ok(status.as_u16())
    }
}
