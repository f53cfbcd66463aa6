//! Webhook notification of the newest aggregate records.

use chrono::{DateTime, Utc};
use regwatch_core::Record;
use regwatch_storage::{WebhookClient, WebhookConfig};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct AlertPayload<'a> {
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    pub newest: &'a [Record],
}

#[derive(Debug)]
pub struct AlertSink {
    client: WebhookClient,
    batch: usize,
}

impl AlertSink {
    pub fn new(url: &str, batch: usize) -> anyhow::Result<Self> {
        let mut config = WebhookConfig::new(url);
        config.user_agent = Some(format!("regwatch/{}", env!("CARGO_PKG_VERSION")));
        Ok(Self {
            client: WebhookClient::new(config)?,
            batch,
        })
    }

    pub fn from_client(client: WebhookClient, batch: usize) -> Self {
        Self { client, batch }
    }

    /// Posts the first `batch` records (aggregate order is newest first).
    ///
    /// Delivery problems are logged and swallowed; returns whether the post landed.
    pub async fn notify(&self, records: &[Record], now: DateTime<Utc>) -> bool {
        if records.is_empty() || self.batch == 0 {
            return false;
        }
        let newest = &records[..records.len().min(self.batch)];
        let payload = AlertPayload {
            generated_at: now,
            total_records: records.len(),
            newest,
        };
        match self.client.post_json(&payload).await {
            Ok(attempts) => {
                info!(url = self.client.url(), sent = newest.len(), attempts, "alert delivered");
                true
            }
            Err(err) => {
                warn!(url = self.client.url(), error = %err, "alert delivery failed");
                false
            }
        }
    }
}
