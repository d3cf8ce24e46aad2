use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::WebhookSection;

use super::dataset::DatasetEntry;
use super::error::{DeliveryError, DeliveryResult};

/// Secondary destination for entries that were already persisted.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, entry: &DatasetEntry) -> DeliveryResult<()>;
}

/// POSTs each entry as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: Client,
    url: String,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> DeliveryResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when forwarding is disabled or has no target.
    pub fn from_config(config: &WebhookSection) -> DeliveryResult<Option<Self>> {
        match (&config.url, config.enabled) {
            (Some(url), true) => Ok(Some(Self::new(
                url.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Forwarder for WebhookForwarder {
    async fn forward(&self, entry: &DatasetEntry) -> DeliveryResult<()> {
        let response = self.client.post(&self.url).json(entry).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(url = %self.url, status = status.as_u16(), "entry forwarded");
        Ok(())
    }
}
