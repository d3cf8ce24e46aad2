mod dataset;
mod error;
mod webhook;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::extract::Record;

pub use dataset::{DatasetEntry, DatasetSink, JsonlDataset};
pub use error::{DeliveryError, DeliveryResult};
pub use webhook::{Forwarder, WebhookForwarder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Disabled,
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub entry: DatasetEntry,
    pub forwarded: ForwardStatus,
}

/// Persists every accepted record, then forwards it best-effort.
#[derive(Clone)]
pub struct DeliveryPipeline {
    sink: Arc<dyn DatasetSink>,
    forwarder: Option<Arc<dyn Forwarder>>,
    record_type: String,
    location: String,
}

impl DeliveryPipeline {
    pub fn new(
        sink: Arc<dyn DatasetSink>,
        record_type: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            forwarder: None,
            record_type: record_type.into(),
            location: location.into(),
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn forwards(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Persistence errors propagate; forwarding errors are logged and
    /// reported only through the receipt.
    pub async fn deliver(&self, record: Record) -> DeliveryResult<DeliveryReceipt> {
        if !record.has_identity() {
            return Err(DeliveryError::InvalidRecord {
                url: record.source_url,
            });
        }

        let entry = DatasetEntry {
            kind: self.record_type.clone(),
            location: self.location.clone(),
            scraped_at: Utc::now(),
            record,
        };
        self.sink.append(&entry)?;
        debug!(url = %entry.record.source_url, "entry persisted");

        let forwarded = match &self.forwarder {
            None => ForwardStatus::Disabled,
            Some(forwarder) => match forwarder.forward(&entry).await {
                Ok(()) => ForwardStatus::Sent,
                Err(err) => {
                    warn!(url = %entry.record.source_url, error = %err, "forwarding failed");
                    ForwardStatus::Failed
                }
            },
        };

        Ok(DeliveryReceipt { entry, forwarded })
    }
}
