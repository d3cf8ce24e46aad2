use serde::{Deserialize, Serialize};

use crate::delivery::ForwardStatus;
use crate::extract::{ExtractionOrigin, ExtractionOutcome};

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestMetrics {
    pub pages_visited: u64,
    pub links_found: u64,
    pub link_retries: u64,
    pub items_attempted: u64,
    pub records_delivered: u64,
    pub structured_records: u64,
    pub rendered_records: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
    pub forward_sent: u64,
    pub forward_failed: u64,
    pub filters_failed: u64,
}

impl HarvestMetrics {
    pub fn record_page(&mut self, links: usize, retried: bool) {
        self.pages_visited = self.pages_visited.saturating_add(1);
        self.links_found = self.links_found.saturating_add(links as u64);
        if retried {
            self.link_retries = self.link_retries.saturating_add(1);
        }
    }

    pub fn record_outcome(&mut self, outcome: &ExtractionOutcome) {
        self.items_attempted = self.items_attempted.saturating_add(1);
        match outcome {
            ExtractionOutcome::Success(record) => {
                self.records_delivered = self.records_delivered.saturating_add(1);
                match record.extraction_origin {
                    ExtractionOrigin::Structured => {
                        self.structured_records = self.structured_records.saturating_add(1)
                    }
                    ExtractionOrigin::Rendered => {
                        self.rendered_records = self.rendered_records.saturating_add(1)
                    }
                }
            }
            ExtractionOutcome::Skipped { .. } => {
                self.items_skipped = self.items_skipped.saturating_add(1)
            }
            ExtractionOutcome::Failed { .. } => {
                self.items_failed = self.items_failed.saturating_add(1)
            }
        }
    }

    pub fn record_forward(&mut self, status: ForwardStatus) {
        match status {
            ForwardStatus::Sent => self.forward_sent = self.forward_sent.saturating_add(1),
            ForwardStatus::Failed => self.forward_failed = self.forward_failed.saturating_add(1),
            ForwardStatus::Disabled => {}
        }
    }

    pub fn record_filter_failure(&mut self) {
        self.filters_failed = self.filters_failed.saturating_add(1);
    }

    /// Share of delivered records that came from the structured payload.
    pub fn structured_rate(&self) -> f64 {
        if self.records_delivered == 0 {
            0.0
        } else {
            (self.structured_records as f64 / self.records_delivered as f64) * 100.0
        }
    }

    pub fn merge(&mut self, other: &HarvestMetrics) {
        self.pages_visited = self.pages_visited.saturating_add(other.pages_visited);
        self.links_found = self.links_found.saturating_add(other.links_found);
        self.link_retries = self.link_retries.saturating_add(other.link_retries);
        self.items_attempted = self.items_attempted.saturating_add(other.items_attempted);
        self.records_delivered = self.records_delivered.saturating_add(other.records_delivered);
        self.structured_records = self.structured_records.saturating_add(other.structured_records);
        self.rendered_records = self.rendered_records.saturating_add(other.rendered_records);
        self.items_skipped = self.items_skipped.saturating_add(other.items_skipped);
        self.items_failed = self.items_failed.saturating_add(other.items_failed);
        self.forward_sent = self.forward_sent.saturating_add(other.forward_sent);
        self.forward_failed = self.forward_failed.saturating_add(other.forward_failed);
        self.filters_failed = self.filters_failed.saturating_add(other.filters_failed);
    }
}
