use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionOrigin {
    /// Intercepted structured-data response.
    Structured,
    /// Extraction script evaluated against the rendered document.
    Rendered,
}

impl fmt::Display for ExtractionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionOrigin::Structured => f.write_str("structured"),
            ExtractionOrigin::Rendered => f.write_str("rendered"),
        }
    }
}

/// Canonical listing extracted from one detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub price_numeric: Option<f64>,
    pub price_display: Option<String>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub mileage_numeric: Option<f64>,
    pub mileage_display: Option<String>,
    pub seller_name: Option<String>,
    pub seller_location: Option<String>,
    pub rating_label: Option<String>,
    pub category: Option<String>,
    pub source_url: String,
    pub page_number: u32,
    pub extraction_origin: ExtractionOrigin,
    pub extracted_at: DateTime<Utc>,
}

impl Record {
    /// A record is worth keeping when it carries an identifier or a title.
    pub fn has_identity(&self) -> bool {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false)
        };
        present(&self.identifier) || present(&self.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoIdentifierOrTitle,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoIdentifierOrTitle => f.write_str("neither identifier nor title resolved"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Success(Record),
    Skipped { url: String, reason: SkipReason },
    Failed { url: String, error: String },
}

impl ExtractionOutcome {
    pub fn url(&self) -> &str {
        match self {
            ExtractionOutcome::Success(record) => &record.source_url,
            ExtractionOutcome::Skipped { url, .. } | ExtractionOutcome::Failed { url, .. } => url,
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            ExtractionOutcome::Success(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success(_))
    }
}
