//! Catalog records and run outcomes.

use serde::{Deserialize, Serialize};

/// One row of the source-of-truth catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDescriptor {
    /// Business key, globally unique
    pub id: String,

    /// Display title
    #[serde(default)]
    pub title: String,

    /// Locator of the record's raw content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,

    /// Inline raw content (takes precedence over `page_url`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity: Option<String>,

    #[serde(default)]
    pub frequency: u64,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default = "default_owner")]
    pub owner: String,

    #[serde(default = "default_category")]
    pub category: String,

    /// Fingerprint published by the catalog, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

fn default_status() -> String {
    "active".to_string()
}

fn default_owner() -> String {
    "Architecture".to_string()
}

fn default_category() -> String {
    "General".to_string()
}

impl RecordDescriptor {
    /// Create a descriptor with defaults for every optional column.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            page_url: None,
            content: None,
            maturity: None,
            frequency: 0,
            status: default_status(),
            owner: default_owner(),
            category: default_category(),
            content_hash: None,
        }
    }

    /// Metadata handed to stream processors.
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            id: self.id.clone(),
            title: self.title.clone(),
            page_url: self.page_url.clone(),
            maturity: self.maturity.clone(),
            frequency: self.frequency,
            status: self.status.clone(),
            owner: self.owner.clone(),
            category: self.category.clone(),
        }
    }
}

/// Record metadata visible to stream processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maturity: Option<String>,
    pub frequency: u64,
    pub status: String,
    pub owner: String,
    pub category: String,
}

/// Why a record was skipped rather than processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Last checkpoint says committed
    AlreadyCompleted,
    /// No content locator and no inline content
    MissingContentUrl,
    /// Content fetched but blank
    EmptyContent,
    /// Content source could not deliver
    ContentUnavailable,
    /// Same record id appeared earlier in the batch
    DuplicateInBatch,
}

/// Terminal outcome of one record in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Skip(SkipReason),
    Failure,
}

/// Summary of one coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub skip: usize,
    pub failure: usize,

    /// Most transactions observed in flight at once
    pub peak_in_flight: usize,

    /// Records whose content fingerprint changed since last seen
    pub drift_warnings: usize,

    pub runtime_secs: f64,
}

impl RunSummary {
    /// Tally one outcome.
    pub fn record(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Skip(_) => self.skip += 1,
            Outcome::Failure => self.failure += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failure > 0
    }
}
