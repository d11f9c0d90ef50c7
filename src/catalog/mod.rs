//! Record catalogs and content sources.

mod jsonl;

pub use jsonl::*;

use crate::models::{RecordDescriptor, Result};
use async_trait::async_trait;

/// Source of truth listing the records to publish.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn fetch_records(&self) -> Result<Vec<RecordDescriptor>>;
}

/// Fetches a record's raw content.
///
/// `Ok(None)` means the record has no content locator at all.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_content(&self, descriptor: &RecordDescriptor) -> Result<Option<String>>;
}
