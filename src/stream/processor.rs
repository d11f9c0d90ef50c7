//! The stream processor contract and the fixed set of three processors.

use crate::models::{RecordMetadata, Result, StagedPayload, StreamName};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Adapter for one backing store.
///
/// `prepare` must not touch production storage: it only derives the write and
/// stages whatever it needs under `staging_dir`. `commit` applies a staged
/// payload; `rollback` undoes a committed one. Writes are expected to be
/// idempotent since delivery is at-least-once.
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    /// Stage a write. A `Null` value counts as a refusal to stage.
    async fn prepare(
        &self,
        metadata: &RecordMetadata,
        content: &str,
        staging_dir: &Path,
    ) -> Result<serde_json::Value>;

    /// Durably apply a previously staged payload.
    async fn commit(&self, payload: &StagedPayload) -> Result<()>;

    /// Undo a previously committed payload. Best effort.
    async fn rollback(&self, payload: &StagedPayload) -> Result<()>;
}

/// The three processors a transaction publishes through.
#[derive(Clone)]
pub struct ProcessorSet {
    semantic: Arc<dyn StreamProcessor>,
    vector: Arc<dyn StreamProcessor>,
    document: Arc<dyn StreamProcessor>,
}

impl ProcessorSet {
    pub fn new(
        semantic: Arc<dyn StreamProcessor>,
        vector: Arc<dyn StreamProcessor>,
        document: Arc<dyn StreamProcessor>,
    ) -> Self {
        Self {
            semantic,
            vector,
            document,
        }
    }

    /// Processor for a stream.
    pub fn get(&self, stream: StreamName) -> &Arc<dyn StreamProcessor> {
        match stream {
            StreamName::Semantic => &self.semantic,
            StreamName::Vector => &self.vector,
            StreamName::Document => &self.document,
        }
    }
}

impl fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorSet").finish_non_exhaustive()
    }
}
