//! tristream - Atomic publishing of records into three non-transactional stores.
//!
//! ## Architecture
//!
//! Every record is published through three streams:
//! - **Semantic**: metadata and abstract for a search index
//! - **Vector**: image references and a text embedding for similarity search
//! - **Document**: sectioned document for a document database
//!
//! ## Protocol
//!
//! - **Prepare**: all three streams stage in parallel, production untouched
//! - **Commit**: Semantic → Vector → Document, one at a time
//! - **Rollback**: committed streams are compensated in reverse order
//!
//! ## Recovery
//!
//! One checkpoint file per record. Records whose last checkpoint is committed
//! are skipped on later runs; everything else is reprocessed from scratch.

pub mod catalog;
pub mod checkpoint;
pub mod coordinator;
pub mod models;
pub mod stream;
pub mod transaction;

// Re-exports for convenience
pub use catalog::{Catalog, ContentSource, JsonlCatalog};
pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use coordinator::TransactionCoordinator;
pub use models::{
    Config, Outcome, Phase, RecordDescriptor, Result, RunSummary, StreamName, TristreamError,
};
pub use stream::{LocalStoreProcessor, ProcessorSet, StreamProcessor, local_processor_set};
pub use transaction::{IngestionTransaction, StagingArea};
