//! Checkpoint module for resumable batch runs.
//!
//! Provides:
//! - `CheckpointRecord`: durable projection of one record's transaction
//! - `CheckpointStore`: per-record persistence and the startup scan

mod store;

pub use store::*;
pub(crate) use store::{record_file_stem, write_atomic};
