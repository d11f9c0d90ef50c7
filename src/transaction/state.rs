//! Per-record transaction state.

use crate::checkpoint::{CheckpointRecord, StreamCheckpoint};
use crate::models::{Phase, Result, StreamName, StreamResult, StreamStatus, TristreamError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// State of one record's journey through prepare/commit.
///
/// The phase only moves along the edges allowed by [`Phase::can_transition_to`].
#[derive(Debug, Clone)]
pub struct TransactionState {
    /// Business key
    pub record_id: String,
    /// Display only
    pub record_title: String,
    /// Unique per attempt, so retries of a record are distinguishable
    pub attempt_id: String,
    /// Exclusively owned scratch path
    pub staging_dir: PathBuf,
    phase: Phase,
    pub stream_results: BTreeMap<StreamName, StreamResult>,
    pub start_time: DateTime<Utc>,
    pub error: Option<String>,
    /// Fingerprint of the content being published
    pub content_hash: Option<String>,
}

impl TransactionState {
    pub fn new(record_id: &str, record_title: &str, staging_dir: PathBuf) -> Self {
        Self {
            record_id: record_id.to_string(),
            record_title: record_title.to_string(),
            attempt_id: uuid::Uuid::new_v4().to_string(),
            staging_dir,
            phase: Phase::Init,
            stream_results: BTreeMap::new(),
            start_time: Utc::now(),
            error: None,
            content_hash: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TristreamError::InvalidPhase {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Streams currently committed, in commit order.
    pub fn committed_streams(&self) -> Vec<StreamName> {
        StreamName::COMMIT_ORDER
            .into_iter()
            .filter(|s| {
                self.stream_results
                    .get(s)
                    .is_some_and(|r| r.status == StreamStatus::Committed)
            })
            .collect()
    }

    /// Durable projection of this state.
    pub fn to_checkpoint(&self) -> CheckpointRecord {
        CheckpointRecord {
            record_id: self.record_id.clone(),
            record_title: self.record_title.clone(),
            attempt_id: Some(self.attempt_id.clone()),
            phase: self.phase,
            per_stream: self
                .stream_results
                .iter()
                .map(|(name, result)| {
                    (
                        *name,
                        StreamCheckpoint {
                            status: result.status,
                            error: result.error.clone(),
                            timestamp: result.timestamp,
                        },
                    )
                })
                .collect(),
            start_time: self.start_time,
            updated_at: Utc::now(),
            content_hash: self.content_hash.clone(),
            error: self.error.clone(),
        }
    }
}
