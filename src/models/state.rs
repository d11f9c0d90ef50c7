//! Stream and phase types shared by the transaction, checkpoint and coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One of the three independent backing stores.
///
/// Declaration order is commit order; rollback walks it in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    /// Semantic search index
    Semantic,
    /// Vector similarity index
    Vector,
    /// Document database
    Document,
}

impl StreamName {
    /// All streams in commit order.
    pub const COMMIT_ORDER: [StreamName; 3] =
        [StreamName::Semantic, StreamName::Vector, StreamName::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Vector => "vector",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stream within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Prepared,
    Committed,
    Failed,
    RolledBack,
}

/// Phase of a record's transaction.
///
/// ```text
/// Init -> Preparing -> Prepared -> Committing -> Committed
///            |                         |
///            v                         v
///          Failed                 RollingBack -> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Failed,
    RollingBack,
    RolledBack,
}

impl Phase {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Init, Preparing)
                | (Preparing, Prepared)
                | (Preparing, Failed)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Committed, Failed and RolledBack end a transaction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Committed | Phase::Failed | Phase::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one stream's prepare phase.
///
/// The same payload is handed to `commit` and, if needed, `rollback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedPayload {
    /// Stream that produced this payload
    pub stream: StreamName,
    /// Record the payload belongs to
    pub record_id: String,
    /// Staging subdirectory owned by this stream
    pub staging_dir: PathBuf,
    /// Processor-defined staged data
    pub data: serde_json::Value,
}

/// Result of one (transaction, stream) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResult {
    pub stream_name: StreamName,
    pub status: StreamStatus,
    /// Staged payload, absent when prepare failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StagedPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StreamResult {
    pub fn prepared(payload: StagedPayload) -> Self {
        Self {
            stream_name: payload.stream,
            status: StreamStatus::Prepared,
            data: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(stream_name: StreamName, error: impl Into<String>) -> Self {
        Self {
            stream_name,
            status: StreamStatus::Failed,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Move to a new status, refreshing the timestamp.
    pub fn set_status(&mut self, status: StreamStatus) {
        self.status = status;
        self.timestamp = Utc::now();
    }
}
