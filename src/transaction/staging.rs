//! Staging area: per-record scratch directories for prepared payloads.
//!
//! Layout: `<root>/<record>/<stream>/payload.json`, plus whatever files the
//! stream processor itself stages next to it.

use crate::checkpoint::{record_file_stem, write_atomic};
use crate::models::{Result, StagedPayload, StreamName, TristreamError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PAYLOAD_FILE: &str = "payload.json";

/// Root of all staging directories.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch slot for one record. The slot is owned by a single transaction.
    pub fn slot(&self, record_id: &str) -> StagingSlot {
        StagingSlot {
            dir: self.root.join(record_file_stem(record_id)),
        }
    }

    /// Read a persisted payload for inspection.
    pub fn read_payload(&self, record_id: &str, stream: StreamName) -> Result<Option<StagedPayload>> {
        let path = self.slot(record_id).stream_dir(stream).join(PAYLOAD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path)
            .map_err(|e| TristreamError::io(format!("reading {}", path.display()), e))?;
        let payload = serde_json::from_slice(&content).map_err(|e| {
            TristreamError::ParseError(format!("Invalid staged payload {}: {e}", path.display()))
        })?;
        Ok(Some(payload))
    }
}

/// One record's staging directory.
#[derive(Debug, Clone)]
pub struct StagingSlot {
    dir: PathBuf,
}

impl StagingSlot {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Subdirectory owned by one stream.
    pub fn stream_dir(&self, stream: StreamName) -> PathBuf {
        self.dir.join(stream.as_str())
    }

    /// Recreate the slot empty, with one subdirectory per stream.
    ///
    /// Leftovers from an interrupted attempt are discarded.
    pub async fn reset(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .map_err(|e| TristreamError::io("clearing stale staging dir", e))?;
        }
        for stream in StreamName::COMMIT_ORDER {
            tokio::fs::create_dir_all(self.stream_dir(stream))
                .await
                .map_err(|e| TristreamError::io("creating staging dir", e))?;
        }
        debug!(dir = %self.dir.display(), "Staging directory ready");
        Ok(())
    }

    /// Persist a prepared payload next to the stream's staged files.
    pub async fn persist(&self, payload: &StagedPayload) -> Result<()> {
        let content = serde_json::to_vec_pretty(payload)
            .map_err(|e| TristreamError::Internal(format!("Serializing staged payload: {e}")))?;
        write_atomic(&self.stream_dir(payload.stream).join(PAYLOAD_FILE), &content).await
    }

    /// Remove the slot. Failure is logged, never propagated.
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "Cleaned up staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to clean up staging directory"),
        }
    }
}
