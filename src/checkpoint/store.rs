//! Per-record checkpoint persistence.
//!
//! - One JSON file per record id, overwritten on every save
//! - Writes go to a temp file first, then rename (no torn checkpoints)
//! - Each transaction only writes its own record's file, so concurrent
//!   transactions never contend on the same path

use crate::models::{Phase, Result, StreamName, StreamStatus, TristreamError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-stream entry of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Durable projection of a transaction's last known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Record business key
    pub record_id: String,
    /// Display title
    #[serde(default)]
    pub record_title: String,
    /// Transaction attempt that wrote this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    /// Last persisted phase
    pub phase: Phase,
    /// Per-stream outcome
    #[serde(default)]
    pub per_stream: BTreeMap<StreamName, StreamCheckpoint>,
    /// When the transaction started
    pub start_time: DateTime<Utc>,
    /// When this checkpoint was written
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fingerprint of the content that was processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Transaction-level error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointRecord {
    pub fn is_committed(&self) -> bool {
        self.phase == Phase::Committed
    }

    /// Streams that are still committed in a failed transaction: their
    /// rollback did not go through and production holds orphaned data.
    pub fn orphaned_streams(&self) -> Vec<StreamName> {
        if self.phase != Phase::RolledBack {
            return Vec::new();
        }
        self.per_stream
            .iter()
            .filter(|(_, cp)| cp.status == StreamStatus::Committed)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// What a startup scan found.
#[derive(Debug, Clone, Default)]
pub struct CheckpointScan {
    /// Records whose last phase is committed
    pub completed: HashSet<String>,
    /// Records whose last phase is non-terminal (process died mid-flight)
    pub interrupted: Vec<String>,
    /// Last known content fingerprint per record
    pub fingerprints: HashMap<String, String>,
    /// Files that could not be read or parsed
    pub unreadable: usize,
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (and create if needed) a checkpoint directory.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| TristreamError::io("creating checkpoint dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding a record's checkpoint.
    pub fn path_for(&self, record_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", record_file_stem(record_id)))
    }

    /// Persist a checkpoint, replacing any previous one for the record.
    pub async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| TristreamError::Internal(format!("Serializing checkpoint: {e}")))?;
        let path = self.path_for(&record.record_id);
        write_atomic(&path, &content).await?;
        debug!(record_id = %record.record_id, phase = %record.phase, "Checkpoint saved");
        Ok(())
    }

    /// Load one record's checkpoint, if present.
    pub fn load(&self, record_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(record_id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Every readable checkpoint, sorted by record id.
    pub fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        for path in self.checkpoint_files()? {
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(records)
    }

    /// Build the completed set and recovery hints.
    pub fn scan(&self) -> Result<CheckpointScan> {
        let mut scan = CheckpointScan::default();

        for path in self.checkpoint_files()? {
            let record = match read_record(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load checkpoint");
                    scan.unreadable += 1;
                    continue;
                }
            };

            if let Some(hash) = &record.content_hash {
                scan.fingerprints
                    .insert(record.record_id.clone(), hash.clone());
            }
            if record.is_committed() {
                scan.completed.insert(record.record_id);
            } else if !record.phase.is_terminal() {
                scan.interrupted.push(record.record_id);
            }
        }

        scan.interrupted.sort();
        Ok(scan)
    }

    fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = Path::new(&dir).join("*.json");
        let pattern_str = pattern.to_string_lossy();

        let files = glob::glob(&pattern_str)
            .map_err(|e| TristreamError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(files)
    }
}

fn read_record(path: &Path) -> Result<CheckpointRecord> {
    let file = File::open(path).map_err(|e| TristreamError::io("opening checkpoint", e))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| TristreamError::ParseError(format!("Invalid checkpoint {}: {e}", path.display())))
}

/// Filesystem-safe stem for a record id.
///
/// Ids that need escaping get a short hash suffix so that two ids escaping to
/// the same text still land in different files.
pub(crate) fn record_file_stem(record_id: &str) -> String {
    let escaped: String = record_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if escaped == record_id && !record_id.is_empty() && !record_id.starts_with('.') {
        return escaped;
    }

    let digest = Sha256::digest(record_id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{escaped}-{suffix}")
}

/// Write `content` to `path` via a sibling temp file and rename.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TristreamError::Internal(format!("No file name in {}", path.display())))?;
    let temp_path = path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&temp_path, content)
        .await
        .map_err(|e| TristreamError::io(format!("writing {}", temp_path.display()), e))?;

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(TristreamError::io(format!("renaming into {}", path.display()), e));
    }
    Ok(())
}
