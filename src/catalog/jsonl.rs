//! JSON Lines catalog backed by local files.

use crate::catalog::{Catalog, ContentSource};
use crate::models::{RecordDescriptor, Result, TristreamError};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

/// Catalog read from a `.jsonl` file, one descriptor per line.
///
/// Content comes from the inline `content` field, else from the file named by
/// `page_url` (relative paths resolve against the catalog's directory).
#[derive(Debug, Clone)]
pub struct JsonlCatalog {
    path: PathBuf,
    base_dir: PathBuf,
}

impl JsonlCatalog {
    pub fn new(path: &Path) -> Self {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: path.to_path_buf(),
            base_dir,
        }
    }

    /// Parse every descriptor. Blank lines are skipped.
    pub fn load(&self) -> Result<Vec<RecordDescriptor>> {
        let file = File::open(&self.path).map_err(|e| TristreamError::io("opening catalog", e))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| TristreamError::io("reading catalog", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RecordDescriptor = serde_json::from_str(&line).map_err(|e| {
                TristreamError::ParseError(format!("Line {}: {}", line_num + 1, e))
            })?;
            if record.id.trim().is_empty() {
                return Err(TristreamError::InvalidInput(format!(
                    "Line {}: record id is empty",
                    line_num + 1
                )));
            }
            records.push(record);
        }

        info!(count = records.len(), path = %self.path.display(), "Loaded catalog");
        Ok(records)
    }

    /// Local path a `page_url` points at.
    pub fn resolve(&self, page_url: &str) -> Result<PathBuf> {
        let raw = page_url.strip_prefix("file://").unwrap_or(page_url);
        if raw.contains("://") {
            return Err(TristreamError::InvalidInput(format!(
                "Unsupported content locator: {page_url}"
            )));
        }
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        })
    }
}

#[async_trait]
impl Catalog for JsonlCatalog {
    async fn fetch_records(&self) -> Result<Vec<RecordDescriptor>> {
        self.load()
    }
}

#[async_trait]
impl ContentSource for JsonlCatalog {
    async fn fetch_content(&self, descriptor: &RecordDescriptor) -> Result<Option<String>> {
        if let Some(content) = &descriptor.content {
            return Ok(Some(content.clone()));
        }
        let Some(url) = descriptor.page_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };

        let path = self.resolve(url)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| TristreamError::io(format!("reading content {}", path.display()), e))?;
        Ok(Some(content))
    }
}
