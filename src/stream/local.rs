//! Filesystem-backed stream processors.
//!
//! Each stream writes committed documents to `<root>/<stream>/<record>.json`.
//! Used by the CLI for local runs and dry runs against a scratch directory.

use crate::checkpoint::{record_file_stem, write_atomic};
use crate::models::{RecordMetadata, Result, StagedPayload, StreamName, TristreamError};
use crate::stream::{ProcessorSet, StreamProcessor};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Characters of plain text kept in the semantic abstract.
const ABSTRACT_CHARS: usize = 30_000;

/// Dimensions of the hashed text embedding.
pub const EMBEDDING_DIM: usize = 64;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static IMG_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid img regex")
});
static H2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h2\b[^>]*>(.*?)</h2>").expect("valid h2 regex"));
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid ws regex"));
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+").expect("valid token regex"));

/// One headed section of a record's document view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub body: String,
}

/// Processor for one stream, storing documents under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStoreProcessor {
    stream: StreamName,
    dir: PathBuf,
}

impl LocalStoreProcessor {
    pub fn new(stream: StreamName, store_root: &Path) -> Self {
        Self {
            stream,
            dir: store_root.join(stream.as_str()),
        }
    }

    /// Where a record's committed document lives.
    pub fn document_path(&self, record_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", record_file_stem(record_id)))
    }

    fn derive(&self, metadata: &RecordMetadata, content: &str) -> serde_json::Value {
        let text = strip_tags(content);
        match self.stream {
            StreamName::Semantic => serde_json::json!({
                "metadata": metadata,
                "abstract": text.chars().take(ABSTRACT_CHARS).collect::<String>(),
            }),
            StreamName::Vector => serde_json::json!({
                "record_id": metadata.id,
                "images": image_sources(content),
                "embedding": hashed_embedding(&text),
            }),
            StreamName::Document => serde_json::json!({
                "record_id": metadata.id,
                "title": metadata.title,
                "category": metadata.category,
                "sections": split_sections(content),
            }),
        }
    }
}

#[async_trait]
impl StreamProcessor for LocalStoreProcessor {
    async fn prepare(
        &self,
        metadata: &RecordMetadata,
        content: &str,
        staging_dir: &Path,
    ) -> Result<serde_json::Value> {
        let data = self.derive(metadata, content);

        // Stage the full document; commit copies it into the store.
        let staged = staging_dir.join("document.json");
        let bytes = serde_json::to_vec_pretty(&data)
            .map_err(|e| TristreamError::stream(self.stream, format!("serializing document: {e}")))?;
        write_atomic(&staged, &bytes).await?;

        debug!(record_id = %metadata.id, stream = %self.stream, "Staged document");
        Ok(serde_json::json!({
            "staged_file": staged,
            "bytes": bytes.len(),
        }))
    }

    async fn commit(&self, payload: &StagedPayload) -> Result<()> {
        let staged = payload.staging_dir.join("document.json");
        let bytes = tokio::fs::read(&staged).await.map_err(|e| {
            TristreamError::stream(self.stream, format!("reading {}: {e}", staged.display()))
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TristreamError::io("creating store dir", e))?;
        write_atomic(&self.document_path(&payload.record_id), &bytes).await?;
        debug!(record_id = %payload.record_id, stream = %self.stream, "Document stored");
        Ok(())
    }

    async fn rollback(&self, payload: &StagedPayload) -> Result<()> {
        let path = self.document_path(&payload.record_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TristreamError::stream(
                self.stream,
                format!("deleting {}: {e}", path.display()),
            )),
        }
    }
}

/// The three filesystem processors sharing one store root.
pub fn local_processor_set(store_root: &Path) -> ProcessorSet {
    ProcessorSet::new(
        Arc::new(LocalStoreProcessor::new(StreamName::Semantic, store_root)),
        Arc::new(LocalStoreProcessor::new(StreamName::Vector, store_root)),
        Arc::new(LocalStoreProcessor::new(StreamName::Document, store_root)),
    )
}

/// Markup to collapsed plain text.
pub fn strip_tags(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

/// `src` of every `<img>`, skipping icons.
pub fn image_sources(html: &str) -> Vec<String> {
    IMG_SRC_RE
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|src| !src.to_ascii_lowercase().contains("icon"))
        .collect()
}

/// Split on `<h2>` headings. Text before the first heading is "Overview".
pub fn split_sections(html: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading = "Overview".to_string();
    let mut cursor = 0;

    for caps in H2_RE.captures_iter(html) {
        let Some(whole) = caps.get(0) else { continue };
        push_section(&mut sections, &heading, &html[cursor..whole.start()]);
        heading = strip_tags(&caps[1]);
        cursor = whole.end();
    }
    push_section(&mut sections, &heading, &html[cursor..]);
    sections
}

fn push_section(sections: &mut Vec<Section>, heading: &str, raw: &str) {
    let body = strip_tags(raw);
    if !body.is_empty() {
        sections.push(Section {
            heading: heading.to_string(),
            body,
        });
    }
}

/// Deterministic bag-of-words embedding via signed feature hashing.
///
/// L2 normalized; all zeros for text without tokens.
pub fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBEDDING_DIM];
    for token in TOKEN_RE.find_iter(text) {
        let digest = Sha256::digest(token.as_str().to_ascii_lowercase().as_bytes());
        let bucket = u16::from_be_bytes([digest[0], digest[1]]) as usize % EMBEDDING_DIM;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
