//! Two-phase publish of one record across the three streams.
//!
//! - Prepare: all streams stage concurrently; nothing touches production
//! - Commit: sequential, Semantic -> Vector -> Document
//! - Rollback: reverse commit order, best effort, never stops early

use crate::models::{
    Phase, RecordMetadata, Result, StagedPayload, StreamName, StreamResult, StreamStatus,
    TristreamError,
};
use crate::stream::ProcessorSet;
use crate::transaction::{StagingSlot, TransactionState};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables for one transaction.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Bound on any single processor call
    pub stream_timeout: Duration,
    /// Attempts per stream commit
    pub commit_attempts: u32,
    /// Base of the exponential backoff between commit attempts
    pub retry_backoff: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(180),
            commit_attempts: 1,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// One record's two-phase commit across the semantic, vector and document
/// stores.
pub struct IngestionTransaction {
    state: TransactionState,
    slot: StagingSlot,
    options: TransactionOptions,
}

impl IngestionTransaction {
    pub fn new(
        record_id: &str,
        record_title: &str,
        slot: StagingSlot,
        options: TransactionOptions,
    ) -> Self {
        Self {
            state: TransactionState::new(record_id, record_title, slot.dir().to_path_buf()),
            slot,
            options,
        }
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut TransactionState {
        &mut self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Phase 1: stage every stream in parallel.
    ///
    /// Returns `Ok(false)` if any stream failed; the transaction is then
    /// `Failed` and its staging is gone. `Err` only for invariant violations.
    pub async fn prepare(
        &mut self,
        processors: &ProcessorSet,
        metadata: &RecordMetadata,
        content: &str,
    ) -> Result<bool> {
        self.state.advance(Phase::Preparing)?;
        let record_id = self.state.record_id.clone();

        if let Err(e) = self.slot.reset().await {
            error!(record_id = %record_id, error = %e, "Could not create staging directory");
            self.state.error = Some(format!("Staging unavailable: {e}"));
            self.state.advance(Phase::Failed)?;
            self.slot.cleanup().await;
            return Ok(false);
        }

        info!(record_id = %record_id, "Phase 1: preparing semantic, vector, document in parallel");

        let (semantic, vector, document) = tokio::join!(
            self.prepare_stream(processors, StreamName::Semantic, metadata, content),
            self.prepare_stream(processors, StreamName::Vector, metadata, content),
            self.prepare_stream(processors, StreamName::Document, metadata, content),
        );

        let mut failures = Vec::new();
        for (stream, outcome) in StreamName::COMMIT_ORDER
            .into_iter()
            .zip([semantic, vector, document])
        {
            match outcome {
                Ok(payload) => {
                    debug!(record_id = %record_id, stream = %stream, "Stream prepared");
                    self.state
                        .stream_results
                        .insert(stream, StreamResult::prepared(payload));
                }
                Err(e) => {
                    error!(record_id = %record_id, stream = %stream, error = %e, "Stream preparation failed");
                    self.state
                        .stream_results
                        .insert(stream, StreamResult::failed(stream, e.to_string()));
                    failures.push(stream.as_str());
                }
            }
        }

        if !failures.is_empty() {
            self.state.error = Some(format!(
                "Streams {} failed during preparation",
                failures.join(", ")
            ));
            self.state.advance(Phase::Failed)?;
            self.slot.cleanup().await;
            error!(record_id = %record_id, failed = ?failures, "Preparation failed");
            return Ok(false);
        }

        self.state.advance(Phase::Prepared)?;
        info!(record_id = %record_id, "All streams prepared");
        Ok(true)
    }

    async fn prepare_stream(
        &self,
        processors: &ProcessorSet,
        stream: StreamName,
        metadata: &RecordMetadata,
        content: &str,
    ) -> Result<StagedPayload> {
        let staging_dir = self.slot.stream_dir(stream);
        let data = self
            .bounded(processors.get(stream).prepare(metadata, content, &staging_dir))
            .await?;

        if data.is_null() {
            return Err(TristreamError::stream(stream, "prepare returned no payload"));
        }

        let payload = StagedPayload {
            stream,
            record_id: self.state.record_id.clone(),
            staging_dir,
            data,
        };
        self.slot.persist(&payload).await?;
        Ok(payload)
    }

    /// Phase 2: apply staged payloads one stream at a time.
    ///
    /// On the first failing stream, every stream committed before it is
    /// rolled back and `Ok(false)` is returned. Calling this outside the
    /// `Prepared` phase is a bug and returns `Err(InvalidPhase)`.
    pub async fn commit(&mut self, processors: &ProcessorSet) -> Result<bool> {
        self.state.advance(Phase::Committing)?;
        let record_id = self.state.record_id.clone();
        info!(record_id = %record_id, "Phase 2: committing semantic -> vector -> document");

        let mut committed: Vec<StreamName> = Vec::with_capacity(StreamName::COMMIT_ORDER.len());

        for stream in StreamName::COMMIT_ORDER {
            let outcome = match self.staged_payload(stream) {
                Ok(payload) => self.commit_stream(processors, &payload).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    self.set_stream_status(stream, StreamStatus::Committed);
                    committed.push(stream);
                    info!(record_id = %record_id, stream = %stream, "Stream committed");
                }
                Err(e) => {
                    error!(record_id = %record_id, stream = %stream, error = %e, "Commit failed, rolling back");
                    // A timed-out write may still have landed; compensate it too.
                    let in_doubt = matches!(e, TristreamError::Timeout(_));
                    if let Some(result) = self.state.stream_results.get_mut(&stream) {
                        result.set_status(StreamStatus::Failed);
                        result.error = Some(if in_doubt {
                            format!("{e} (outcome unknown)")
                        } else {
                            e.to_string()
                        });
                    }
                    if in_doubt {
                        committed.push(stream);
                    }
                    self.state.error = Some(format!("Commit failed: stream {stream}: {e}"));
                    self.rollback(processors, Some(&committed)).await?;
                    return Ok(false);
                }
            }
        }

        self.state.advance(Phase::Committed)?;
        self.slot.cleanup().await;
        info!(record_id = %record_id, "Transaction committed");
        Ok(true)
    }

    async fn commit_stream(&self, processors: &ProcessorSet, payload: &StagedPayload) -> Result<()> {
        let processor = processors.get(payload.stream);
        let attempts = self.options.commit_attempts.max(1);

        let mut attempt = 0;
        loop {
            match self.bounded(processor.commit(payload)).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < attempts && e.is_retryable() => {
                    let backoff = self.options.retry_backoff * 2u32.pow(attempt);
                    warn!(
                        record_id = %payload.record_id,
                        stream = %payload.stream,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Commit attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compensate committed streams in reverse commit order.
    ///
    /// `committed_streams` defaults to every stream whose status is
    /// `Committed`. A stream whose rollback fails keeps its `Committed`
    /// status and gets the error attached; the remaining streams are still
    /// compensated. The transaction always ends `RolledBack`.
    pub async fn rollback(
        &mut self,
        processors: &ProcessorSet,
        committed_streams: Option<&[StreamName]>,
    ) -> Result<()> {
        self.state.advance(Phase::RollingBack)?;
        let record_id = self.state.record_id.clone();

        let streams = match committed_streams {
            Some(streams) => streams.to_vec(),
            None => self.state.committed_streams(),
        };
        warn!(record_id = %record_id, streams = ?streams, "Rolling back streams");

        let mut orphaned = Vec::new();
        for stream in streams.into_iter().rev() {
            let Ok(payload) = self.staged_payload(stream) else {
                warn!(record_id = %record_id, stream = %stream, "No staged payload to roll back");
                continue;
            };

            match self.bounded(processors.get(stream).rollback(&payload)).await {
                Ok(()) => {
                    self.set_stream_status(stream, StreamStatus::RolledBack);
                    info!(record_id = %record_id, stream = %stream, "Stream rolled back");
                }
                Err(e) => {
                    error!(record_id = %record_id, stream = %stream, error = %e, "Failed to roll back stream");
                    if let Some(result) = self.state.stream_results.get_mut(&stream) {
                        result.error = Some(format!("Rollback failed: {e}"));
                    }
                    orphaned.push(stream.as_str());
                }
            }
        }

        if !orphaned.is_empty() {
            let note = format!("rollback failed for {}", orphaned.join(", "));
            self.state.error = Some(match self.state.error.take() {
                Some(existing) => format!("{existing}; {note}"),
                None => note,
            });
        }

        self.state.advance(Phase::RolledBack)?;
        self.slot.cleanup().await;
        warn!(record_id = %record_id, "Transaction rolled back");
        Ok(())
    }

    fn staged_payload(&self, stream: StreamName) -> Result<StagedPayload> {
        self.state
            .stream_results
            .get(&stream)
            .and_then(|r| r.data.clone())
            .ok_or_else(|| {
                TristreamError::Internal(format!(
                    "No staged payload for stream {stream} of record {}",
                    self.state.record_id
                ))
            })
    }

    fn set_stream_status(&mut self, stream: StreamName, status: StreamStatus) {
        if let Some(result) = self.state.stream_results.get_mut(&stream) {
            result.set_status(status);
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.options.stream_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TristreamError::Timeout(limit))?
    }
}

impl Drop for IngestionTransaction {
    fn drop(&mut self) {
        let phase = self.state.phase();
        if phase != Phase::Init && !phase.is_terminal() {
            warn!(
                record_id = %self.state.record_id,
                phase = %phase,
                "Transaction dropped mid-flight - will be reprocessed on restart"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordDescriptor;
    use crate::stream::testing::{Op, mock_set};
    use crate::transaction::StagingArea;
    use tempfile::TempDir;

    fn metadata(id: &str) -> RecordMetadata {
        RecordDescriptor::new(id, format!("Pattern {id}")).metadata()
    }

    fn transaction(area: &StagingArea, id: &str) -> IngestionTransaction {
        IngestionTransaction::new(
            id,
            &format!("Pattern {id}"),
            area.slot(id),
            TransactionOptions {
                stream_timeout: Duration::from_secs(5),
                commit_attempts: 1,
                retry_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_prepare_and_commit_all_streams() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| p);
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "<p>body</p>").await.unwrap());
        assert_eq!(tx.phase(), Phase::Prepared);
        // Staged payloads are persisted while prepared
        assert!(area.read_payload("p1", StreamName::Vector).unwrap().is_some());

        assert!(tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::Committed);
        assert_eq!(tx.state().committed_streams(), StreamName::COMMIT_ORDER.to_vec());
        assert!(!area.slot("p1").dir().exists());

        assert_eq!(
            log.ops_for("p1", Op::Commit),
            vec![StreamName::Semantic, StreamName::Vector, StreamName::Document]
        );
        for stream in StreamName::COMMIT_ORDER {
            assert!(procs.get(stream).is_committed("p1"));
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_aborts_without_commits() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Vector => p.fail_prepare_on("p1"),
            _ => p,
        });
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(!tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert_eq!(tx.phase(), Phase::Failed);
        assert!(tx.state().error.as_deref().unwrap().contains("vector"));

        let vector = &tx.state().stream_results[&StreamName::Vector];
        assert_eq!(vector.status, StreamStatus::Failed);
        assert!(!area.slot("p1").dir().exists());
        assert!(log.ops_for("p1", Op::Commit).is_empty());
        assert!(log.ops_for("p1", Op::Rollback).is_empty());
    }

    #[tokio::test]
    async fn test_null_payload_counts_as_failure() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (_log, procs) = mock_set(|p| match p.stream() {
            StreamName::Document => p.return_null_payload(),
            _ => p,
        });
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(!tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        let doc = &tx.state().stream_results[&StreamName::Document];
        assert!(doc.error.as_deref().unwrap().contains("no payload"));
    }

    #[tokio::test]
    async fn test_commit_requires_prepared_phase() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| p);

        let mut tx = transaction(&area, "p1");
        let err = tx.commit(&procs.set()).await.unwrap_err();
        assert!(matches!(err, TristreamError::InvalidPhase { from: Phase::Init, .. }));
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_third_commit_failure_rolls_back_in_reverse() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Document => p.fail_commit_on("p1"),
            _ => p,
        });
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert!(!tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::RolledBack);

        assert_eq!(
            log.ops_for("p1", Op::Rollback),
            vec![StreamName::Vector, StreamName::Semantic]
        );
        for stream in StreamName::COMMIT_ORDER {
            assert!(!procs.get(stream).is_committed("p1"));
        }

        let results = &tx.state().stream_results;
        assert_eq!(results[&StreamName::Semantic].status, StreamStatus::RolledBack);
        assert_eq!(results[&StreamName::Vector].status, StreamStatus::RolledBack);
        assert_eq!(results[&StreamName::Document].status, StreamStatus::Failed);
        assert!(tx.state().error.as_deref().unwrap().starts_with("Commit failed"));
        assert!(!area.slot("p1").dir().exists());
    }

    #[tokio::test]
    async fn test_first_commit_failure_needs_no_compensation() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Semantic => p.fail_commit_on("p1"),
            _ => p,
        });
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert!(!tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::RolledBack);
        assert!(log.ops_for("p1", Op::Rollback).is_empty());
        assert_eq!(log.ops_for("p1", Op::Commit), vec![StreamName::Semantic]);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_stop_compensation() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Vector => p.fail_rollback(),
            StreamName::Document => p.fail_commit_on("p1"),
            _ => p,
        });
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert!(!tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::RolledBack);

        // Vector rollback failed but semantic was still compensated
        assert_eq!(
            log.ops_for("p1", Op::Rollback),
            vec![StreamName::Vector, StreamName::Semantic]
        );
        assert!(!procs.get(StreamName::Semantic).is_committed("p1"));
        assert!(procs.get(StreamName::Vector).is_committed("p1"));

        let vector = &tx.state().stream_results[&StreamName::Vector];
        assert_eq!(vector.status, StreamStatus::Committed);
        assert!(vector.error.as_deref().unwrap().starts_with("Rollback failed"));
        assert!(tx.state().error.as_deref().unwrap().contains("rollback failed for vector"));
        assert_eq!(tx.state().to_checkpoint().orphaned_streams(), vec![StreamName::Vector]);
    }

    #[tokio::test]
    async fn test_commit_retries_transient_failures() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Vector => p.fail_commits_times(2),
            _ => p,
        });
        let set = procs.set();

        let mut tx = IngestionTransaction::new(
            "p1",
            "Pattern",
            area.slot("p1"),
            TransactionOptions {
                stream_timeout: Duration::from_secs(5),
                commit_attempts: 3,
                retry_backoff: Duration::from_millis(1),
            },
        );
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert!(tx.commit(&set).await.unwrap());
        assert_eq!(
            log.ops_for("p1", Op::Commit),
            vec![
                StreamName::Semantic,
                StreamName::Vector,
                StreamName::Vector,
                StreamName::Vector,
                StreamName::Document
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_prepare_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (_log, procs) = mock_set(|p| match p.stream() {
            StreamName::Semantic => p.with_delay(Duration::from_millis(500)),
            _ => p,
        });
        let set = procs.set();

        let mut tx = IngestionTransaction::new(
            "p1",
            "Pattern",
            area.slot("p1"),
            TransactionOptions {
                stream_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        assert!(!tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        let semantic = &tx.state().stream_results[&StreamName::Semantic];
        assert!(semantic.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timed_out_commit_is_compensated_too() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| match p.stream() {
            StreamName::Document => p.with_commit_delay(Duration::from_millis(500)),
            _ => p,
        });
        let set = procs.set();

        let mut tx = IngestionTransaction::new(
            "p1",
            "Pattern",
            area.slot("p1"),
            TransactionOptions {
                stream_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        assert!(!tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::RolledBack);

        assert_eq!(
            log.ops_for("p1", Op::Rollback),
            vec![StreamName::Document, StreamName::Vector, StreamName::Semantic]
        );
        let doc = &tx.state().stream_results[&StreamName::Document];
        assert_eq!(doc.status, StreamStatus::RolledBack);
        assert!(doc.error.as_deref().unwrap().contains("outcome unknown"));
        for stream in StreamName::COMMIT_ORDER {
            assert!(!procs.get(stream).is_committed("p1"));
        }
    }

    #[tokio::test]
    async fn test_missing_staged_payload_rolls_back_earlier_streams() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| p);
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        tx.state_mut().stream_results.remove(&StreamName::Document);

        assert!(!tx.commit(&set).await.unwrap());
        assert_eq!(tx.phase(), Phase::RolledBack);
        assert_eq!(
            log.ops_for("p1", Op::Commit),
            vec![StreamName::Semantic, StreamName::Vector]
        );
        assert_eq!(
            log.ops_for("p1", Op::Rollback),
            vec![StreamName::Vector, StreamName::Semantic]
        );
        assert!(!procs.get(StreamName::Semantic).is_committed("p1"));
        assert!(tx.state().error.as_deref().unwrap().contains("No staged payload"));
    }

    #[tokio::test]
    async fn test_explicit_rollback_derives_committed_streams() {
        let temp_dir = TempDir::new().unwrap();
        let area = StagingArea::new(temp_dir.path());
        let (log, procs) = mock_set(|p| p);
        let set = procs.set();

        let mut tx = transaction(&area, "p1");
        assert!(tx.prepare(&set, &metadata("p1"), "content").await.unwrap());
        tx.state_mut().advance(Phase::Committing).unwrap();
        // Pretend semantic and vector made it before an external abort
        for stream in [StreamName::Semantic, StreamName::Vector] {
            tx.set_stream_status(stream, StreamStatus::Committed);
        }

        tx.rollback(&set, None).await.unwrap();
        assert_eq!(tx.phase(), Phase::RolledBack);
        assert_eq!(
            log.ops_for("p1", Op::Rollback),
            vec![StreamName::Vector, StreamName::Semantic]
        );
    }
}
