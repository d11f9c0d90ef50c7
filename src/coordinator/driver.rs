//! Transaction coordinator: runs many records through the two-phase protocol.
//!
//! - Idempotent: records whose last checkpoint is committed are skipped
//! - Bounded: one semaphore permit per record for its whole prepare+commit
//! - Recoverable: anything not committed is reprocessed from scratch
//! - Checkpoint writes never fail a record; they only warn

use crate::catalog::ContentSource;
use crate::checkpoint::CheckpointStore;
use crate::coordinator::{content_fingerprint, has_drifted};
use crate::models::{
    CoordinatorConfig, Outcome, RecordDescriptor, Result, RunSummary, SkipReason, TristreamError,
};
use crate::stream::ProcessorSet;
use crate::transaction::{IngestionTransaction, StagingArea, TransactionOptions};
use dashmap::{DashMap, DashSet};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Where to stop a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Full,
    PrepareOnly,
}

/// Drives ingestion transactions for a batch of records.
pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    processors: ProcessorSet,
    checkpoints: CheckpointStore,
    staging: StagingArea,
    /// Records whose last persisted phase is committed
    completed: DashSet<String>,
    /// Last known content fingerprint per record
    fingerprints: DashMap<String, String>,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    drift_warnings: AtomicUsize,
}

impl TransactionCoordinator {
    /// Create a coordinator, loading the completed set from checkpoints.
    pub fn new(config: CoordinatorConfig, processors: ProcessorSet) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(TristreamError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let checkpoints = CheckpointStore::new(&config.checkpoint_dir)?;
        std::fs::create_dir_all(&config.staging_root)
            .map_err(|e| TristreamError::io("creating staging root", e))?;
        let staging = StagingArea::new(&config.staging_root);

        let scan = checkpoints.scan()?;
        if !scan.interrupted.is_empty() {
            warn!(
                count = scan.interrupted.len(),
                records = ?scan.interrupted,
                "Found interrupted transactions - they will be reprocessed"
            );
        }
        if scan.unreadable > 0 {
            warn!(count = scan.unreadable, "Ignored unreadable checkpoint files");
        }
        info!(
            completed = scan.completed.len(),
            concurrency = config.concurrency,
            "Coordinator initialized"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            processors,
            checkpoints,
            staging,
            completed: scan.completed.into_iter().collect(),
            fingerprints: scan.fingerprints.into_iter().collect(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            drift_warnings: AtomicUsize::new(0),
        })
    }

    pub fn is_completed(&self, record_id: &str) -> bool {
        self.completed.contains(record_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Publish one record through all three streams.
    pub async fn execute_transaction(
        &self,
        descriptor: &RecordDescriptor,
        source: &dyn ContentSource,
    ) -> Outcome {
        self.execute(descriptor, source, Stage::Full).await
    }

    /// Run the record up to a persisted `Prepared` checkpoint, then stop as if
    /// the process had died before commit.
    pub async fn prepare_only(
        &self,
        descriptor: &RecordDescriptor,
        source: &dyn ContentSource,
    ) -> Outcome {
        self.execute(descriptor, source, Stage::PrepareOnly).await
    }

    async fn execute(
        &self,
        descriptor: &RecordDescriptor,
        source: &dyn ContentSource,
        stage: Stage,
    ) -> Outcome {
        let record_id = descriptor.id.as_str();

        if self.is_completed(record_id) {
            debug!(record_id = %record_id, "Already completed, skipping");
            return Outcome::Skip(SkipReason::AlreadyCompleted);
        }

        let content = match source.fetch_content(descriptor).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!(record_id = %record_id, "No content locator, skipping");
                return Outcome::Skip(SkipReason::MissingContentUrl);
            }
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Content unavailable, skipping");
                return Outcome::Skip(SkipReason::ContentUnavailable);
            }
        };
        if content.trim().is_empty() {
            warn!(record_id = %record_id, "Empty content, skipping");
            return Outcome::Skip(SkipReason::EmptyContent);
        }

        let fingerprint = content_fingerprint(&content);
        let prior = self
            .fingerprints
            .get(record_id)
            .map(|f| f.value().clone())
            .or_else(|| descriptor.content_hash.clone());
        if has_drifted(prior.as_deref(), &fingerprint) {
            warn!(
                record_id = %record_id,
                previous = prior.as_deref().unwrap_or_default(),
                current = %fingerprint,
                "Content changed since last seen"
            );
            self.drift_warnings.fetch_add(1, Ordering::Relaxed);
        }
        self.fingerprints
            .insert(record_id.to_string(), fingerprint.clone());

        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let mut tx = IngestionTransaction::new(
            record_id,
            &descriptor.title,
            self.staging.slot(record_id),
            self.options(),
        );
        tx.state_mut().content_hash = Some(fingerprint);
        let metadata = descriptor.metadata();

        match tx.prepare(&self.processors, &metadata, &content).await {
            Ok(true) => {}
            Ok(false) => {
                self.persist(&tx).await;
                return Outcome::Failure;
            }
            Err(e) => return self.abort(&mut tx, e).await,
        }
        self.persist(&tx).await;

        if stage == Stage::PrepareOnly {
            info!(record_id = %record_id, "Stopping after prepare");
            return Outcome::Success;
        }

        match tx.commit(&self.processors).await {
            Ok(true) => {
                self.completed.insert(record_id.to_string());
                self.persist(&tx).await;
                info!(record_id = %record_id, "Record published");
                Outcome::Success
            }
            Ok(false) => {
                self.persist(&tx).await;
                Outcome::Failure
            }
            Err(e) => self.abort(&mut tx, e).await,
        }
    }

    /// A transaction returned an invariant error: checkpoint what we have.
    async fn abort(&self, tx: &mut IngestionTransaction, e: TristreamError) -> Outcome {
        error!(record_id = %tx.state().record_id, phase = %tx.phase(), error = %e, "Transaction aborted");
        tx.state_mut().error = Some(e.to_string());
        self.persist(tx).await;
        Outcome::Failure
    }

    async fn persist(&self, tx: &IngestionTransaction) {
        if let Err(e) = self.checkpoints.save(&tx.state().to_checkpoint()).await {
            warn!(record_id = %tx.state().record_id, error = %e, "Failed to save checkpoint");
        }
    }

    fn options(&self) -> TransactionOptions {
        TransactionOptions {
            stream_timeout: self.config.stream_timeout(),
            commit_attempts: self.config.commit_attempts,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Run a batch with at most `concurrency` transactions in flight.
    pub async fn run(
        self: Arc<Self>,
        descriptors: Vec<RecordDescriptor>,
        source: Arc<dyn ContentSource>,
    ) -> RunSummary {
        let start = Instant::now();
        let total = descriptors.len();
        self.peak_in_flight.store(0, Ordering::Relaxed);
        let drift_before = self.drift_warnings.load(Ordering::Relaxed);

        info!(
            total_records = total,
            concurrency = self.config.concurrency,
            "Starting ingestion run"
        );

        let pb = self.progress_bar(total);
        let mut summary = RunSummary::default();
        let mut seen = HashSet::with_capacity(total);
        let mut handles = Vec::with_capacity(total);

        for descriptor in descriptors {
            if !seen.insert(descriptor.id.clone()) {
                warn!(record_id = %descriptor.id, "Duplicate record in batch, skipping");
                summary.record(Outcome::Skip(SkipReason::DuplicateInBatch));
                pb.inc(1);
                continue;
            }

            let coordinator = Arc::clone(&self);
            let source = Arc::clone(&source);
            let pb = pb.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match coordinator.semaphore.clone().acquire_owned().await {
                    Ok(_permit) => {
                        coordinator
                            .execute_transaction(&descriptor, source.as_ref())
                            .await
                    }
                    Err(_) => {
                        error!(record_id = %descriptor.id, "Semaphore closed");
                        Outcome::Failure
                    }
                };
                pb.inc(1);
                (descriptor.id, outcome)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((record_id, outcome)) => {
                    debug!(record_id = %record_id, outcome = ?outcome, "Record finished");
                    summary.record(outcome);
                }
                Err(e) => {
                    warn!(error = %e, "Task panicked");
                    summary.record(Outcome::Failure);
                }
            }
        }
        pb.finish_with_message("done");

        summary.peak_in_flight = self.peak_in_flight.load(Ordering::Relaxed);
        summary.drift_warnings = self.drift_warnings.load(Ordering::Relaxed) - drift_before;
        summary.runtime_secs = start.elapsed().as_secs_f64();

        info!(
            total = summary.total,
            success = summary.success,
            skip = summary.skip,
            failure = summary.failure,
            peak_in_flight = summary.peak_in_flight,
            drift_warnings = summary.drift_warnings,
            runtime_secs = %format!("{:.1}", summary.runtime_secs),
            "Ingestion run complete"
        );
        summary
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

/// Counts a transaction as in flight until dropped.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}
