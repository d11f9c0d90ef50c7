//! Recording stream processors with fault injection, for tests.

use crate::models::{RecordMetadata, Result, StagedPayload, StreamName, TristreamError};
use crate::stream::{ProcessorSet, StreamProcessor};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Prepare,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub stream: StreamName,
    pub op: Op,
    pub record_id: String,
}

/// Call log shared by the processors of one set, in call order.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn record(&self, stream: StreamName, op: Op, record_id: &str) {
        self.0.lock().unwrap().push(Event {
            stream,
            op,
            record_id: record_id.to_string(),
        });
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Streams that saw `op` for a record, in call order.
    pub fn ops_for(&self, record_id: &str, op: Op) -> Vec<StreamName> {
        self.events()
            .into_iter()
            .filter(|e| e.record_id == record_id && e.op == op)
            .map(|e| e.stream)
            .collect()
    }

    /// Total calls of `op` across all records.
    pub fn count(&self, op: Op) -> usize {
        self.events().iter().filter(|e| e.op == op).count()
    }
}

/// Tracks how many records sit between prepare start and commit end.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// In-memory processor whose "production state" is a set of committed ids.
pub struct MockProcessor {
    stream: StreamName,
    log: EventLog,
    fail_prepare: HashSet<String>,
    fail_commit: HashSet<String>,
    commit_failures_left: AtomicU32,
    fail_rollback: bool,
    null_payload: bool,
    delay: Duration,
    commit_delay: Duration,
    probe: Option<Arc<ConcurrencyProbe>>,
    committed: Mutex<HashSet<String>>,
}

impl MockProcessor {
    pub fn new(stream: StreamName, log: EventLog) -> Self {
        Self {
            stream,
            log,
            fail_prepare: HashSet::new(),
            fail_commit: HashSet::new(),
            commit_failures_left: AtomicU32::new(0),
            fail_rollback: false,
            null_payload: false,
            delay: Duration::ZERO,
            commit_delay: Duration::ZERO,
            probe: None,
            committed: Mutex::new(HashSet::new()),
        }
    }

    pub fn stream(&self) -> StreamName {
        self.stream
    }

    pub fn fail_prepare_on(mut self, record_id: &str) -> Self {
        self.fail_prepare.insert(record_id.to_string());
        self
    }

    pub fn fail_commit_on(mut self, record_id: &str) -> Self {
        self.fail_commit.insert(record_id.to_string());
        self
    }

    /// Fail the next `n` commits, whatever the record.
    pub fn fail_commits_times(self, n: u32) -> Self {
        self.commit_failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn return_null_payload(mut self) -> Self {
        self.null_payload = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Extra sleep in commit only.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn is_committed(&self, record_id: &str) -> bool {
        self.committed.lock().unwrap().contains(record_id)
    }

    pub fn committed_count(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl StreamProcessor for MockProcessor {
    async fn prepare(
        &self,
        metadata: &RecordMetadata,
        _content: &str,
        staging_dir: &Path,
    ) -> Result<serde_json::Value> {
        self.log.record(self.stream, Op::Prepare, &metadata.id);
        if let Some(probe) = &self.probe {
            probe.enter();
        }
        self.pause().await;

        if self.fail_prepare.contains(&metadata.id) {
            if let Some(probe) = &self.probe {
                probe.exit();
            }
            return Err(TristreamError::stream(self.stream, "injected prepare failure"));
        }
        if self.null_payload {
            return Ok(serde_json::Value::Null);
        }

        let marker = staging_dir.join("staged.txt");
        tokio::fs::write(&marker, metadata.id.as_bytes())
            .await
            .map_err(|e| TristreamError::io("writing mock staging file", e))?;

        Ok(serde_json::json!({
            "record_id": metadata.id,
            "stream": self.stream,
        }))
    }

    async fn commit(&self, payload: &StagedPayload) -> Result<()> {
        self.log.record(self.stream, Op::Commit, &payload.record_id);
        self.pause().await;
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        let result = if self.fail_commit.contains(&payload.record_id) {
            Err(TristreamError::stream(self.stream, "injected commit failure"))
        } else if self
            .commit_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(TristreamError::stream(self.stream, "transient commit failure"))
        } else {
            self.committed
                .lock()
                .unwrap()
                .insert(payload.record_id.clone());
            Ok(())
        };

        if let Some(probe) = &self.probe {
            if result.is_ok() {
                probe.exit();
            }
        }
        result
    }

    async fn rollback(&self, payload: &StagedPayload) -> Result<()> {
        self.log.record(self.stream, Op::Rollback, &payload.record_id);
        if self.fail_rollback {
            return Err(TristreamError::stream(self.stream, "injected rollback failure"));
        }
        self.committed.lock().unwrap().remove(&payload.record_id);
        Ok(())
    }
}

/// The three mocks of one test, sharing an event log.
pub struct MockSet {
    semantic: Arc<MockProcessor>,
    vector: Arc<MockProcessor>,
    document: Arc<MockProcessor>,
}

impl MockSet {
    pub fn get(&self, stream: StreamName) -> &Arc<MockProcessor> {
        match stream {
            StreamName::Semantic => &self.semantic,
            StreamName::Vector => &self.vector,
            StreamName::Document => &self.document,
        }
    }

    pub fn set(&self) -> ProcessorSet {
        ProcessorSet::new(
            self.semantic.clone(),
            self.vector.clone(),
            self.document.clone(),
        )
    }
}

/// Build three mocks, letting `configure` inject faults per stream.
pub fn mock_set<F>(configure: F) -> (EventLog, MockSet)
where
    F: Fn(MockProcessor) -> MockProcessor,
{
    let log = EventLog::default();
    let build = |stream| Arc::new(configure(MockProcessor::new(stream, log.clone())));
    let set = MockSet {
        semantic: build(StreamName::Semantic),
        vector: build(StreamName::Vector),
        document: build(StreamName::Document),
    };
    (log, set)
}
