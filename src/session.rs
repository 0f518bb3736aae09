//! Owns one transfer end to end: drives the chunk bitmap through its
//! states, spawns worker tasks that drain a chunk queue, writes completed
//! chunks to their destination as soon as they arrive, emits progress, and
//! reports a terminal outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bandwidth::BandwidthAllocator;
use crate::chunk;
use crate::classifier::{Category, ErrorClassifier, FailureCause, RetryDecision, Severity};
use crate::events::{CompletionOutcome, EventSink, TransferEvent};
use crate::resume::{ResumeState, ResumeStore};
use crate::transport::{ChunkTransport, FileHandle};
use crate::types::{ChunkIndex, ChunkState, Direction, Priority, TransferId, TransferRequest, TransferStatus};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TransferStatus, to: TransferStatus },

    #[error("session failed: category={category:?} severity={severity:?} cause={cause}")]
    Failed {
        category: Category,
        severity: Severity,
        cause: String,
    },

    #[error("session was cancelled")]
    Cancelled,

    #[error("missing chunk index {0} at completion time")]
    MissingChunkAtCompletion(ChunkIndex),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One unit of work a worker pulls from the session-local queue.
#[derive(Debug, Clone)]
pub struct ChunkWorkItem {
    pub index: ChunkIndex,
    pub offset: u64,
    pub size: u64,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Default)]
struct Statistics {
    total_bytes: u64,
    start_time: Option<Instant>,
    per_chunk_history: VecDeque<(u64, Duration)>,
    speed_samples: VecDeque<(Instant, f64)>,
    last_progress_emit: Option<Instant>,
}

const PER_CHUNK_HISTORY_CAP: usize = 256;
const SPEED_SAMPLE_WINDOW: Duration = Duration::from_secs(30);
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

impl Statistics {
    fn record_chunk(&mut self, bytes: u64, duration: Duration) {
        self.total_bytes += bytes;
        self.per_chunk_history.push_back((bytes, duration));
        if self.per_chunk_history.len() > PER_CHUNK_HISTORY_CAP {
            self.per_chunk_history.pop_front();
        }
        let now = Instant::now();
        let speed = if duration.as_secs_f64() > 0.0 {
            bytes as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        self.speed_samples.push_back((now, speed));
        while let Some((t, _)) = self.speed_samples.front() {
            if now.duration_since(*t) > SPEED_SAMPLE_WINDOW {
                self.speed_samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn current_speed(&self) -> f64 {
        if self.speed_samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.speed_samples.iter().map(|(_, s)| s).sum();
        sum / self.speed_samples.len() as f64
    }

    fn average_speed(&self) -> f64 {
        match self.start_time {
            Some(start) => {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.total_bytes as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn eta_seconds(&self, remaining_bytes: u64) -> Option<f64> {
        let speed = self.current_speed();
        if speed > 0.0 {
            Some(remaining_bytes as f64 / speed)
        } else {
            None
        }
    }

    fn should_emit_progress(&mut self) -> bool {
        let now = Instant::now();
        match self.last_progress_emit {
            Some(last) if now.duration_since(last) < PROGRESS_EMIT_INTERVAL => false,
            _ => {
                self.last_progress_emit = Some(now);
                true
            }
        }
    }
}

/// Collaborators a session needs to do real work; bundled so constructing a
/// session doesn't take a dozen positional arguments.
pub struct SessionDeps {
    pub transport: Arc<dyn ChunkTransport>,
    pub file: Arc<dyn FileHandle>,
    pub resume_store: Arc<ResumeStore>,
    pub bandwidth: Arc<BandwidthAllocator>,
    pub events: Arc<EventSink>,
    pub classifier: Arc<Mutex<ErrorClassifier>>,
    pub engine_semaphore: Arc<Semaphore>,
    pub root_cancellation: CancellationToken,
}

pub struct SessionSettings {
    pub worker_thread_count: usize,
    pub max_retry_attempts: u32,
    pub max_retry_delay: Duration,
    pub checkpoint_every_chunks: u64,
    pub checkpoint_every: Duration,
    pub reservoir_gap_threshold: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            worker_thread_count: 4,
            max_retry_attempts: 5,
            max_retry_delay: Duration::from_secs(300),
            checkpoint_every_chunks: 16,
            checkpoint_every: Duration::from_secs(5),
            reservoir_gap_threshold: 64,
        }
    }
}

/// Running state of one transfer; created by the Scheduler, mutated only by
/// its own worker tasks and driving loop.
pub struct TransferSession {
    pub transfer_id: TransferId,
    pub request: TransferRequest,
    pub chunk_size: u64,
    pub total_chunks: u64,
    status: RwLock<TransferStatus>,
    chunk_states: RwLock<HashMap<ChunkIndex, ChunkState>>,
    chunk_checksums: RwLock<HashMap<ChunkIndex, String>>,
    completed: AtomicU64,
    failed: AtomicU64,
    statistics: Mutex<Statistics>,
    queue: Mutex<VecDeque<ChunkWorkItem>>,
    /// Count of retries currently sleeping out their backoff delay in a
    /// detached task, not yet back on `queue`. A worker finding the queue
    /// empty must not exit while this is nonzero, or the retry's chunk is
    /// pushed onto a queue nobody is left to drain.
    pending_retries: AtomicU64,
    retry_notify: tokio::sync::Notify,
    watermark: AtomicU64,
    cancellation: CancellationToken,
    deps: SessionDeps,
    settings: SessionSettings,
    start_time: RwLock<Option<SystemTime>>,
    last_checkpoint: Mutex<Instant>,
}

impl TransferSession {
    pub fn new(
        request: TransferRequest,
        chunk_size: u64,
        deps: SessionDeps,
        settings: SessionSettings,
        resume: Option<ResumeState>,
    ) -> Arc<Self> {
        let total_chunks = chunk::total_chunks(request.total_size, chunk_size);
        let chunk_states: HashMap<ChunkIndex, ChunkState> = match &resume {
            Some(state) => state.chunk_states.clone(),
            None => (0..total_chunks).map(|i| (i, ChunkState::Pending)).collect(),
        };
        let chunk_checksums: HashMap<ChunkIndex, String> = match &resume {
            Some(state) => state.chunk_checksums.clone(),
            None => HashMap::new(),
        };
        let completed = chunk_states.values().filter(|s| **s == ChunkState::Completed).count() as u64;
        let queue: VecDeque<ChunkWorkItem> = chunk_states
            .iter()
            .filter(|(_, s)| **s != ChunkState::Completed)
            .map(|(index, _)| {
                let (offset, size) = chunk::chunk_geometry(*index, request.total_size, chunk_size)
                    .unwrap_or((*index * chunk_size, chunk_size));
                ChunkWorkItem {
                    index: *index,
                    offset,
                    size,
                    attempts: 0,
                    max_attempts: settings.max_retry_attempts,
                }
            })
            .collect();
        let cancellation = deps.root_cancellation.child_token();

        Arc::new(Self {
            transfer_id: request.transfer_id,
            request,
            chunk_size,
            total_chunks,
            status: RwLock::new(TransferStatus::Initializing),
            chunk_states: RwLock::new(chunk_states),
            chunk_checksums: RwLock::new(chunk_checksums),
            completed: AtomicU64::new(completed),
            failed: AtomicU64::new(0),
            statistics: Mutex::new(Statistics::default()),
            queue: Mutex::new(queue),
            pending_retries: AtomicU64::new(0),
            retry_notify: tokio::sync::Notify::new(),
            watermark: AtomicU64::new(0),
            cancellation,
            deps,
            settings,
            start_time: RwLock::new(None),
            last_checkpoint: Mutex::new(Instant::now()),
        })
    }

    pub async fn status(&self) -> TransferStatus {
        *self.status.read().await
    }

    async fn transition(&self, next: TransferStatus) -> Result<()> {
        let mut status = self.status.write().await;
        if !status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from: *status, to: next });
        }
        log::info!("transfer {} transitioning {:?} -> {:?}", self.transfer_id, *status, next);
        *status = next;
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub async fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(TransferStatus::Paused).await
    }

    pub async fn resume_from_pause(&self) -> Result<()> {
        self.transition(TransferStatus::Active).await
    }

    /// Bitmap closure invariant: completed + failed + pending + in-progress
    /// == total_chunks always holds by construction since every chunk state
    /// is exactly one of the four, one entry per index.
    pub async fn counts(&self) -> (u64, u64, u64, u64) {
        let states = self.chunk_states.read().await;
        let mut pending = 0u64;
        let mut in_progress = 0u64;
        for state in states.values() {
            match state {
                ChunkState::Pending | ChunkState::Retrying => pending += 1,
                ChunkState::InProgress => in_progress += 1,
                _ => {}
            }
        }
        (
            self.completed.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
            pending,
            in_progress,
        )
    }

    fn operation_id(&self, chunk_index: ChunkIndex) -> String {
        format!("{}:{}", self.transfer_id, chunk_index)
    }

    /// Runs the session to completion: starts up to
    /// `min(worker_thread_count, total_chunks)` workers, awaits them all,
    /// and returns the terminal outcome.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.transition(TransferStatus::Active).await?;
        *self.start_time.write().await = Some(SystemTime::now());
        self.statistics.lock().await.start_time = Some(Instant::now());
        self.deps.events.emit(TransferEvent::TransferStarted {
            transfer_id: self.transfer_id,
        });

        if self.total_chunks == 0 {
            return self.complete().await;
        }

        let worker_count = self.settings.worker_thread_count.min(self.total_chunks as usize).max(1);
        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                let session = Arc::clone(self);
                tokio::spawn(async move { session.worker_loop().await })
            })
            .collect();
        join_all(handles).await;

        if self.cancellation.is_cancelled() {
            self.transition(TransferStatus::Cancelled).await.ok();
            self.deps.events.emit(TransferEvent::TransferCompleted {
                transfer_id: self.transfer_id,
                outcome: CompletionOutcome::Cancelled {
                    reason: "cancellation token signalled".into(),
                },
            });
            return Err(SessionError::Cancelled);
        }

        self.complete().await
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }

            let item = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let item = match item {
                Some(item) => item,
                None => {
                    if self.pending_retries.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                    // A delayed retry is still sleeping out its backoff and
                    // will push its chunk back onto the queue; stick around
                    // instead of exiting out from under it.
                    tokio::select! {
                        _ = self.retry_notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = self.cancellation.cancelled() => return,
                    }
                    continue;
                }
            };

            let permit = tokio::select! {
                permit = self.deps.engine_semaphore.clone().acquire_owned() => permit,
                _ = self.cancellation.cancelled() => return,
            };
            let Ok(_permit) = permit else { return };

            self.process_chunk(item).await;
        }
    }

    async fn process_chunk(self: &Arc<Self>, mut item: ChunkWorkItem) {
        self.chunk_states
            .write()
            .await
            .insert(item.index, ChunkState::InProgress);

        let grant = match self.deps.bandwidth.request(self.transfer_id, item.size).await {
            Ok(grant) => grant,
            Err(e) => {
                log::warn!("bandwidth request failed for {}: {e}", self.transfer_id);
                self.retry_or_fail(item, FailureCause::new(e.to_string())).await;
                return;
            }
        };
        if grant.throttle_delay > Duration::ZERO {
            self.deps.events.emit(TransferEvent::BandwidthThrottled {
                transfer_id: self.transfer_id,
                delay: grant.throttle_delay,
            });
            tokio::time::sleep(grant.throttle_delay).await;
        }

        let started = Instant::now();
        let outcome = match self.request.direction {
            Direction::Upload => self.upload_chunk(&item).await,
            Direction::Download => self.download_chunk(&item).await,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(hash) => {
                self.chunk_states
                    .write()
                    .await
                    .insert(item.index, ChunkState::Completed);
                self.chunk_checksums.write().await.insert(item.index, hash.clone());
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.advance_watermark(item.index).await;

                {
                    let mut stats = self.statistics.lock().await;
                    stats.record_chunk(item.size, elapsed);
                }

                self.deps.events.emit(TransferEvent::ChunkTransferred {
                    transfer_id: self.transfer_id,
                    chunk_index: item.index,
                    success: true,
                    duration: elapsed,
                });

                self.maybe_checkpoint().await;
                self.maybe_emit_progress().await;
            }
            Err(cause) => {
                self.deps.events.emit(TransferEvent::ChunkTransferred {
                    transfer_id: self.transfer_id,
                    chunk_index: item.index,
                    success: false,
                    duration: elapsed,
                });
                item.attempts += 1;
                self.retry_or_fail(item, cause).await;
            }
        }
    }

    async fn upload_chunk(&self, item: &ChunkWorkItem) -> std::result::Result<String, FailureCause> {
        let bytes = self
            .deps
            .file
            .read_at(item.offset, item.size)
            .await
            .map_err(|e| FailureCause::new(e.to_string()))?;
        let hash = chunk::hash(&bytes);
        let ack = self
            .deps
            .transport
            .put_chunk(self.transfer_id, item.index, bytes)
            .await
            .map_err(|e| FailureCause::new(e.to_string()))?;
        if !ack.ok {
            return Err(FailureCause::new(ack.error.unwrap_or_else(|| "peer rejected chunk".into())));
        }
        Ok(hash)
    }

    async fn download_chunk(&self, item: &ChunkWorkItem) -> std::result::Result<String, FailureCause> {
        let bytes = self
            .deps
            .transport
            .get_chunk(self.transfer_id, item.index, item.offset, item.size)
            .await
            .map_err(|e| FailureCause::new(e.to_string()))?;
        let hash = chunk::hash(&bytes);
        // Incremental in-order write: each worker writes its own chunk
        // directly at its destination offset as soon as it arrives, rather
        // than buffering until a contiguous run exists. Memory use is
        // bounded by the number of in-flight workers, not by file size.
        self.deps
            .file
            .write_at(item.offset, &bytes)
            .await
            .map_err(|e| FailureCause::new(e.to_string()))?;
        Ok(hash)
    }

    /// Advances the contiguous-prefix watermark used only to gate the
    /// reservoir threshold and the final flush check, per the bounded
    /// in-flight-chunk design.
    async fn advance_watermark(&self, completed_index: ChunkIndex) {
        let mut watermark = self.watermark.load(Ordering::SeqCst);
        if completed_index == watermark {
            let states = self.chunk_states.read().await;
            while states.get(&watermark) == Some(&ChunkState::Completed) {
                watermark += 1;
                if watermark >= self.total_chunks {
                    break;
                }
            }
            self.watermark.store(watermark, Ordering::SeqCst);
        }
    }

    async fn retry_or_fail(self: &Arc<Self>, mut item: ChunkWorkItem, cause: FailureCause) {
        let operation_id = self.operation_id(item.index);
        let (_, classification) = {
            let mut classifier = self.deps.classifier.lock().await;
            classifier.classify_for(
                &operation_id,
                cause,
                self.settings.max_retry_attempts,
                self.settings.max_retry_delay,
            )
        };

        if classification.severity == Severity::Critical {
            log::error!(
                "transfer {} hit a Critical failure on chunk {}: cancelling session",
                self.transfer_id,
                item.index
            );
            self.cancellation.cancel();
            self.chunk_states.write().await.insert(item.index, ChunkState::Failed);
            self.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }

        match classification.decision {
            RetryDecision::Retry { delay } if item.attempts < item.max_attempts => {
                self.chunk_states.write().await.insert(item.index, ChunkState::Retrying);
                self.pending_retries.fetch_add(1, Ordering::SeqCst);
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            session.queue.lock().await.push_back(item);
                        }
                        _ = session.cancellation.cancelled() => {}
                    }
                    session.pending_retries.fetch_sub(1, Ordering::SeqCst);
                    session.retry_notify.notify_waiters();
                });
            }
            _ => {
                self.chunk_states.write().await.insert(item.index, ChunkState::Failed);
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Checkpoints when either the chunk-count cadence or the time cadence
    /// has elapsed, per the Resume Store's checkpoint policy. Every call
    /// that does checkpoint persists the full accumulated checksum map, not
    /// just the chunk that just completed, so every `Completed` chunk in
    /// the written record has a matching checksum.
    async fn maybe_checkpoint(&self) {
        let completed = self.completed.load(Ordering::SeqCst);
        let count_due = completed % self.settings.checkpoint_every_chunks == 0;
        let time_due = {
            let last = self.last_checkpoint.lock().await;
            last.elapsed() >= self.settings.checkpoint_every
        };
        if !count_due && !time_due {
            return;
        }

        let chunk_states = self.chunk_states.read().await.clone();
        let chunk_checksums = self.chunk_checksums.read().await.clone();
        let mut state = ResumeState::new(
            self.transfer_id,
            self.request.file_name.clone(),
            self.request.total_size,
            self.chunk_size,
            self.request.direction,
            self.request.remote_endpoint.clone(),
            self.request.local_path.clone(),
        );
        state.chunk_states = chunk_states;
        state.chunk_checksums = chunk_checksums;
        state.completed_chunks = completed;
        if let Err(e) = self.deps.resume_store.checkpoint(&state).await {
            log::warn!("checkpoint failed for {}: {e}", self.transfer_id);
        }
        *self.last_checkpoint.lock().await = Instant::now();
    }

    async fn maybe_emit_progress(&self) {
        let mut stats = self.statistics.lock().await;
        if !stats.should_emit_progress() {
            return;
        }
        let bytes_transferred = stats.total_bytes;
        let total_bytes = self.request.total_size;
        let remaining = total_bytes.saturating_sub(bytes_transferred);
        let event = TransferEvent::TransferProgress {
            transfer_id: self.transfer_id,
            bytes_transferred,
            total_bytes,
            current_speed: stats.current_speed(),
            eta_seconds: stats.eta_seconds(remaining),
        };
        drop(stats);
        self.deps.events.emit(event);
    }

    async fn complete(self: &Arc<Self>) -> Result<()> {
        self.transition(TransferStatus::Completing).await?;
        let (completed, failed, _, _) = self.counts().await;

        if failed > 0 {
            self.transition(TransferStatus::Failed).await.ok();
            self.deps.events.emit(TransferEvent::TransferCompleted {
                transfer_id: self.transfer_id,
                outcome: CompletionOutcome::Failed {
                    category: Category::Unknown,
                    severity: Severity::Medium,
                    last_cause: format!("{failed} chunk(s) failed"),
                },
            });
            return Err(SessionError::Failed {
                category: Category::Unknown,
                severity: Severity::Medium,
                cause: format!("{failed} chunk(s) failed"),
            });
        }

        if completed != self.total_chunks {
            let missing = {
                let states = self.chunk_states.read().await;
                (0..self.total_chunks).find(|i| states.get(i) != Some(&ChunkState::Completed))
            };
            if let Some(index) = missing {
                self.transition(TransferStatus::Failed).await.ok();
                return Err(SessionError::MissingChunkAtCompletion(index));
            }
        }

        if matches!(self.request.direction, Direction::Download) {
            let _ = self.deps.file.flush().await;
        }

        if let Err(e) = self.deps.resume_store.delete(self.transfer_id).await {
            log::warn!("failed to delete resume state for {}: {e}", self.transfer_id);
        }

        self.transition(TransferStatus::Completed).await.ok();
        self.deps.events.emit(TransferEvent::TransferCompleted {
            transfer_id: self.transfer_id,
            outcome: CompletionOutcome::Success,
        });
        Ok(())
    }
}

/// Picks a chunk size for a new session from the file's total size and a
/// configured base size, per the Transfer Session Engine's policy.
pub fn pick_chunk_size(total_size: u64, base_size: u64) -> u64 {
    crate::types::default_chunk_size(total_size, base_size)
}

/// Maps a request priority into the allocator's clamp so Critical-priority
/// transfers (e.g. an urgent control-plane file) can be pinned to at least
/// a minimum throughput.
pub fn default_clamp_for(priority: Priority) -> crate::bandwidth::AllocationClamp {
    match priority {
        Priority::Critical => crate::bandwidth::AllocationClamp {
            min_bytes_per_sec: Some(64 * 1024),
            max_bytes_per_sec: None,
        },
        _ => crate::bandwidth::AllocationClamp::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConstantNetworkMonitor, NetworkCondition};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct InMemoryTransport {
        source: Vec<u8>,
    }

    #[async_trait]
    impl ChunkTransport for InMemoryTransport {
        async fn put_chunk(&self, transfer_id: TransferId, chunk_index: ChunkIndex, _bytes: Vec<u8>) -> crate::transport::Result<crate::transport::ChunkAck> {
            Ok(crate::transport::ChunkAck { transfer_id, chunk_index, ok: true, error: None })
        }

        async fn get_chunk(&self, _transfer_id: TransferId, _chunk_index: ChunkIndex, offset: u64, length: u64) -> crate::transport::Result<Vec<u8>> {
            let end = (offset + length).min(self.source.len() as u64) as usize;
            Ok(self.source[offset as usize..end].to_vec())
        }
    }

    struct TestFile {
        bytes: StdMutex<Vec<u8>>,
    }

    impl TestFile {
        fn new(size: usize) -> Self {
            Self { bytes: StdMutex::new(vec![0u8; size]) }
        }
    }

    #[async_trait]
    impl FileHandle for TestFile {
        async fn read_at(&self, offset: u64, length: u64) -> crate::transport::Result<Vec<u8>> {
            let bytes = self.bytes.lock().unwrap();
            let end = (offset + length).min(bytes.len() as u64) as usize;
            Ok(bytes[offset as usize..end].to_vec())
        }

        async fn write_at(&self, offset: u64, data: &[u8]) -> crate::transport::Result<()> {
            let mut bytes = self.bytes.lock().unwrap();
            let end = offset as usize + data.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        async fn flush(&self) -> crate::transport::Result<()> {
            Ok(())
        }

        async fn length(&self) -> crate::transport::Result<u64> {
            Ok(self.bytes.lock().unwrap().len() as u64)
        }
    }

    fn make_deps(dir: &std::path::Path, transport: Arc<dyn ChunkTransport>, file: Arc<dyn FileHandle>) -> SessionDeps {
        let monitor = Arc::new(ConstantNetworkMonitor::new(NetworkCondition::Excellent));
        SessionDeps {
            transport,
            file,
            resume_store: Arc::new(ResumeStore::new(dir, Duration::from_secs(3600))),
            bandwidth: Arc::new(BandwidthAllocator::new(10_000_000, 1024, Duration::from_secs(5), monitor)),
            events: Arc::new(EventSink::default()),
            classifier: Arc::new(Mutex::new(ErrorClassifier::new())),
            engine_semaphore: Arc::new(Semaphore::new(4)),
            root_cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn download_completes_and_byte_conservation_holds() {
        let dir = tempdir().unwrap();
        let source: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let transport = Arc::new(InMemoryTransport { source: source.clone() });
        let file = Arc::new(TestFile::new(0));
        let deps = make_deps(dir.path(), transport, file.clone());
        let bandwidth = Arc::clone(&deps.bandwidth);
        let transfer_id = uuid::Uuid::new_v4();
        bandwidth.register(transfer_id, Priority::Normal, default_clamp_for(Priority::Normal)).await;

        let mut request = TransferRequest::new(
            Direction::Download,
            "data.bin",
            source.len() as u64,
            dir.path().join("data.bin").to_string_lossy().into_owned(),
            "peer-1",
        );
        request.transfer_id = transfer_id;

        let session = TransferSession::new(request, 65_536, deps, SessionSettings::default(), None);
        session.run().await.unwrap();

        let (completed, failed, pending, in_progress) = session.counts().await;
        assert_eq!(completed, 16);
        assert_eq!(failed, 0);
        assert_eq!(pending, 0);
        assert_eq!(in_progress, 0);

        let written = file.bytes.lock().unwrap().clone();
        assert_eq!(written.len(), source.len());
        assert_eq!(chunk::hash(&written), chunk::hash(&source));
    }

    #[tokio::test]
    async fn bitmap_closure_holds_before_completion() {
        let dir = tempdir().unwrap();
        let source = vec![1u8; 200_000];
        let transport = Arc::new(InMemoryTransport { source: source.clone() });
        let file = Arc::new(TestFile::new(0));
        let deps = make_deps(dir.path(), transport, file);
        deps.bandwidth
            .register(uuid::Uuid::new_v4(), Priority::Normal, default_clamp_for(Priority::Normal))
            .await;

        let request = TransferRequest::new(Direction::Download, "x.bin", source.len() as u64, "x.bin", "peer-1");
        let session = TransferSession::new(request, 65_536, deps, SessionSettings::default(), None);

        let (completed, failed, pending, in_progress) = session.counts().await;
        assert_eq!(completed + failed + pending + in_progress, session.total_chunks);
    }
}
