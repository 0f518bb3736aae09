//! One durable JSON record per transfer id, holding the chunk bitmap and
//! per-chunk checksums needed to reconstruct a session after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::chunk;
use crate::types::{ChunkIndex, ChunkState, Direction, TransferId};

pub type Result<T> = std::result::Result<T, ResumeError>;

#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("no resume record found for transfer {0}")]
    ResumeNotFound(TransferId),

    #[error("resume blocked: {0}")]
    ResumeBlocked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The on-disk shape of one resume record, matching the external resume
/// file format exactly so readers written against this type round-trip
/// unknown fields transparently via `serde_json::Value` pass-through would
/// require a different representation; this crate is the sole writer, so
/// round-trip fidelity is guaranteed by keeping the struct exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(rename = "transfer-id")]
    pub transfer_id: TransferId,
    #[serde(rename = "file-name")]
    pub file_name: String,
    #[serde(rename = "file-size")]
    pub file_size: u64,
    #[serde(rename = "chunk-size")]
    pub chunk_size: u64,
    #[serde(rename = "total-chunks")]
    pub total_chunks: u64,
    #[serde(rename = "completed-chunks")]
    pub completed_chunks: u64,
    pub direction: Direction,
    #[serde(rename = "remote-endpoint")]
    pub remote_endpoint: String,
    #[serde(rename = "local-path")]
    pub local_path: String,
    #[serde(rename = "last-saved")]
    pub last_saved: DateTime<Utc>,
    #[serde(rename = "chunk-states")]
    pub chunk_states: HashMap<ChunkIndex, ChunkState>,
    #[serde(rename = "chunk-checksums")]
    pub chunk_checksums: HashMap<ChunkIndex, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ResumeState {
    pub fn new(
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        direction: Direction,
        remote_endpoint: String,
        local_path: String,
    ) -> Self {
        let total = chunk::total_chunks(file_size, chunk_size);
        Self {
            transfer_id,
            file_name,
            file_size,
            chunk_size,
            total_chunks: total,
            completed_chunks: 0,
            direction,
            remote_endpoint,
            local_path,
            last_saved: Utc::now(),
            chunk_states: (0..total).map(|i| (i, ChunkState::Pending)).collect(),
            chunk_checksums: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn mark_completed(&mut self, index: ChunkIndex, checksum: String) {
        if self.chunk_states.get(&index) != Some(&ChunkState::Completed) {
            self.completed_chunks += 1;
        }
        self.chunk_states.insert(index, ChunkState::Completed);
        self.chunk_checksums.insert(index, checksum);
    }

    pub fn demote_to_failed(&mut self, index: ChunkIndex) {
        if self.chunk_states.get(&index) == Some(&ChunkState::Completed) {
            self.completed_chunks = self.completed_chunks.saturating_sub(1);
        }
        self.chunk_states.insert(index, ChunkState::Failed);
        self.chunk_checksums.remove(&index);
    }
}

/// The outcome of resuming a session: which chunks survived, which were
/// recovered (re-fetched after corruption), and where to continue from.
#[derive(Debug, Clone)]
pub struct ResumeSummary {
    pub resumed_from_chunk: ChunkIndex,
    pub remaining_chunks: Vec<ChunkIndex>,
    pub recovered_chunks: Vec<ChunkIndex>,
}

/// One durable record of a resumable transfer, as reported by
/// `list_resumable`.
#[derive(Debug, Clone)]
pub struct ResumableTransfer {
    pub transfer_id: TransferId,
    pub can_resume: bool,
    pub reason: Option<String>,
}

pub struct ResumeStore {
    directory: PathBuf,
    /// A per-transfer lock serializing writes; reads are copy-out from the
    /// loaded JSON, so no lock is held across file I/O beyond the write
    /// itself.
    locks: Mutex<HashMap<TransferId, Arc<Mutex<()>>>>,
    max_age: std::time::Duration,
}

impl ResumeStore {
    pub fn new(directory: impl Into<PathBuf>, max_age: std::time::Duration) -> Self {
        Self {
            directory: directory.into(),
            locks: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    async fn lock_for(&self, transfer_id: TransferId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(transfer_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, transfer_id: TransferId) -> PathBuf {
        self.directory.join(format!("{transfer_id}.json"))
    }

    fn tmp_path_for(&self, transfer_id: TransferId) -> PathBuf {
        self.directory.join(format!("{transfer_id}.json.tmp"))
    }

    /// Writes `state` atomically: serialize, write to a `.tmp` sibling,
    /// flush, then rename over the final path.
    pub async fn checkpoint(&self, state: &ResumeState) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let guard = self.lock_for(state.transfer_id).await;
        let _held = guard.lock().await;

        let tmp_path = self.tmp_path_for(state.transfer_id);
        let final_path = self.path_for(state.transfer_id);
        let body = serde_json::to_vec_pretty(state)?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        log::debug!("checkpointed resume state for {}", state.transfer_id);
        Ok(())
    }

    pub async fn load(&self, transfer_id: TransferId) -> Result<ResumeState> {
        let path = self.path_for(transfer_id);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|_| ResumeError::ResumeNotFound(transfer_id))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Deletes the resume record for a transfer that reached terminal
    /// success or was explicitly cancelled.
    pub async fn delete(&self, transfer_id: TransferId) -> Result<()> {
        let path = self.path_for(transfer_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scans the state directory and loads every well-formed record,
    /// ignoring `.tmp` files left behind by an interrupted checkpoint.
    pub async fn scan(&self) -> Result<Vec<ResumeState>> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(body) = tokio::fs::read(&path).await {
                if let Ok(state) = serde_json::from_slice::<ResumeState>(&body) {
                    states.push(state);
                }
            }
        }
        Ok(states)
    }

    /// Reports, for every persisted record, whether it is resumable.
    pub async fn list_resumable(&self) -> Result<Vec<ResumableTransfer>> {
        let states = self.scan().await?;
        let mut results = Vec::with_capacity(states.len());
        for state in states {
            let reason = self.validate(&state).await.err();
            results.push(ResumableTransfer {
                transfer_id: state.transfer_id,
                can_resume: reason.is_none(),
                reason: reason.map(|e| e.to_string()),
            });
        }
        Ok(results)
    }

    async fn validate(&self, state: &ResumeState) -> Result<()> {
        let age = Utc::now().signed_duration_since(state.last_saved);
        if age.to_std().unwrap_or_default() > self.max_age {
            return Err(ResumeError::ResumeBlocked("resume state exceeds MaxResumeAge".into()));
        }
        match state.direction {
            Direction::Upload => {
                let metadata = tokio::fs::metadata(&state.local_path).await;
                match metadata {
                    Ok(meta) if meta.len() == state.file_size => Ok(()),
                    Ok(_) => Err(ResumeError::ResumeBlocked("source file size changed".into())),
                    Err(_) => Err(ResumeError::ResumeBlocked("source file missing".into())),
                }
            }
            Direction::Download => {
                let partial_path = partial_path(&state.local_path);
                if tokio::fs::try_exists(&partial_path).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(ResumeError::ResumeBlocked("partial download file missing".into()))
                }
            }
        }
    }

    /// Runs the full resume algorithm: load, validate, corruption sweep
    /// against the local persisted data, then report the surviving bitmap.
    ///
    /// `read_chunk` reads the chunk's current on-disk bytes for the
    /// corruption sweep; it is supplied by the caller because this store
    /// has no notion of how local data is read (upload: source file,
    /// download: partial file).
    pub async fn resume<F, Fut>(&self, transfer_id: TransferId, read_chunk: F) -> Result<(ResumeState, ResumeSummary)>
    where
        F: Fn(ChunkIndex, u64, u64) -> Fut,
        Fut: std::future::Future<Output = std::io::Result<Vec<u8>>>,
    {
        let mut state = self.load(transfer_id).await?;
        self.validate(&state).await.map_err(|e| match e {
            ResumeError::ResumeBlocked(reason) => ResumeError::ResumeBlocked(reason),
            other => other,
        })?;

        let mut recovered_chunks = Vec::new();
        let completed_indices: Vec<ChunkIndex> = state
            .chunk_states
            .iter()
            .filter(|(_, s)| **s == ChunkState::Completed)
            .map(|(i, _)| *i)
            .collect();

        for index in completed_indices {
            let expected_hash = state.chunk_checksums.get(&index).cloned();
            let offset = index * state.chunk_size;
            let length = state.chunk_size.min(state.file_size.saturating_sub(offset));
            let bytes = read_chunk(index, offset, length).await;
            let corrupted = match (bytes, expected_hash) {
                (Ok(bytes), Some(expected)) => !chunk::verify(&bytes, &expected).unwrap_or(false),
                _ => true,
            };
            if corrupted {
                log::warn!("corruption sweep: chunk {index} of transfer {transfer_id} failed verification");
                state.demote_to_failed(index);
                recovered_chunks.push(index);
            }
        }

        state.last_saved = Utc::now();
        self.checkpoint(&state).await?;

        let remaining_chunks: Vec<ChunkIndex> = state
            .chunk_states
            .iter()
            .filter(|(_, s)| **s != ChunkState::Completed)
            .map(|(i, _)| *i)
            .collect();
        let resumed_from_chunk = remaining_chunks.iter().copied().min().unwrap_or(state.total_chunks);

        let summary = ResumeSummary {
            resumed_from_chunk,
            remaining_chunks,
            recovered_chunks,
        };
        Ok((state, summary))
    }
}

/// The conventional suffix for an in-progress download's local file.
pub fn partial_path(local_path: &str) -> PathBuf {
    let mut path = PathBuf::from(local_path);
    let file_name = path
        .file_name()
        .map(|n| format!("{}.partial", n.to_string_lossy()))
        .unwrap_or_else(|| "download.partial".to_string());
    path.set_file_name(file_name);
    path
}

pub fn state_path_for(directory: impl AsRef<Path>, transfer_id: TransferId) -> PathBuf {
    directory.as_ref().join(format!("{transfer_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state(dir: &Path) -> ResumeState {
        ResumeState::new(
            uuid::Uuid::new_v4(),
            "photo.jpg".into(),
            1_048_576,
            65_536,
            Direction::Download,
            "10.0.0.5:53317".into(),
            dir.join("photo.jpg").to_string_lossy().into_owned(),
        )
    }

    #[tokio::test]
    async fn checkpoint_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path(), std::time::Duration::from_secs(7 * 24 * 3600));
        let mut state = sample_state(dir.path());
        state.mark_completed(0, "deadbeef".into());
        store.checkpoint(&state).await.unwrap();

        let loaded = store.load(state.transfer_id).await.unwrap();
        assert_eq!(loaded.completed_chunks, 1);
        assert_eq!(loaded.chunk_checksums.get(&0), Some(&"deadbeef".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path(), std::time::Duration::from_secs(3600));
        let state = sample_state(dir.path());
        store.checkpoint(&state).await.unwrap();
        store.delete(state.transfer_id).await.unwrap();
        assert!(store.load(state.transfer_id).await.is_err());
    }

    #[tokio::test]
    async fn resume_fails_when_record_missing() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path(), std::time::Duration::from_secs(3600));
        let result = store.resume(uuid::Uuid::new_v4(), |_, _, _| async { Ok(vec![]) }).await;
        assert!(matches!(result, Err(ResumeError::ResumeNotFound(_))));
    }

    #[tokio::test]
    async fn resume_detects_corruption_and_demotes_chunk() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path(), std::time::Duration::from_secs(3600));
        let mut state = sample_state(dir.path());
        let good_bytes = vec![7u8; 65_536];
        let good_hash = chunk::hash(&good_bytes);
        state.mark_completed(0, good_hash);
        // partial file must exist for download validation to pass
        tokio::fs::write(partial_path(&state.local_path), b"stub").await.unwrap();
        store.checkpoint(&state).await.unwrap();

        let (resumed, summary) = store
            .resume(state.transfer_id, |_index, _offset, _length| async { Ok(vec![0u8; 65_536]) })
            .await
            .unwrap();

        assert_eq!(summary.recovered_chunks, vec![0]);
        assert_eq!(resumed.completed_chunks, 0);
        assert_eq!(resumed.chunk_states.get(&0), Some(&ChunkState::Failed));
    }

    #[tokio::test]
    async fn list_resumable_reports_missing_partial_as_blocked() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path(), std::time::Duration::from_secs(3600));
        let state = sample_state(dir.path());
        store.checkpoint(&state).await.unwrap();

        let resumable = store.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert!(!resumable[0].can_resume);
    }
}
