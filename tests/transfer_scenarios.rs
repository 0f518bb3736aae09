use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use tempfile::tempdir;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use transfer_core::bandwidth::BandwidthAllocator;
use transfer_core::chunk;
use transfer_core::classifier::ErrorClassifier;
use transfer_core::events::EventSink;
use transfer_core::network::{ConstantNetworkMonitor, NetworkCondition};
use transfer_core::resume::ResumeStore;
use transfer_core::session::{default_clamp_for, SessionDeps, SessionSettings, TransferSession};
use transfer_core::transport::{ChunkAck, ChunkTransport, FileHandle};
use transfer_core::types::{ChunkIndex, Direction, Priority, TransferId, TransferRequest};

struct SourceFile {
    bytes: Vec<u8>,
}

#[async_trait]
impl FileHandle for SourceFile {
    async fn read_at(&self, offset: u64, length: u64) -> transfer_core::transport::Result<Vec<u8>> {
        let end = (offset + length).min(self.bytes.len() as u64) as usize;
        Ok(self.bytes[offset as usize..end].to_vec())
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> transfer_core::transport::Result<()> {
        unreachable!("upload scenario never writes locally")
    }

    async fn flush(&self) -> transfer_core::transport::Result<()> {
        Ok(())
    }

    async fn length(&self) -> transfer_core::transport::Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

/// Collects every chunk a worker pushes via `put_chunk`, keyed by index, so
/// the test can reassemble and verify the whole file afterward.
struct CollectingTransport {
    received: StdMutex<HashMap<ChunkIndex, Vec<u8>>>,
}

#[async_trait]
impl ChunkTransport for CollectingTransport {
    async fn put_chunk(&self, transfer_id: TransferId, chunk_index: ChunkIndex, bytes: Vec<u8>) -> transfer_core::transport::Result<ChunkAck> {
        self.received.lock().unwrap().insert(chunk_index, bytes);
        Ok(ChunkAck { transfer_id, chunk_index, ok: true, error: None })
    }

    async fn get_chunk(&self, _transfer_id: TransferId, _chunk_index: ChunkIndex, _offset: u64, _length: u64) -> transfer_core::transport::Result<Vec<u8>> {
        unreachable!("upload scenario never downloads")
    }
}

fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn test_deps(dir: &std::path::Path, transport: Arc<dyn ChunkTransport>, file: Arc<dyn FileHandle>) -> SessionDeps {
    let monitor = Arc::new(ConstantNetworkMonitor::new(NetworkCondition::Excellent));
    SessionDeps {
        transport,
        file,
        resume_store: Arc::new(ResumeStore::new(dir, Duration::from_secs(7 * 24 * 3600))),
        bandwidth: Arc::new(BandwidthAllocator::new(50_000_000, 1024, Duration::from_secs(5), monitor)),
        events: Arc::new(EventSink::default()),
        classifier: Arc::new(Mutex::new(ErrorClassifier::new())),
        engine_semaphore: Arc::new(Semaphore::new(8)),
        root_cancellation: CancellationToken::new(),
    }
}

/// S1: a 1,048,576-byte upload with a 65,536-byte chunk size splits into
/// exactly 16 chunks, every one lands byte-for-byte, and the reassembled
/// source hashes identically to the original.
#[tokio::test]
async fn s1_full_upload_round_trips_every_chunk() {
    let dir = tempdir().unwrap();
    let source = seeded_bytes(0xC0FFEE, 1_048_576);
    let transport = Arc::new(CollectingTransport { received: StdMutex::new(HashMap::new()) });
    let file = Arc::new(SourceFile { bytes: source.clone() });
    let deps = test_deps(dir.path(), transport.clone(), file);
    deps.bandwidth
        .register(uuid::Uuid::new_v4(), Priority::Normal, default_clamp_for(Priority::Normal))
        .await;

    let request = TransferRequest::new(Direction::Upload, "payload.bin", source.len() as u64, "payload.bin", "peer-1");

    let session = TransferSession::new(request, 65_536, deps, SessionSettings::default(), None);
    assert_eq!(session.total_chunks, 16);

    session.run().await.unwrap();

    let (completed, failed, pending, in_progress) = session.counts().await;
    assert_eq!(completed, 16);
    assert_eq!(failed, 0);
    assert_eq!(pending, 0);
    assert_eq!(in_progress, 0);

    let received = transport.received.lock().unwrap();
    assert_eq!(received.len(), 16);
    let mut reassembled = Vec::with_capacity(source.len());
    for index in 0..16u64 {
        let (offset, length) = chunk::chunk_geometry(index, source.len() as u64, 65_536).unwrap();
        let bytes = received.get(&index).expect("every chunk must have been sent");
        assert_eq!(bytes.len() as u64, length);
        assert_eq!(chunk::hash(bytes), chunk::hash(&source[offset as usize..(offset + length) as usize]));
        reassembled.extend_from_slice(bytes);
    }
    assert_eq!(chunk::hash(&reassembled), chunk::hash(&source));
}

/// A transport that fails the first attempt of every even-indexed chunk
/// with a timeout-flavored error, then succeeds on the retry.
struct FlakyEvenChunkTransport {
    attempts: StdMutex<HashMap<ChunkIndex, u32>>,
    retries_observed: AtomicU32,
}

#[async_trait]
impl ChunkTransport for FlakyEvenChunkTransport {
    async fn put_chunk(&self, transfer_id: TransferId, chunk_index: ChunkIndex, _bytes: Vec<u8>) -> transfer_core::transport::Result<ChunkAck> {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(chunk_index).or_insert(0);
        *count += 1;

        if chunk_index % 2 == 0 && *count == 1 {
            self.retries_observed.fetch_add(1, Ordering::SeqCst);
            return Ok(ChunkAck {
                transfer_id,
                chunk_index,
                ok: false,
                error: Some("simulated timeout talking to peer".to_string()),
            });
        }
        Ok(ChunkAck { transfer_id, chunk_index, ok: true, error: None })
    }

    async fn get_chunk(&self, _transfer_id: TransferId, _chunk_index: ChunkIndex, _offset: u64, _length: u64) -> transfer_core::transport::Result<Vec<u8>> {
        unreachable!()
    }
}

/// S6: every even-indexed chunk of a 10-chunk upload times out once and is
/// retried; with MaxRetryAttempts=3 every chunk still completes, and the
/// total retry count across the session is exactly 5 (one per even chunk).
#[tokio::test]
async fn s6_even_chunks_retry_once_and_all_complete() {
    let dir = tempdir().unwrap();
    let chunk_size = 1024u64;
    let source = seeded_bytes(0xC0FFEE, (chunk_size * 10) as usize);
    let transport = Arc::new(FlakyEvenChunkTransport {
        attempts: StdMutex::new(HashMap::new()),
        retries_observed: AtomicU32::new(0),
    });
    let file = Arc::new(SourceFile { bytes: source.clone() });
    let deps = test_deps(dir.path(), transport.clone(), file);
    deps.bandwidth
        .register(uuid::Uuid::new_v4(), Priority::Normal, default_clamp_for(Priority::Normal))
        .await;

    let request = TransferRequest::new(Direction::Upload, "flaky.bin", source.len() as u64, "flaky.bin", "peer-1");
    let mut settings = SessionSettings::default();
    settings.max_retry_attempts = 3;
    settings.max_retry_delay = Duration::from_millis(20);

    let session = TransferSession::new(request, chunk_size, deps, settings, None);
    session.run().await.unwrap();

    let (completed, failed, pending, in_progress) = session.counts().await;
    assert_eq!(completed, 10);
    assert_eq!(failed, 0);
    assert_eq!(pending, 0);
    assert_eq!(in_progress, 0);

    let total_attempts: u32 = transport.attempts.lock().unwrap().values().sum();
    assert_eq!(total_attempts, 15, "10 chunks succeed on first try except 5 even ones needing one retry each");
    assert_eq!(transport.retries_observed.load(Ordering::SeqCst), 5);
}
