//! External collaborators the session engine depends on: a minimal file
//! abstraction, and the wire contract for sending/receiving chunk payloads.
//! The transport itself is out of scope; this module only defines the
//! interface it must satisfy and the framing the core speaks over it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChunkIndex, TransferId};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("put_chunk failed for transfer {transfer_id} chunk {chunk_index}: {reason}")]
    PutChunkFailed {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        reason: String,
    },

    #[error("get_chunk failed for transfer {transfer_id} chunk {chunk_index}: {reason}")]
    GetChunkFailed {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        reason: String,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The protocol version header value this core negotiates and annotates
/// outbound messages with.
pub const VERSION_HEADER: &str = "X-LocalSend-Version";
/// Present on outbound messages when the negotiated version supports
/// enhanced security.
pub const SECURITY_LEVEL_HEADER: &str = "X-Security-Level";

/// Metadata carried ahead of the raw chunk bytes in the wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFrameMetadata {
    pub transfer_id: TransferId,
    pub chunk_index: ChunkIndex,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub compressed: bool,
}

/// Acknowledgement returned by the peer for a `put_chunk`, or expected by
/// the peer for a `get_chunk` once bytes have been consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAck {
    pub transfer_id: TransferId,
    pub chunk_index: ChunkIndex,
    pub ok: bool,
    pub error: Option<String>,
}

/// Encodes a chunk frame as a 4-byte big-endian metadata length followed by
/// the JSON metadata object, followed by the raw chunk bytes.
pub fn encode_frame(metadata: &ChunkFrameMetadata, payload: &[u8]) -> Result<Vec<u8>> {
    let metadata_json = serde_json::to_vec(metadata).map_err(|e| anyhow::anyhow!(e))?;
    let mut frame = Vec::with_capacity(4 + metadata_json.len() + payload.len());
    frame.extend_from_slice(&(metadata_json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&metadata_json);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes a frame produced by [`encode_frame`].
pub fn decode_frame(frame: &[u8]) -> Result<(ChunkFrameMetadata, Vec<u8>)> {
    if frame.len() < 4 {
        return Err(TransportError::MalformedFrame("frame shorter than length prefix".into()));
    }
    let metadata_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let metadata_start: usize = 4;
    let metadata_end = metadata_start
        .checked_add(metadata_len)
        .ok_or_else(|| TransportError::MalformedFrame("metadata length overflow".into()))?;
    if metadata_end > frame.len() {
        return Err(TransportError::MalformedFrame("metadata length exceeds frame size".into()));
    }
    let metadata: ChunkFrameMetadata = serde_json::from_slice(&frame[metadata_start..metadata_end])
        .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
    let payload = frame[metadata_end..].to_vec();
    Ok((metadata, payload))
}

/// The wire contract the transport collaborator must implement: upload
/// pushes chunks with `put_chunk`, download pulls them with `get_chunk`.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn put_chunk(&self, transfer_id: TransferId, chunk_index: ChunkIndex, bytes: Vec<u8>) -> Result<ChunkAck>;
    async fn get_chunk(&self, transfer_id: TransferId, chunk_index: ChunkIndex, offset: u64, length: u64) -> Result<Vec<u8>>;
}

/// The minimal file interface the core requires of local storage.
#[async_trait]
pub trait FileHandle: Send + Sync {
    async fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn length(&self) -> Result<u64>;
}
