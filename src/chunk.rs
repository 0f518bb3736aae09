//! Pure, stateless helpers over byte ranges: slicing, hashing, and
//! constant-time integrity comparison. Safe to call from any worker; holds
//! no state of its own.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChunkError>;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk range out of bounds: offset {offset} + length {length} exceeds buffer of {buffer_len} bytes")]
    OutOfRange {
        offset: u64,
        length: u64,
        buffer_len: u64,
    },

    #[error("malformed base64 hash: {0}")]
    MalformedHash(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Copies out `length` bytes starting at `offset`. Fails with `OutOfRange`
/// rather than panicking on a short buffer, since callers may pass chunk
/// geometry computed from stale file metadata.
pub fn slice(buf: &[u8], offset: u64, length: u64) -> Result<Vec<u8>> {
    let buffer_len = buf.len() as u64;
    let end = offset
        .checked_add(length)
        .ok_or(ChunkError::OutOfRange { offset, length, buffer_len })?;
    if end > buffer_len {
        return Err(ChunkError::OutOfRange { offset, length, buffer_len });
    }
    Ok(buf[offset as usize..end as usize].to_vec())
}

/// Hashes `bytes` with SHA-256 and base64-encodes the digest. Base64 is
/// chosen over the raw digest bytes so the hash survives a JSON resume-state
/// round trip unchanged.
pub fn hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    BASE64.encode(digest)
}

/// Verifies `bytes` against a previously computed base64 hash using a
/// constant-time comparison, so timing does not leak how many leading bytes
/// of the digest matched.
pub fn verify(bytes: &[u8], expected_hash: &str) -> Result<bool> {
    let actual = hash(bytes);
    let actual_bytes = actual.as_bytes();
    let expected_bytes = expected_hash.as_bytes();

    if actual_bytes.len() != expected_bytes.len() {
        // Still walk a fixed amount of "comparison" work so the early return
        // on length doesn't become an observable timing channel for callers
        // that always pass same-length digests; length itself is public.
        return Ok(false);
    }

    let mut diff: u8 = 0;
    for (a, b) in actual_bytes.iter().zip(expected_bytes.iter()) {
        diff |= a ^ b;
    }
    Ok(diff == 0)
}

/// Total number of chunks a file of `total_size` splits into under
/// `chunk_size`, rounding the final partial chunk up.
pub fn total_chunks(total_size: u64, chunk_size: u64) -> u64 {
    if total_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Byte offset and length of chunk `index` within a file of `total_size`.
pub fn chunk_geometry(index: u64, total_size: u64, chunk_size: u64) -> Result<(u64, u64)> {
    let offset = index
        .checked_mul(chunk_size)
        .ok_or_else(|| ChunkError::Other(anyhow::anyhow!("chunk index overflow")))?;
    if offset >= total_size {
        return Err(ChunkError::OutOfRange {
            offset,
            length: chunk_size,
            buffer_len: total_size,
        });
    }
    let length = chunk_size.min(total_size - offset);
    Ok((offset, length))
}
