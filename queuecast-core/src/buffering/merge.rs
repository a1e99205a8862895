//! Merging independently encoded PCM chunks.

use parking_lot::Mutex;

use crate::codec::{decode_base64_strict, EncodedChunk};
use crate::error::{QueuecastError, Result};

/// Concatenate `chunks` in order into one transport chunk.
///
/// Zero chunks give an empty result and a single chunk is returned as-is.
/// Otherwise every chunk is decoded, the bytes are appended back to back with
/// no padding, and the result is re-encoded.
///
/// # Errors
/// Returns `QueuecastError::ChunkDecode` naming the first chunk that failed to
/// decode. No partial result is produced.
pub fn merge(chunks: &[EncodedChunk]) -> Result<EncodedChunk> {
    match chunks {
        [] => Ok(EncodedChunk::default()),
        [only] => Ok(only.clone()),
        _ => {
            let mut decoded = Vec::with_capacity(chunks.len());
            for (index, chunk) in chunks.iter().enumerate() {
                let bytes = decode_base64_strict(chunk.as_str()).map_err(|e| match e {
                    QueuecastError::Decode(source) => QueuecastError::ChunkDecode { index, source },
                    other => other,
                })?;
                decoded.push(bytes);
            }
            let total: usize = decoded.iter().map(Vec::len).sum();
            let mut joined = Vec::with_capacity(total);
            for bytes in &decoded {
                joined.extend_from_slice(bytes);
            }
            Ok(EncodedChunk::from_bytes(&joined))
        }
    }
}

/// Append-only record of the transport chunks produced during one capture
/// cycle, kept for merge-and-replay.
///
/// Appends may come from the capture pump while readers merge on another
/// thread, so the list sits behind a `parking_lot::Mutex`.
#[derive(Debug, Default)]
pub struct TransportLog {
    chunks: Mutex<Vec<EncodedChunk>>,
}

impl TransportLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: EncodedChunk) {
        self.chunks.lock().push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Merge everything recorded so far.
    pub fn merged(&self) -> Result<EncodedChunk> {
        let snapshot = self.chunks.lock().clone();
        merge(&snapshot)
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}
