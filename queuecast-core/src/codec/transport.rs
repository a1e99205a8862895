//! Base64 transport encoding for PCM byte buffers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const DATA_URL_SCHEME: &str = "data:";
const DATA_URL_MARKER: &str = ";base64,";

/// Base64 text of a PCM16 byte buffer.
///
/// Always stored without a data-URL prefix; [`EncodedChunk::parse`] strips one
/// if present and validates the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedChunk(String);

impl EncodedChunk {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes_to_base64(bytes))
    }

    /// Accept transport text from an external producer.
    ///
    /// # Errors
    /// Returns `QueuecastError::Decode` if the payload is not valid base64.
    pub fn parse(text: &str) -> Result<Self> {
        let payload = strip_data_url_prefix(text);
        decode_base64_strict(payload)?;
        Ok(Self(payload.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        decode_base64_strict(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EncodedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode base64 text, stripping an optional `data:<mime>;base64,` prefix first.
pub fn base64_to_bytes(text: &str) -> Result<Vec<u8>> {
    decode_base64_strict(strip_data_url_prefix(text))
}

/// Decode base64 text exactly as given.
///
/// A data-URL prefix is *not* removed here, so prefixed input fails instead of
/// decoding into garbage.
pub fn decode_base64_strict(text: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(text)?)
}

/// Remove a leading `data:<mime>;base64,` header if one is present.
///
/// Text that starts with `data:` but lacks the `;base64,` marker is returned
/// unchanged so the decoder rejects it.
pub fn strip_data_url_prefix(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix(DATA_URL_SCHEME) {
        if let Some(pos) = rest.find(DATA_URL_MARKER) {
            return &rest[pos + DATA_URL_MARKER.len()..];
        }
    }
    trimmed
}
