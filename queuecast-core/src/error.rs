use thiserror::Error;

/// All errors produced by queuecast-core.
#[derive(Debug, Error)]
pub enum QueuecastError {
    #[error("malformed transport text: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to decode chunk {index}: {source}")]
    ChunkDecode {
        index: usize,
        #[source]
        source: base64::DecodeError,
    },

    #[error("PCM16 byte buffer has odd length {len}")]
    MisalignedPcm { len: usize },

    #[error("output resource error: {0}")]
    Resource(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture is already running")]
    AlreadyCapturing,

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueuecastError>;
