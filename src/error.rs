//! Closed error taxonomy (spec §7), one `thiserror` enum per component
//! composed into a top-level [`EngineError`] the CLI converts to an exit
//! code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic bytes: {0:?}")]
    BadMagic(Vec<u8>),
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u32),
    #[error("unknown dtype tag: {0}")]
    UnknownDtype(String),
    #[error("string length {0} exceeds bound")]
    OversizedString(u64),
    #[error("array length {0} exceeds bound")]
    OversizedArray(u64),
    #[error("invalid JSON header: {0}")]
    InvalidJson(String),
    #[error("header length {0} exceeds bound")]
    HeaderTooLarge(u64),
    #[error("tensor {name} offset {offset} is out of order (previous {previous})")]
    OutOfOrderOffset {
        name: String,
        offset: u64,
        previous: u64,
    },
    #[error("unexpected end of input at offset {offset} (need {need} bytes, have {have})")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shard {index} not found")]
    ShardNotFound { index: u32 },
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("manifest not found for open model")]
    ManifestNotFound,
    #[error("hash mismatch for shard {index}: expected {expected}, got {actual}")]
    HashMismatch {
        index: u32,
        expected: String,
        actual: String,
    },
    #[error("insufficient space: required {required}, available {available}")]
    QuotaExceeded { required: u64, available: u64 },
    #[error("persistent storage unavailable on this platform")]
    PlatformUnsupported,
    #[error("manifest invalid: {}", .reasons.join("; "))]
    ManifestInvalid { reasons: Vec<String> },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("import cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("network error (retryable={retryable}): {message}")]
    Network { retryable: bool, message: String },
    #[error("http error: status {status}")]
    Http { status: u16 },
    #[error("timeout during {operation}")]
    Timeout { operation: String },
    #[error("download cancelled")]
    Cancelled,
    #[error("download already in progress for model {0}")]
    AlreadyInProgress(String),
    #[error("shard fetch permanently failed: {0:?}")]
    ShardFailed(Vec<u32>),
    #[error("manifest invalid: {}", .reasons.join("; "))]
    ManifestInvalid { reasons: Vec<String> },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Whether a fresh attempt of the same operation might succeed.
    pub fn retryable(&self) -> bool {
        match self {
            DownloadError::Network { retryable, .. } => *retryable,
            DownloadError::Http { status } => *status == 429,
            DownloadError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl EngineError {
    /// Exit codes from spec §6: 0 success, 1 usage, 2 I/O, 3 integrity, 4 quota.
    pub fn to_exit_code(&self) -> i32 {
        match self {
            EngineError::Store(StoreError::QuotaExceeded { .. }) => 4,
            EngineError::Download(DownloadError::Store(StoreError::QuotaExceeded { .. })) => 4,
            EngineError::Import(ImportError::Store(StoreError::QuotaExceeded { .. })) => 4,
            EngineError::Download(DownloadError::ShardFailed(_)) => 3,
            EngineError::Store(StoreError::HashMismatch { .. }) => 3,
            EngineError::Store(StoreError::ManifestInvalid { .. }) => 3,
            EngineError::Download(DownloadError::ManifestInvalid { .. }) => 3,
            EngineError::Store(StoreError::Io(_)) => 2,
            EngineError::Import(ImportError::Io(_)) => 2,
            EngineError::Format(_) => 2,
            _ => 2,
        }
    }
}
