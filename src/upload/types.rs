//! Upload types for the tus protocol engine

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::blob_store::BlobHandle;
use super::metadata::UploadMetadata;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Protocol versions accepted in `Tus-Resumable`
pub const TUS_SUPPORTED_VERSIONS: &[&str] = &["1.0.0"];

/// Protocol extensions implemented by the engine
pub const TUS_EXTENSIONS: &[&str] = &[
    "creation",
    "creation-defer-length",
    "termination",
    "checksum",
    "expiration",
];

/// Default maximum upload size: 4GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default upload expiry: 24 hours
pub const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Default metadata key copied into `UploadRecord::filename`
pub const DEFAULT_FILENAME_FIELD: &str = "filename";

/// Content type required on chunk writes
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

// ============================================================================
// Upload Length
// ============================================================================

/// Total size of an upload, possibly not yet known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    /// Length will be declared by a later request
    Deferred,
    /// Length fixed at this many bytes
    Known(u64),
}

impl UploadLength {
    pub fn known(&self) -> Option<u64> {
        match self {
            Self::Known(len) => Some(*len),
            Self::Deferred => None,
        }
    }
}

impl Serialize for UploadLength {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(len) => serializer.serialize_some(len),
            Self::Deferred => serializer.serialize_none(),
        }
    }
}

// ============================================================================
// Upload State
// ============================================================================

/// Lifecycle state of an upload record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Created, no bytes written yet
    Initial,
    /// At least one chunk write has started
    Receiving,
    /// A chunk write is in flight
    Saving,
    /// All declared bytes received
    Finished,
    /// Removed by the expiry sweep
    Expired,
    /// Removed by the client
    Terminated,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Receiving => "receiving",
            Self::Saving => "saving",
            Self::Finished => "finished",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Expired | Self::Terminated)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "receiving" => Ok(Self::Receiving),
            "saving" => Ok(Self::Saving),
            "finished" => Ok(Self::Finished),
            "expired" => Ok(Self::Expired),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown upload state: {}", other)),
        }
    }
}

// ============================================================================
// Upload Record
// ============================================================================

/// Persistent protocol state of one upload
///
/// `state` is only changed through [`super::state_machine::apply`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Externally addressable upload id
    pub id: Uuid,

    /// Declared total length
    pub length: UploadLength,

    /// Bytes durably committed to the blob
    pub offset: u64,

    /// Client metadata, echoed back verbatim
    pub metadata: UploadMetadata,

    /// Value of the configured filename metadata field
    pub filename: Option<String>,

    pub(crate) state: UploadState,

    /// After this instant the upload no longer accepts writes
    pub expires_at: Option<DateTime<Utc>>,

    /// Backing blob, set once materialized
    #[serde(skip)]
    pub blob: Option<BlobHandle>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Create a new record in the `Initial` state
    pub fn new(
        length: UploadLength,
        metadata: UploadMetadata,
        filename: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            length,
            offset: 0,
            metadata,
            filename,
            state: UploadState::Initial,
            expires_at,
            blob: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Check if the record is past its expiry time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires < now)
    }

    /// Whether every declared byte has been committed
    pub fn is_complete(&self) -> bool {
        self.length.known() == Some(self.offset)
    }

    /// Bytes still expected, if the length is known
    pub fn remaining(&self) -> Option<u64> {
        self.length.known().map(|len| len.saturating_sub(self.offset))
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Protocol capabilities advertised to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub version: &'static str,
    pub supported_versions: Vec<&'static str>,
    pub extensions: Vec<&'static str>,
    pub checksum_algorithms: Vec<&'static str>,
    pub max_size: u64,
}

// ============================================================================
// Events
// ============================================================================

/// Notifications published by the engine
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Every declared byte was received; fires once per upload
    Finished(UploadRecord),
    /// The client terminated the upload
    Terminated(Uuid),
    /// The expiry sweep removed the upload
    Expired(Uuid),
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(Uuid),

    #[error("Upload content is gone: {0}")]
    Gone(Uuid),

    #[error("Cannot {action} upload {id} in state '{state}'")]
    InvalidState {
        id: Uuid,
        state: UploadState,
        action: &'static str,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("No data")]
    EmptyChunk,

    #[error("Upload length {length} exceeds maximum of {max} bytes")]
    LengthExceeded { length: u64, max: u64 },

    #[error("Invalid upload length: {0}")]
    BadLength(String),

    #[error("Invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Non-standard status used by the checksum extension
pub const CHECKSUM_MISMATCH_STATUS: u16 = 460;

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::InvalidState { .. } => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
            Self::ChecksumMismatch => StatusCode::from_u16(CHECKSUM_MISMATCH_STATUS)
                .unwrap_or(StatusCode::BAD_REQUEST),
            Self::EmptyChunk => StatusCode::BAD_REQUEST,
            Self::LengthExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadLength(_) => StatusCode::BAD_REQUEST,
            Self::InvalidMetadata(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone(_) => "GONE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Conflict(_) => "CONFLICT",
            Self::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::EmptyChunk => "EMPTY_CHUNK",
            Self::LengthExceeded { .. } => "LENGTH_EXCEEDED",
            Self::BadLength(_) => "BAD_LENGTH",
            Self::InvalidMetadata(_) => "INVALID_METADATA",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may resend the same request after re-reading the offset
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Storage(_) | Self::ChecksumMismatch)
    }
}
