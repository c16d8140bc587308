//! Resumable Upload Module (tus 1.0.0)
//!
//! Implements the server side of the tus protocol with:
//! - creation, creation-defer-length, termination, checksum, expiration
//! - exact-offset chunk appends guarded by per-upload locks
//! - explicit lifecycle state machine with crash recovery
//!
//! Protocol Flow:
//! 1. Client creates an upload, optionally deferring its length
//! 2. Client asks for the current offset (HEAD)
//! 3. Client appends chunks at that offset (PATCH) until complete
//! 4. Client may terminate; stale uploads are expired by a sweep

pub mod blob_store;
pub mod checksum;
pub mod engine;
pub mod locks;
pub mod metadata;
pub mod repository;
pub mod state_machine;
pub mod types;

pub use blob_store::{BlobError, BlobHandle, BlobStore, LocalBlobStore};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumError};
pub use engine::{ChunkWrite, EngineSettings, SweepReport, UploadProtocolEngine};
pub use metadata::{MetadataError, UploadMetadata};
pub use repository::{MemoryUploadRepository, RepositoryError, UploadRepository};
pub use types::*;
