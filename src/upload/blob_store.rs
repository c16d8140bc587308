//! Blob Store
//!
//! Durable, append-only byte sinks keyed by upload id. Appends are
//! conditional on the caller's view of the current size so that a stale
//! or racing writer is rejected instead of overwriting committed bytes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

// ============================================================================
// Handle and Errors
// ============================================================================

/// Reference to the blob backing one upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHandle(String);

impl BlobHandle {
    /// Handle for the blob owned by upload `id`
    pub fn for_upload(id: Uuid) -> Self {
        Self(id.to_string())
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

/// Blob storage errors
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("offset conflict on {key}: expected {expected} bytes, blob holds {actual}")]
    OffsetConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("blob not found: {0}")]
    Missing(String),

    #[error("blob already finalized: {0}")]
    Finalized(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Blob Store Trait
// ============================================================================

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the blob for `id`, or return it if it already exists
    ///
    /// Never truncates existing data.
    async fn ensure(&self, id: Uuid) -> Result<BlobHandle, BlobError>;

    /// Append `data` if the blob currently holds exactly `at_offset` bytes
    ///
    /// Returns the new size. A failed write leaves the blob at `at_offset`.
    async fn append(&self, handle: &BlobHandle, at_offset: u64, data: &[u8])
        -> Result<u64, BlobError>;

    /// Current size in bytes
    async fn size(&self, handle: &BlobHandle) -> Result<u64, BlobError>;

    /// Cut an in-progress blob back to `len` bytes
    async fn truncate(&self, handle: &BlobHandle, len: u64) -> Result<(), BlobError>;

    /// Mark the blob complete; no further appends are accepted
    async fn finalize(&self, handle: &BlobHandle) -> Result<(), BlobError>;

    /// Release all storage for the blob; succeeds if already gone
    async fn delete(&self, handle: &BlobHandle) -> Result<(), BlobError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem blob storage
///
/// In-progress bytes live at `<root>/<id>.part`; finalizing renames the
/// file to `<root>/<id>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the finalized file for `handle`
    pub fn final_path(&self, handle: &BlobHandle) -> Result<PathBuf, BlobError> {
        let id = self.validate(handle)?;
        Ok(self.root.join(id.to_string()))
    }

    fn part_path(&self, handle: &BlobHandle) -> Result<PathBuf, BlobError> {
        let id = self.validate(handle)?;
        Ok(self.root.join(format!("{}.part", id)))
    }

    // Keys are upload ids; anything else could escape the root
    fn validate(&self, handle: &BlobHandle) -> Result<Uuid, BlobError> {
        Uuid::parse_str(handle.key()).map_err(|_| BlobError::InvalidKey(handle.key().to_string()))
    }
}

async fn exists(path: &Path) -> Result<bool, BlobError> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn sync_dir(dir: &Path) {
    // Persist directory entries (create/rename); not supported everywhere
    if let Ok(handle) = fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn ensure(&self, id: Uuid) -> Result<BlobHandle, BlobError> {
        let handle = BlobHandle::for_upload(id);
        let final_path = self.final_path(&handle)?;

        if exists(&final_path).await? {
            return Ok(handle);
        }

        let part_path = self.part_path(&handle)?;
        let created = !exists(&part_path).await?;

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await?;

        if created {
            sync_dir(&self.root).await;
            tracing::debug!(key = %handle.key(), "Created blob");
        }

        Ok(handle)
    }

    async fn append(
        &self,
        handle: &BlobHandle,
        at_offset: u64,
        data: &[u8],
    ) -> Result<u64, BlobError> {
        let part_path = self.part_path(handle)?;

        let mut file = match OpenOptions::new().append(true).open(&part_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if exists(&self.final_path(handle)?).await? {
                    return Err(BlobError::Finalized(handle.key().to_string()));
                }
                return Err(BlobError::Missing(handle.key().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = file.metadata().await?.len();
        if actual != at_offset {
            return Err(BlobError::OffsetConflict {
                key: handle.key().to_string(),
                expected: at_offset,
                actual,
            });
        }

        let written: std::io::Result<()> = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // No partial credit: cut back to where this append started
            if let Err(rollback) = file.set_len(at_offset).await {
                tracing::error!(
                    key = %handle.key(),
                    offset = at_offset,
                    error = %rollback,
                    "Failed to roll back partial append"
                );
            }
            return Err(e.into());
        }

        Ok(at_offset + data.len() as u64)
    }

    async fn size(&self, handle: &BlobHandle) -> Result<u64, BlobError> {
        for path in [self.part_path(handle)?, self.final_path(handle)?] {
            match fs::metadata(&path).await {
                Ok(meta) => return Ok(meta.len()),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(BlobError::Missing(handle.key().to_string()))
    }

    async fn truncate(&self, handle: &BlobHandle, len: u64) -> Result<(), BlobError> {
        let part_path = self.part_path(handle)?;

        let file = match OpenOptions::new().write(true).open(&part_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if exists(&self.final_path(handle)?).await? {
                    return Err(BlobError::Finalized(handle.key().to_string()));
                }
                return Err(BlobError::Missing(handle.key().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn finalize(&self, handle: &BlobHandle) -> Result<(), BlobError> {
        let part_path = self.part_path(handle)?;
        let final_path = self.final_path(handle)?;

        if !exists(&part_path).await? {
            if exists(&final_path).await? {
                return Ok(());
            }
            return Err(BlobError::Missing(handle.key().to_string()));
        }

        fs::File::open(&part_path).await?.sync_all().await?;
        fs::rename(&part_path, &final_path).await?;
        sync_dir(&self.root).await;

        tracing::debug!(key = %handle.key(), path = %final_path.display(), "Finalized blob");
        Ok(())
    }

    async fn delete(&self, handle: &BlobHandle) -> Result<(), BlobError> {
        for path in [self.part_path(handle)?, self.final_path(handle)?] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

// ============================================================================
// Tests
// ============================================================================
