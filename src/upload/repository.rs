//! Upload record repository
//!
//! The engine only needs point lookup, upsert, delete and a range scan on
//! expiry time. SQLite lives in `crate::db`; the in-memory variant here is
//! used by tests and embedders that do not need restarts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{UploadError, UploadRecord};

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt upload record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<RepositoryError> for UploadError {
    fn from(e: RepositoryError) -> Self {
        tracing::error!(error = %e, "Upload repository failure");
        Self::Repository(e.to_string())
    }
}

/// Persistence interface for upload records
#[async_trait::async_trait]
pub trait UploadRepository: Send + Sync {
    /// Load a record by id
    async fn load(&self, id: Uuid) -> Result<Option<UploadRecord>, RepositoryError>;

    /// Insert or replace a record
    async fn save(&self, record: &UploadRecord) -> Result<(), RepositoryError>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// Non-terminal records whose expiry is before `now`
    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadRecord>, RepositoryError>;
}

// ============================================================================
// In-Memory Repository
// ============================================================================

/// Upload records held in process memory
#[derive(Clone, Default)]
pub struct MemoryUploadRepository {
    records: Arc<RwLock<HashMap<Uuid, UploadRecord>>>,
}

impl MemoryUploadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get record count
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl UploadRepository for MemoryUploadRepository {
    async fn load(&self, id: Uuid) -> Result<Option<UploadRecord>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn save(&self, record: &UploadRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut expired: Vec<UploadRecord> = records
            .values()
            .filter(|r| !r.state().is_terminal() && r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::metadata::UploadMetadata;
    use crate::upload::types::{UploadLength, UploadState};

    fn record(expires_at: Option<DateTime<Utc>>) -> UploadRecord {
        UploadRecord::new(UploadLength::Known(100), UploadMetadata::new(), None, expires_at)
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let repo = MemoryUploadRepository::new();
        let mut upload = record(None);

        repo.save(&upload).await.unwrap();
        assert_eq!(repo.load(upload.id).await.unwrap().unwrap().offset, 0);

        upload.offset = 42;
        repo.save(&upload).await.unwrap();
        assert_eq!(repo.load(upload.id).await.unwrap().unwrap().offset, 42);
        assert_eq!(repo.count().await, 1);

        assert!(repo.delete(upload.id).await.unwrap());
        assert!(!repo.delete(upload.id).await.unwrap());
        assert!(repo.load(upload.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_expired_skips_terminal_and_future() {
        let repo = MemoryUploadRepository::new();
        let now = Utc::now();

        let stale = record(Some(now - chrono::Duration::hours(1)));
        let fresh = record(Some(now + chrono::Duration::hours(1)));
        let open_ended = record(None);
        let mut finished = record(Some(now - chrono::Duration::hours(2)));
        finished.state = UploadState::Finished;

        for r in [&stale, &fresh, &open_ended, &finished] {
            repo.save(r).await.unwrap();
        }

        let expired = repo.scan_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
    }
}
