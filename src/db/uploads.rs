//! Upload record database operations

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::upload::{
    BlobHandle, RepositoryError, UploadLength, UploadMetadata, UploadRecord, UploadRepository,
    UploadState,
};

/// Stored value of `upload_length` for a deferred length
const DEFERRED_LENGTH: i64 = -1;

/// Upload row as stored in SQLite
#[derive(Debug, Clone, sqlx::FromRow)]
struct UploadRow {
    id: String,
    upload_length: i64,
    upload_offset: i64,
    metadata: String,
    filename: Option<String>,
    state: String,
    expires_at: Option<String>,
    blob_key: Option<String>,
    created_at: String,
    updated_at: String,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(id, format!("bad timestamp {:?}: {}", value, e)))
}

fn corrupt(id: &str, reason: impl Into<String>) -> RepositoryError {
    RepositoryError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn to_db_int(id: Uuid, field: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| corrupt(&id.to_string(), format!("{} {} out of range", field, value)))
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = RepositoryError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|e| corrupt(&row.id, e.to_string()))?;

        let length = match row.upload_length {
            DEFERRED_LENGTH => UploadLength::Deferred,
            len => UploadLength::Known(
                u64::try_from(len).map_err(|_| corrupt(&row.id, format!("negative length {}", len)))?,
            ),
        };

        let offset = u64::try_from(row.upload_offset)
            .map_err(|_| corrupt(&row.id, format!("negative offset {}", row.upload_offset)))?;

        let metadata = UploadMetadata::parse(&row.metadata)
            .map_err(|e| corrupt(&row.id, format!("metadata: {}", e)))?;

        let state: UploadState = row.state.parse().map_err(|e: String| corrupt(&row.id, e))?;

        let expires_at = row
            .expires_at
            .as_deref()
            .map(|value| parse_timestamp(&row.id, value))
            .transpose()?;

        Ok(UploadRecord {
            id,
            length,
            offset,
            metadata,
            filename: row.filename,
            state,
            expires_at,
            blob: row.blob_key.map(BlobHandle::from_key),
            created_at: parse_timestamp(&row.id, &row.created_at)?,
            updated_at: parse_timestamp(&row.id, &row.updated_at)?,
        })
    }
}

/// SQLite-backed upload repository
#[derive(Clone)]
pub struct SqliteUploadRepository {
    pool: SqlitePool,
}

impl SqliteUploadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl UploadRepository for SqliteUploadRepository {
    async fn load(&self, id: Uuid) -> Result<Option<UploadRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, UploadRow>(
            r#"
            SELECT id, upload_length, upload_offset, metadata, filename, state,
                   expires_at, blob_key, created_at, updated_at
            FROM uploads
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadRecord::try_from).transpose()
    }

    async fn save(&self, record: &UploadRecord) -> Result<(), RepositoryError> {
        let length = match record.length {
            UploadLength::Deferred => DEFERRED_LENGTH,
            UploadLength::Known(len) => to_db_int(record.id, "length", len)?,
        };
        let offset = to_db_int(record.id, "offset", record.offset)?;

        sqlx::query(
            r#"
            INSERT INTO uploads (id, upload_length, upload_offset, metadata, filename, state,
                                 expires_at, blob_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                upload_length = excluded.upload_length,
                upload_offset = excluded.upload_offset,
                metadata = excluded.metadata,
                filename = excluded.filename,
                state = excluded.state,
                expires_at = excluded.expires_at,
                blob_key = excluded.blob_key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id.to_string())
        .bind(length)
        .bind(offset)
        .bind(record.metadata.encode())
        .bind(&record.filename)
        .bind(record.state().as_str())
        .bind(record.expires_at.as_ref().map(format_timestamp))
        .bind(record.blob.as_ref().map(|handle| handle.key().to_string()))
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, UploadRow>(
            r#"
            SELECT id, upload_length, upload_offset, metadata, filename, state,
                   expires_at, blob_key, created_at, updated_at
            FROM uploads
            WHERE state NOT IN ('finished', 'expired', 'terminated')
              AND expires_at IS NOT NULL
              AND expires_at < ?
            ORDER BY expires_at
            "#,
        )
        .bind(format_timestamp(&now))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match UploadRecord::try_from(row) {
                Ok(record) => records.push(record),
                // One bad row must not stall the sweep for the rest
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable upload row"),
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use tempfile::TempDir;

    async fn repository() -> (TempDir, SqliteUploadRepository) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("tus.db").display());
        let pool = create_pool(&url).await.unwrap();
        (dir, SqliteUploadRepository::new(pool))
    }

    fn record(length: UploadLength, expires_at: Option<DateTime<Utc>>) -> UploadRecord {
        let metadata = UploadMetadata::parse("filename YS50eHQ=,note").unwrap();
        UploadRecord::new(length, metadata, Some("a.txt".to_string()), expires_at)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (_dir, repo) = repository().await;
        let mut upload = record(UploadLength::Known(1024), Some(Utc::now()));
        upload.offset = 512;
        upload.state = UploadState::Receiving;
        upload.blob = Some(BlobHandle::for_upload(upload.id));

        repo.save(&upload).await.unwrap();
        let loaded = repo.load(upload.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, upload.id);
        assert_eq!(loaded.length, UploadLength::Known(1024));
        assert_eq!(loaded.offset, 512);
        assert_eq!(loaded.state(), UploadState::Receiving);
        assert_eq!(loaded.metadata, upload.metadata);
        assert_eq!(loaded.filename.as_deref(), Some("a.txt"));
        assert_eq!(loaded.blob, upload.blob);
        assert_eq!(
            loaded.expires_at.map(|t| t.timestamp_micros()),
            upload.expires_at.map(|t| t.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn test_deferred_length_and_upsert() {
        let (_dir, repo) = repository().await;
        let mut upload = record(UploadLength::Deferred, None);

        repo.save(&upload).await.unwrap();
        assert_eq!(
            repo.load(upload.id).await.unwrap().unwrap().length,
            UploadLength::Deferred
        );

        upload.length = UploadLength::Known(10);
        upload.offset = 10;
        upload.state = UploadState::Finished;
        repo.save(&upload).await.unwrap();

        let loaded = repo.load(upload.id).await.unwrap().unwrap();
        assert_eq!(loaded.length, UploadLength::Known(10));
        assert_eq!(loaded.state(), UploadState::Finished);
        assert!(loaded.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, repo) = repository().await;
        let upload = record(UploadLength::Known(1), None);
        repo.save(&upload).await.unwrap();

        assert!(repo.delete(upload.id).await.unwrap());
        assert!(!repo.delete(upload.id).await.unwrap());
        assert!(repo.load(upload.id).await.unwrap().is_none());
        assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_expired() {
        let (_dir, repo) = repository().await;
        let now = Utc::now();

        let oldest = record(UploadLength::Known(1), Some(now - chrono::Duration::days(2)));
        let stale = record(UploadLength::Known(1), Some(now - chrono::Duration::minutes(1)));
        let fresh = record(UploadLength::Known(1), Some(now + chrono::Duration::minutes(1)));
        let open_ended = record(UploadLength::Known(1), None);
        let mut finished = record(UploadLength::Known(1), Some(now - chrono::Duration::hours(1)));
        finished.state = UploadState::Finished;

        for r in [&stale, &fresh, &oldest, &open_ended, &finished] {
            repo.save(r).await.unwrap();
        }

        let ids: Vec<Uuid> = repo
            .scan_expired(now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![oldest.id, stale.id]);
    }

    #[tokio::test]
    async fn test_corrupt_row_reported() {
        let (_dir, repo) = repository().await;
        let upload = record(UploadLength::Known(1), None);
        repo.save(&upload).await.unwrap();

        sqlx::query("UPDATE uploads SET state = 'paused' WHERE id = ?")
            .bind(upload.id.to_string())
            .execute(repo.pool())
            .await
            .unwrap();

        assert!(matches!(
            repo.load(upload.id).await,
            Err(RepositoryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("tus.db").display());
        let upload = record(UploadLength::Known(8), None);

        {
            let repo = SqliteUploadRepository::new(create_pool(&url).await.unwrap());
            repo.save(&upload).await.unwrap();
            repo.pool().close().await;
        }

        let repo = SqliteUploadRepository::new(create_pool(&url).await.unwrap());
        assert_eq!(repo.load(upload.id).await.unwrap().unwrap().length, UploadLength::Known(8));
    }
}
