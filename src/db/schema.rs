//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

// Timestamps are RFC 3339 UTC with fixed microsecond precision so that
// string comparison orders them chronologically.
const SCHEMA_SQL: &str = r#"
-- Upload records (tus protocol state)
CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    upload_length INTEGER NOT NULL,
    upload_offset INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '',
    filename TEXT,
    state TEXT NOT NULL DEFAULT 'initial',
    expires_at TEXT,
    blob_key TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_state_expires ON uploads(state, expires_at);
"#;
