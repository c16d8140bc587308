//! Upload Protocol Engine
//!
//! Orchestrates the tus operations on top of the record repository, the
//! blob store and the state machine:
//! - Create, Head, PatchChunk, DeclareLength, Terminate
//! - Expiry sweep, run periodically in the background
//!
//! Mutating operations hold the per-upload lock for their whole
//! check-append-commit sequence. Head reads a repository snapshot and never
//! waits for a lock; offset, length and state are persisted together.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::blob_store::{BlobError, BlobHandle, BlobStore};
use super::checksum::{Checksum, ChecksumAlgorithm};
use super::locks::RecordLocks;
use super::metadata::UploadMetadata;
use super::repository::UploadRepository;
use super::state_machine::{self, Trigger};
use super::types::{
    Capabilities, UploadError, UploadEvent, UploadLength, UploadRecord, UploadState,
    DEFAULT_EXPIRY_HOURS, DEFAULT_FILENAME_FIELD, DEFAULT_MAX_FILE_SIZE, TUS_EXTENSIONS,
    TUS_SUPPORTED_VERSIONS, TUS_VERSION,
};

/// Capacity of the event channel before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Settings
// ============================================================================

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Largest accepted upload length
    pub max_size: u64,

    /// Lifetime of a new upload (None = never expires)
    pub expiration: Option<chrono::Duration>,

    /// Upper bound on a single blob append
    pub write_timeout: Duration,

    /// Metadata key copied into `UploadRecord::filename`
    pub filename_field: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_FILE_SIZE,
            expiration: Some(chrono::Duration::hours(DEFAULT_EXPIRY_HOURS)),
            write_timeout: Duration::from_secs(60),
            filename_field: DEFAULT_FILENAME_FIELD.to_string(),
        }
    }
}

// ============================================================================
// Requests and Reports
// ============================================================================

/// One chunk write
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub id: Uuid,

    /// Offset the client believes the upload is at
    pub offset: u64,

    pub data: Bytes,

    /// Byte count announced by the transport, if any
    pub declared_length: Option<u64>,

    pub checksum: Option<Checksum>,

    /// Upload length sent along with the chunk, committed only if the
    /// chunk is accepted
    pub upload_length: Option<u64>,
}

impl ChunkWrite {
    pub fn new(id: Uuid, offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            offset,
            data: data.into(),
            declared_length: None,
            checksum: None,
            upload_length: None,
        }
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    pub fn with_upload_length(mut self, length: u64) -> Self {
        self.upload_length = Some(length);
        self
    }
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates returned by the repository scan
    pub scanned: usize,
    /// Uploads removed
    pub expired: usize,
    /// Uploads busy with another operation, left for the next sweep
    pub deferred: usize,
    /// Uploads whose removal failed
    pub failed: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// The tus protocol engine
#[derive(Clone)]
pub struct UploadProtocolEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    repository: Arc<dyn UploadRepository>,
    blobs: Arc<dyn BlobStore>,
    locks: RecordLocks,
    settings: EngineSettings,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadProtocolEngine {
    /// Create a new engine
    pub fn new(
        repository: Arc<dyn UploadRepository>,
        blobs: Arc<dyn BlobStore>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            backend = blobs.backend_name(),
            max_size = settings.max_size,
            expiration_secs = ?settings.expiration.map(|d| d.num_seconds()),
            "Upload engine ready"
        );

        Self {
            inner: Arc::new(EngineInner {
                repository,
                blobs,
                locks: RecordLocks::new(),
                settings,
                events,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Receive lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    /// Capabilities to advertise to clients
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            version: TUS_VERSION,
            supported_versions: TUS_SUPPORTED_VERSIONS.to_vec(),
            extensions: TUS_EXTENSIONS.to_vec(),
            checksum_algorithms: ChecksumAlgorithm::names(),
            max_size: self.inner.settings.max_size,
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a new upload
    ///
    /// The blob is created lazily by the first write or status query,
    /// except for zero-length uploads which complete immediately.
    pub async fn create(
        &self,
        length: UploadLength,
        metadata: UploadMetadata,
    ) -> Result<UploadRecord, UploadError> {
        if let UploadLength::Known(len) = length {
            self.check_max_size(len)?;
        }

        let settings = &self.inner.settings;
        let filename = metadata.get_str(&settings.filename_field).map(str::to_owned);
        let expires_at = settings.expiration.map(|ttl| Utc::now() + ttl);

        let mut record = UploadRecord::new(length, metadata, filename, expires_at);
        let _guard = self.inner.locks.lock(record.id).await;

        self.inner.repository.save(&record).await?;

        tracing::info!(
            upload_id = %record.id,
            length = ?record.length.known(),
            filename = ?record.filename,
            expires_at = ?record.expires_at,
            "Created upload"
        );

        if record.is_complete() {
            self.complete(&mut record).await?;
        }

        Ok(record)
    }

    // ========================================================================
    // Head
    // ========================================================================

    /// Status query; never changes the offset
    ///
    /// Materializes the blob if it does not exist yet and the upload is
    /// idle. A record whose blob has been lost reports `Gone`.
    pub async fn head(&self, id: Uuid) -> Result<UploadRecord, UploadError> {
        let record = self.load(id).await?;

        match record.blob.clone() {
            Some(handle) => match self.inner.blobs.size(&handle).await {
                Ok(size) if size >= record.offset => {}
                Ok(size) => {
                    tracing::warn!(
                        upload_id = %id,
                        offset = record.offset,
                        blob_size = size,
                        "Blob is shorter than committed offset"
                    );
                    return Err(UploadError::Gone(id));
                }
                Err(BlobError::Missing(_)) => {
                    tracing::warn!(upload_id = %id, "Blob for upload is missing");
                    return Err(UploadError::Gone(id));
                }
                Err(e) => return Err(storage_error(id, e)),
            },
            None => {
                // A busy upload gets its blob from whoever holds the lock
                let Some(_guard) = self.inner.locks.try_lock(id) else {
                    return Ok(record);
                };

                let record = self.load(id).await?;
                if record.blob.is_none() {
                    if let Err(e) = self.inner.blobs.ensure(id).await {
                        tracing::warn!(upload_id = %id, error = %e, "Failed to materialize blob");
                        return Err(UploadError::Gone(id));
                    }
                }
                return Ok(record);
            }
        }

        Ok(record)
    }

    /// Lock-free snapshot of an upload, checked for writability
    ///
    /// Lets the transport reject a stale offset and bound the chunk it is
    /// about to read before receiving the body. Everything is checked again
    /// under the lock by `patch_chunk`.
    pub async fn chunk_allowance(
        &self,
        id: Uuid,
        offset: u64,
        upload_length: Option<u64>,
    ) -> Result<u64, UploadError> {
        let record = self.load(id).await?;
        state_machine::ensure_writable(&record, Utc::now())?;

        if offset != record.offset {
            return Err(offset_conflict(offset, record.offset));
        }

        match (record.remaining(), upload_length) {
            (Some(remaining), _) => Ok(remaining),
            (None, Some(length)) => {
                self.check_declared_length(&record, length)?;
                Ok(length - record.offset)
            }
            (None, None) => Ok(self.inner.settings.max_size.saturating_sub(record.offset)),
        }
    }

    // ========================================================================
    // Patch
    // ========================================================================

    /// Append one chunk at the client's offset
    ///
    /// Runs to completion on its own task so that a caller that goes away
    /// mid-write cannot leave the upload stuck in `Saving`.
    pub async fn patch_chunk(&self, write: ChunkWrite) -> Result<UploadRecord, UploadError> {
        let engine = self.clone();
        tokio::spawn(async move { engine.patch_chunk_locked(write).await })
            .await
            .map_err(|e| UploadError::Internal(format!("chunk write task failed: {}", e)))?
    }

    async fn patch_chunk_locked(&self, write: ChunkWrite) -> Result<UploadRecord, UploadError> {
        let id = write.id;
        let _guard = self.inner.locks.lock(id).await;

        let mut record = self.load_for_update(id).await?;
        state_machine::ensure_writable(&record, Utc::now())?;

        if write.offset != record.offset {
            return Err(offset_conflict(write.offset, record.offset));
        }

        let chunk_len = write.data.len() as u64;
        if let Some(declared) = write.declared_length {
            if declared != chunk_len {
                return Err(UploadError::BadRequest(format!(
                    "declared chunk length {} does not match {} bytes received",
                    declared, chunk_len
                )));
            }
        }

        if let Some(checksum) = &write.checksum {
            checksum.verify(&write.data)?;
        }

        // Repeating an already declared length is accepted so that a
        // rejected chunk can be retried verbatim
        let pending_length = match (record.length, write.upload_length) {
            (_, None) => None,
            (UploadLength::Known(existing), Some(length)) if existing == length => None,
            (UploadLength::Known(existing), Some(_)) => {
                return Err(UploadError::BadLength(format!(
                    "Upload-Length already declared as {}",
                    existing
                )));
            }
            (UploadLength::Deferred, Some(length)) => {
                self.check_declared_length(&record, length)?;
                Some(length)
            }
        };

        if write.data.is_empty() {
            return match pending_length {
                Some(length) => self.commit_length(record, length).await,
                None if write.upload_length.is_some() => Ok(record),
                None => Err(UploadError::EmptyChunk),
            };
        }

        let limit = pending_length
            .or(record.length.known())
            .unwrap_or(self.inner.settings.max_size);
        let new_offset = record.offset.checked_add(chunk_len).ok_or(UploadError::LengthExceeded {
            length: u64::MAX,
            max: limit,
        })?;
        if new_offset > limit {
            return Err(UploadError::LengthExceeded {
                length: new_offset,
                max: limit,
            });
        }

        let handle = self.materialize_blob(&mut record).await?;

        if record.state == UploadState::Initial {
            state_machine::apply(&mut record, Trigger::StartReceiving)?;
        }
        state_machine::apply(&mut record, Trigger::BeginSave)?;
        self.inner.repository.save(&record).await?;

        let appended = tokio::time::timeout(
            self.inner.settings.write_timeout,
            self.inner.blobs.append(&handle, record.offset, &write.data),
        )
        .await;

        let failure = match appended {
            Ok(Ok(_)) => None,
            Ok(Err(BlobError::OffsetConflict { expected, actual, .. })) => {
                Some(UploadError::Conflict(format!(
                    "concurrent write detected: expected blob at {} bytes, found {}",
                    expected, actual
                )))
            }
            Ok(Err(e)) => Some(storage_error(id, e)),
            Err(_) => Some(UploadError::Storage(format!(
                "chunk write timed out after {:?}",
                self.inner.settings.write_timeout
            ))),
        };

        if let Some(error) = failure {
            self.abort_write(&mut record, &handle).await;
            return Err(error);
        }

        record.offset = new_offset;
        if let Some(length) = pending_length {
            record.length = UploadLength::Known(length);
        }

        tracing::debug!(
            upload_id = %id,
            chunk_len,
            offset = record.offset,
            length = ?record.length.known(),
            "Chunk committed"
        );

        if record.is_complete() {
            self.complete(&mut record).await?;
        } else {
            state_machine::apply(&mut record, Trigger::EndSave)?;
            self.inner.repository.save(&record).await?;
        }

        Ok(record)
    }

    // ========================================================================
    // Declare Length
    // ========================================================================

    /// Fix the length of a deferred-length upload
    pub async fn declare_length(&self, id: Uuid, length: u64) -> Result<UploadRecord, UploadError> {
        let _guard = self.inner.locks.lock(id).await;

        let record = self.load_for_update(id).await?;
        state_machine::ensure_writable(&record, Utc::now())?;

        if let UploadLength::Known(existing) = record.length {
            return Err(UploadError::BadLength(format!(
                "Upload-Length already declared as {}",
                existing
            )));
        }

        self.check_declared_length(&record, length)?;
        self.commit_length(record, length).await
    }

    fn check_declared_length(&self, record: &UploadRecord, length: u64) -> Result<(), UploadError> {
        if length < record.offset {
            return Err(UploadError::BadLength(format!(
                "Upload-Length {} is smaller than current offset {}",
                length, record.offset
            )));
        }
        self.check_max_size(length)
    }

    async fn commit_length(&self, mut record: UploadRecord, length: u64) -> Result<UploadRecord, UploadError> {
        record.length = UploadLength::Known(length);
        record.updated_at = Utc::now();
        self.inner.repository.save(&record).await?;

        tracing::info!(upload_id = %record.id, length, offset = record.offset, "Declared upload length");

        if record.is_complete() {
            self.complete(&mut record).await?;
        }

        Ok(record)
    }

    // ========================================================================
    // Terminate
    // ========================================================================

    /// Delete an upload and its blob
    ///
    /// Refuses with `Conflict` while a chunk write is in flight. A repeated
    /// terminate reports `NotFound`.
    pub async fn terminate(&self, id: Uuid) -> Result<(), UploadError> {
        let _guard = match self.inner.locks.try_lock(id) {
            Some(guard) => guard,
            None => {
                if let Some(snapshot) = self.inner.repository.load(id).await? {
                    if snapshot.state == UploadState::Saving {
                        return Err(UploadError::Conflict(format!(
                            "Unable to terminate upload while in state \"{}\"",
                            snapshot.state
                        )));
                    }
                }
                self.inner.locks.lock(id).await
            }
        };

        let mut record = self.load_for_update(id).await?;
        state_machine::apply(&mut record, Trigger::Terminate)?;

        self.release(&record).await?;

        tracing::info!(upload_id = %id, offset = record.offset, "Terminated upload");
        self.publish(UploadEvent::Terminated(id));

        Ok(())
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Remove non-terminal uploads whose expiry is before `now`
    ///
    /// Uploads locked by a running operation are skipped and picked up by
    /// the next sweep.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, UploadError> {
        let candidates = self.inner.repository.scan_expired(now).await?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let id = candidate.id;
            let Some(_guard) = self.inner.locks.try_lock(id) else {
                tracing::debug!(upload_id = %id, "Upload busy, deferring expiry");
                report.deferred += 1;
                continue;
            };

            match self.expire_locked(id, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(upload_id = %id, error = %e, "Failed to expire upload");
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.expired,
                deferred = report.deferred,
                failed = report.failed,
                active_locks = self.inner.locks.len(),
                "Expiry sweep finished"
            );
        }

        Ok(report)
    }

    async fn expire_locked(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, UploadError> {
        let mut record = match self.load_for_update(id).await {
            Ok(record) => record,
            Err(UploadError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        if record.state.is_terminal() || !record.is_expired(now) {
            return Ok(false);
        }

        state_machine::apply(&mut record, Trigger::Expire)?;
        self.release(&record).await?;

        tracing::info!(
            upload_id = %id,
            offset = record.offset,
            expires_at = ?record.expires_at,
            "Expired upload"
        );
        self.publish(UploadEvent::Expired(id));

        Ok(true)
    }

    /// Start background expiry task
    pub fn start_expiry_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                if let Err(e) = engine.expire_sweep(Utc::now()).await {
                    tracing::error!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, id: Uuid) -> Result<UploadRecord, UploadError> {
        self.inner
            .repository
            .load(id)
            .await?
            .ok_or(UploadError::NotFound(id))
    }

    /// Load under the record lock, repairing interrupted writes
    ///
    /// With the lock held no write can be in flight, so a `Saving` record
    /// was left by a crashed write and is rolled back to its committed
    /// offset. A record whose bytes are all in but which never reached
    /// `Finished` is completed.
    async fn load_for_update(&self, id: Uuid) -> Result<UploadRecord, UploadError> {
        let mut record = self.load(id).await?;

        if record.state == UploadState::Saving {
            tracing::warn!(
                upload_id = %id,
                offset = record.offset,
                "Rolling back interrupted chunk write"
            );
            if let Some(handle) = record.blob.clone() {
                match self.inner.blobs.truncate(&handle, record.offset).await {
                    Ok(()) | Err(BlobError::Missing(_)) => {}
                    Err(e) => return Err(storage_error(id, e)),
                }
            }
            state_machine::apply(&mut record, Trigger::EndSave)?;
            self.inner.repository.save(&record).await?;
        }

        if matches!(record.state, UploadState::Initial | UploadState::Receiving) && record.is_complete() {
            self.complete(&mut record).await?;
        }

        Ok(record)
    }

    /// Ensure the blob exists and holds exactly `record.offset` bytes
    async fn materialize_blob(&self, record: &mut UploadRecord) -> Result<BlobHandle, UploadError> {
        let id = record.id;
        let handle = match &record.blob {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.inner.blobs.ensure(id).await.map_err(|e| storage_error(id, e))?;
                record.blob = Some(handle.clone());
                handle
            }
        };

        let size = match self.inner.blobs.size(&handle).await {
            Ok(size) => size,
            Err(BlobError::Missing(_)) => return Err(UploadError::Gone(id)),
            Err(e) => return Err(storage_error(id, e)),
        };

        if size < record.offset {
            tracing::warn!(upload_id = %id, offset = record.offset, blob_size = size, "Blob lost committed bytes");
            return Err(UploadError::Gone(id));
        }

        if size > record.offset {
            tracing::warn!(
                upload_id = %id,
                offset = record.offset,
                blob_size = size,
                "Discarding uncommitted bytes"
            );
            self.inner
                .blobs
                .truncate(&handle, record.offset)
                .await
                .map_err(|e| storage_error(id, e))?;
        }

        Ok(handle)
    }

    /// Undo a failed append: blob back to the committed offset, state back
    /// to `Receiving`
    async fn abort_write(&self, record: &mut UploadRecord, handle: &BlobHandle) {
        let id = record.id;

        if let Err(e) = self.inner.blobs.truncate(handle, record.offset).await {
            tracing::error!(upload_id = %id, error = %e, "Failed to truncate blob after aborted write");
        }

        if let Err(e) = state_machine::apply(record, Trigger::EndSave) {
            tracing::error!(upload_id = %id, error = %e, "Failed to leave saving state");
            return;
        }

        if let Err(e) = self.inner.repository.save(record).await {
            // Next locked access sees `Saving` and rolls back again
            tracing::error!(upload_id = %id, error = %e, "Failed to persist rollback");
        }

        tracing::warn!(upload_id = %id, offset = record.offset, "Chunk write aborted");
    }

    /// Finalize the blob and move the record to `Finished`
    async fn complete(&self, record: &mut UploadRecord) -> Result<(), UploadError> {
        let id = record.id;

        let handle = match &record.blob {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.inner.blobs.ensure(id).await.map_err(|e| storage_error(id, e))?;
                record.blob = Some(handle.clone());
                handle
            }
        };

        if let Err(e) = self.inner.blobs.finalize(&handle).await {
            if record.state == UploadState::Saving {
                state_machine::apply(record, Trigger::EndSave)?;
            }
            self.inner.repository.save(record).await?;
            return Err(storage_error(id, e));
        }

        state_machine::apply(record, Trigger::Complete)?;
        self.inner.repository.save(record).await?;

        tracing::info!(
            upload_id = %id,
            length = record.offset,
            filename = ?record.filename,
            "Upload finished"
        );
        self.publish(UploadEvent::Finished(record.clone()));

        Ok(())
    }

    /// Delete blob and record of an upload leaving the system
    async fn release(&self, record: &UploadRecord) -> Result<(), UploadError> {
        let handle = record
            .blob
            .clone()
            .unwrap_or_else(|| BlobHandle::for_upload(record.id));

        self.inner
            .blobs
            .delete(&handle)
            .await
            .map_err(|e| storage_error(record.id, e))?;
        self.inner.repository.delete(record.id).await?;

        Ok(())
    }

    fn check_max_size(&self, length: u64) -> Result<(), UploadError> {
        let max = self.inner.settings.max_size;
        if length > max {
            return Err(UploadError::LengthExceeded { length, max });
        }
        Ok(())
    }

    fn publish(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

fn offset_conflict(client: u64, current: u64) -> UploadError {
    UploadError::Conflict(format!(
        "Upload-Offset {} does not match current offset {}",
        client, current
    ))
}

fn storage_error(id: Uuid, e: BlobError) -> UploadError {
    tracing::error!(upload_id = %id, error = %e, "Blob storage failure");
    UploadError::Storage(e.to_string())
}

// ============================================================================
// Tests
// ============================================================================
