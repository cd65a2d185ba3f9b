//! Upload session manager
//!
//! Owns the upload lifecycle: creation, offset-checked appends, completion and
//! termination.
//!
//! Appends and deletes on the same upload id are serialized through a
//! per-id async mutex, so two concurrent chunks can never both be accepted at
//! the same offset. Different uploads never share a lock, and a lock's table
//! entry lives only while some task holds or waits on it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use tus_uploadr::config::TusConfig;
//! use tus_uploadr::protocol::UploadMetadata;
//! use tus_uploadr::store::FileMetadataStore;
//! use tus_uploadr::upload::{CopyToDirectoryHook, SessionManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TusConfig::default();
//! let store = Arc::new(FileMetadataStore::new(&config.storage_dir));
//! let hook = Arc::new(CopyToDirectoryHook::new("./public"));
//! let sessions = SessionManager::new(&config, store, hook);
//!
//! let status = sessions.create_session(Some(5), UploadMetadata::new()).await?;
//! let body = futures::stream::iter(vec![Ok(Bytes::from("hello"))]);
//! let status = sessions.append_chunk(&status.id, 0, body, None).await?;
//! assert!(status.completed);
//! # Ok(())
//! # }
//! ```

use super::chunk_writer::{ChunkWriteError, ChunkWriter};
use super::hook::CompletionHook;
use super::UploadError;
use crate::config::TusConfig;
use crate::metrics;
use crate::protocol::UploadMetadata;
use crate::store::{MetadataStore, StoreError, UploadRecord};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::{FutureExt, Stream};
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::Instrument;

/// Snapshot of an upload as last committed
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub id: String,
    pub offset: u64,
    /// `None` while the length is deferred
    pub length: Option<u64>,
    pub metadata: UploadMetadata,
    pub completed: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&UploadRecord> for SessionStatus {
    fn from(record: &UploadRecord) -> Self {
        Self {
            id: record.id.clone(),
            offset: record.offset,
            length: record.length,
            metadata: record.metadata.clone(),
            completed: record.is_complete(),
            expires_at: record.expires_at,
        }
    }
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Exclusive hold on one upload id.
///
/// Dropping the lease unlocks the id and removes its table entry when no
/// other task is holding or waiting on it.
struct UploadLease {
    locks: Arc<LockTable>,
    id: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UploadLease {
    fn drop(&mut self) {
        self.guard.take();
        let mutex = &self.mutex;
        // Two references left means only the table and this lease know the mutex
        self.locks.remove_if(&self.id, |_, entry| {
            Arc::ptr_eq(entry, mutex) && Arc::strong_count(entry) == 2
        });
    }
}

/// Owned handles for the commit step, which must finish even if the request
/// that started it goes away
#[derive(Clone)]
struct Committer {
    store: Arc<dyn MetadataStore>,
    writer: ChunkWriter,
    hook: Arc<dyn CompletionHook>,
}

impl Committer {
    /// Persist the advanced offset and complete the upload once it reaches its length
    async fn commit(
        &self,
        mut record: UploadRecord,
        committed: u64,
        written: u64,
    ) -> Result<UploadRecord, UploadError> {
        if let Err(e) = self.store.save(&record).await {
            // Keep the data file in step with the last committed offset
            let path = self.writer.data_path(&record.id);
            if let Err(rollback) = self.writer.truncate(&path, committed).await {
                tracing::error!(upload.id = %record.id, error = %rollback, "Failed to roll back chunk");
            }
            metrics::record_error("storage");
            return Err(e.into());
        }

        metrics::record_chunk_written(written);
        tracing::debug!(
            upload.id = %record.id,
            upload.offset = record.offset,
            upload.length = ?record.length,
            "Chunk committed"
        );

        if record.length == Some(record.offset) && !record.is_complete() {
            self.finalize(&mut record).await?;
        }
        Ok(record)
    }

    /// Mark the upload complete, then run the hook
    async fn finalize(&self, record: &mut UploadRecord) -> Result<(), UploadError> {
        record.completed_at = Some(Utc::now());
        self.store.save(record).await?;

        let record: &UploadRecord = record;
        self.run_hook(record, &record.metadata).await
    }

    async fn run_hook(
        &self,
        record: &UploadRecord,
        metadata: &UploadMetadata,
    ) -> Result<(), UploadError> {
        let path = self.writer.data_path(&record.id);
        let outcome = AssertUnwindSafe(self.hook.on_complete(&path, metadata))
            .catch_unwind()
            .await;

        let reason = match outcome {
            Ok(Ok(())) => {
                metrics::record_upload_completed(record.offset);
                tracing::info!(
                    upload.id = %record.id,
                    upload.length = record.offset,
                    "Upload complete"
                );
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "completion hook panicked".to_string(),
        };

        metrics::record_hook_failure();
        tracing::error!(
            upload.id = %record.id,
            artifact = %path.display(),
            error = %reason,
            "Completion hook failed; artifact kept for manual recovery"
        );
        Err(UploadError::FinalizationError {
            id: record.id.clone(),
            offset: record.offset,
            reason,
        })
    }
}

/// Resumable upload state machine
pub struct SessionManager {
    store: Arc<dyn MetadataStore>,
    writer: ChunkWriter,
    hook: Arc<dyn CompletionHook>,
    locks: Arc<LockTable>,
    max_size: Option<u64>,
    expiry: Option<Duration>,
}

impl SessionManager {
    /// Create a manager storing data files under `config.storage_dir`
    pub fn new(
        config: &TusConfig,
        store: Arc<dyn MetadataStore>,
        hook: Arc<dyn CompletionHook>,
    ) -> Self {
        Self {
            store,
            writer: ChunkWriter::new(&config.storage_dir),
            hook,
            locks: Arc::new(DashMap::new()),
            max_size: config.max_size,
            expiry: config
                .expiry_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(Duration::try_seconds),
        }
    }

    /// Largest accepted upload, if limited
    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// Path of the data file backing `id`
    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.writer.data_path(id)
    }

    /// Start a new upload.
    ///
    /// A declared length of zero completes the upload immediately.
    #[tracing::instrument(
        name = "upload.create",
        skip(self, metadata),
        fields(upload.id = tracing::field::Empty),
        err
    )]
    pub async fn create_session(
        &self,
        declared_length: Option<u64>,
        metadata: UploadMetadata,
    ) -> Result<SessionStatus, UploadError> {
        if let (Some(length), Some(max)) = (declared_length, self.max_size) {
            if length > max {
                return Err(UploadError::SizeLimitExceeded { max });
            }
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::Span::current().record("upload.id", id.as_str());

        let now = Utc::now();
        let expires_at = self.expiry.and_then(|ttl| now.checked_add_signed(ttl));
        let record = UploadRecord::new(&id, declared_length, metadata, now, expires_at);

        let path = self.writer.data_path(&id);
        self.writer
            .create(&path)
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;

        if let Err(e) = self.store.save(&record).await {
            let _ = self.writer.remove(&path).await;
            return Err(e.into());
        }

        metrics::record_upload_created();
        tracing::info!(
            upload.id = %id,
            upload.length = ?declared_length,
            "Upload created"
        );

        if declared_length == Some(0) {
            let lease = self.lock(&id).await;
            let committer = self.committer();
            let record = detach(lease, async move {
                let mut record = record;
                committer.finalize(&mut record).await?;
                Ok::<_, UploadError>(record)
            })
            .await?;
            return Ok(SessionStatus::from(&record));
        }

        Ok(SessionStatus::from(&record))
    }

    /// Current committed state of an upload
    pub async fn get_status(&self, id: &str) -> Result<SessionStatus, UploadError> {
        let record = self.load_live(id).await?;
        Ok(SessionStatus::from(&record))
    }

    /// Append `payload` at `expected_offset`.
    ///
    /// `declares_length` fixes a deferred length; it must agree with any
    /// length already known. When the new offset reaches the length, the
    /// upload is completed and the completion hook runs before this returns.
    /// Once the bytes are on disk, committing them and running the hook
    /// carry on even if the caller stops waiting.
    #[tracing::instrument(
        name = "upload.append",
        skip(self, payload),
        fields(upload.bytes_written = tracing::field::Empty),
        err
    )]
    pub async fn append_chunk<S>(
        &self,
        id: &str,
        expected_offset: u64,
        payload: S,
        declares_length: Option<u64>,
    ) -> Result<SessionStatus, UploadError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let lease = self.lock(id).await;

        let mut record = self.load_live(id).await?;

        if record.offset != expected_offset {
            metrics::record_offset_conflict();
            return Err(UploadError::OffsetConflict {
                expected: expected_offset,
                current: record.offset,
            });
        }

        if let Some(declared) = declares_length {
            self.check_declared_length(&record, declared)?;
            record.length = Some(declared);
        }

        let limit = match (record.length, self.max_size) {
            (Some(length), _) => Some(length - record.offset),
            (None, Some(max)) => Some(max.saturating_sub(record.offset)),
            (None, None) => None,
        };

        let path = self.writer.data_path(id);
        let written = match self.writer.write_at(&path, record.offset, payload, limit).await {
            Ok(written) => written,
            Err(ChunkWriteError::LimitExceeded { .. }) => {
                return Err(match (record.length, self.max_size) {
                    (None, Some(max)) => UploadError::SizeLimitExceeded { max },
                    _ => UploadError::InvalidArgument(format!(
                        "chunk exceeds declared upload length of {} bytes",
                        record.length.unwrap_or_default()
                    )),
                });
            }
            Err(ChunkWriteError::Payload(e)) => {
                tracing::warn!(upload.id = %id, error = %e, "Chunk discarded");
                return Err(UploadError::PayloadInterrupted(e.to_string()));
            }
            Err(ChunkWriteError::Storage(e)) => {
                metrics::record_error("storage");
                return Err(UploadError::StorageError(e.to_string()));
            }
        };
        tracing::Span::current().record("upload.bytes_written", written);

        let committed = record.offset;
        record.offset += written;

        let committer = self.committer();
        let record = detach(lease, async move {
            committer.commit(record, committed, written).await
        })
        .await?;

        Ok(SessionStatus::from(&record))
    }

    /// Run the completion hook again for a finished upload.
    ///
    /// Recovery path for uploads whose hook failed or was interrupted. `name`
    /// replaces the `name` metadata handed to the hook; the stored record is
    /// left as is.
    #[tracing::instrument(name = "upload.refinalize", skip(self), err)]
    pub async fn refinalize(
        &self,
        id: &str,
        name: Option<&str>,
    ) -> Result<SessionStatus, UploadError> {
        let lease = self.lock(id).await;
        let record = self.load_live(id).await?;

        if !record.is_complete() {
            return Err(UploadError::InvalidArgument(format!(
                "upload {} is not complete: {} of {} bytes received",
                id,
                record.offset,
                record
                    .length
                    .map_or_else(|| "unknown".to_string(), |l| l.to_string())
            )));
        }

        let mut metadata = record.metadata.clone();
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            metadata.insert("name", name);
        }

        let committer = self.committer();
        let record = detach(lease, async move {
            committer.run_hook(&record, &metadata).await?;
            Ok::<_, UploadError>(record)
        })
        .await?;

        tracing::info!(upload.id = %id, "Upload finalized again");
        Ok(SessionStatus::from(&record))
    }

    /// Remove an upload's record and data file. Unknown ids are ignored.
    #[tracing::instrument(name = "upload.delete", skip(self), err)]
    pub async fn delete_session(&self, id: &str) -> Result<(), UploadError> {
        let _lease = self.lock(id).await;

        self.writer
            .remove(&self.writer.data_path(id))
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;
        self.store.delete(id).await?;

        tracing::info!(upload.id = %id, "Upload terminated");
        Ok(())
    }

    /// Delete every unfinished upload past its expiry, returning how many were removed
    pub async fn sweep_expired(&self) -> Result<usize, UploadError> {
        let now = Utc::now();
        let mut removed = 0;

        for id in self.store.list_ids().await? {
            let expired = match self.store.load(&id).await {
                Ok(record) => record.is_expired(now),
                Err(StoreError::NotFound(_)) => false,
                Err(e) => {
                    tracing::warn!(upload.id = %id, error = %e, "Skipping unreadable record");
                    false
                }
            };

            if expired {
                self.delete_session(&id).await?;
                metrics::record_upload_expired();
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Expired uploads swept");
        }
        Ok(removed)
    }

    async fn lock(&self, id: &str) -> UploadLease {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let mut lease = UploadLease {
            locks: Arc::clone(&self.locks),
            id: id.to_string(),
            mutex,
            guard: None,
        };
        lease.guard = Some(Arc::clone(&lease.mutex).lock_owned().await);
        lease
    }

    fn committer(&self) -> Committer {
        Committer {
            store: Arc::clone(&self.store),
            writer: self.writer.clone(),
            hook: Arc::clone(&self.hook),
        }
    }

    async fn load_live(&self, id: &str) -> Result<UploadRecord, UploadError> {
        let record = self.store.load(id).await?;
        if record.is_expired(Utc::now()) {
            return Err(UploadError::Expired(id.to_string()));
        }
        Ok(record)
    }

    fn check_declared_length(&self, record: &UploadRecord, declared: u64) -> Result<(), UploadError> {
        if let Some(existing) = record.length {
            if existing != declared {
                return Err(UploadError::InvalidArgument(format!(
                    "upload length already set to {}, got {}",
                    existing, declared
                )));
            }
        }
        if declared < record.offset {
            return Err(UploadError::InvalidArgument(format!(
                "upload length {} is below current offset {}",
                declared, record.offset
            )));
        }
        if let Some(max) = self.max_size {
            if declared > max {
                return Err(UploadError::SizeLimitExceeded { max });
            }
        }
        Ok(())
    }
}

/// Run `work` on its own task while holding `lease`, and wait for it.
///
/// Dropping the returned future does not cancel `work`; the lease is held
/// until it finishes.
async fn detach<T, F>(lease: UploadLease, work: F) -> Result<T, UploadError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, UploadError>> + Send + 'static,
{
    let task = async move {
        let _lease = lease;
        work.await
    };

    tokio::spawn(task.instrument(tracing::Span::current()))
        .await
        .map_err(|e| UploadError::StorageError(format!("upload task failed: {}", e)))?
}
