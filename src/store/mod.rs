//! Upload metadata persistence
//!
//! Each upload has one [`UploadRecord`] describing its declared length,
//! committed offset and client metadata. Records live apart from the byte
//! content so session state survives a restart.

use crate::protocol::UploadMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;

pub use file::FileMetadataStore;

/// Metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record for {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Durable side-car state of one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    /// Declared total size; `None` while the length is deferred
    pub length: Option<u64>,
    /// Bytes durably stored
    pub offset: u64,
    #[serde(default)]
    pub metadata: UploadMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    /// Fresh record with nothing received yet
    pub fn new(
        id: impl Into<String>,
        length: Option<u64>,
        metadata: UploadMetadata,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            length,
            offset: 0,
            metadata,
            created_at,
            expires_at,
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// True when an unfinished upload has outlived its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete() && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key-value persistence of upload records
///
/// Same-key calls are serialized by the session manager, so implementations
/// only need atomic writes, not locking.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a record, replacing any previous version
    async fn save(&self, record: &UploadRecord) -> Result<(), StoreError>;

    /// Load the record for `id`
    async fn load(&self, id: &str) -> Result<UploadRecord, StoreError>;

    /// Remove the record for `id`; missing records are not an error
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Ids of every stored record
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}
