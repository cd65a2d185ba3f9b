//! Completion hook
//!
//! Notified once per upload, when its last byte has been stored. The hook
//! receives the assembled file and the client metadata, and decides where the
//! artifact finally lives.

use crate::protocol::UploadMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fallback file name when the client supplied no usable `name` metadata
pub const DEFAULT_FILE_NAME: &str = "uploaded_file";

/// Completion hook failure
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<std::io::Error> for HookError {
    fn from(err: std::io::Error) -> Self {
        HookError(err.to_string())
    }
}

/// Handler invoked when an upload reaches its declared length
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, artifact: &Path, metadata: &UploadMetadata)
        -> Result<(), HookError>;
}

#[async_trait]
impl<F> CompletionHook for F
where
    F: Fn(&Path, &UploadMetadata) -> Result<(), HookError> + Send + Sync,
{
    async fn on_complete(
        &self,
        artifact: &Path,
        metadata: &UploadMetadata,
    ) -> Result<(), HookError> {
        self(artifact, metadata)
    }
}

/// Copies finished uploads into a directory under their client-supplied name
#[derive(Debug, Clone)]
pub struct CopyToDirectoryHook {
    target_dir: PathBuf,
}

impl CopyToDirectoryHook {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
        }
    }

    /// Destination for an upload carrying `metadata`.
    ///
    /// Only the final path component of `name` is used so a client cannot
    /// write outside the target directory. Names that look like metadata
    /// side-cars fall back to the default.
    pub fn destination(&self, metadata: &UploadMetadata) -> PathBuf {
        let name = metadata
            .get("name")
            .or_else(|| metadata.get("filename"))
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .filter(|n| !n.ends_with(".info") && !n.ends_with(".info.tmp"))
            .unwrap_or(DEFAULT_FILE_NAME);
        self.target_dir.join(name)
    }
}

#[async_trait]
impl CompletionHook for CopyToDirectoryHook {
    async fn on_complete(
        &self,
        artifact: &Path,
        metadata: &UploadMetadata,
    ) -> Result<(), HookError> {
        let destination = self.destination(metadata);

        match tokio::fs::copy(artifact, &destination).await {
            Ok(bytes) => {
                tracing::info!(
                    source = %artifact.display(),
                    destination = %destination.display(),
                    bytes = bytes,
                    "Reassembled upload"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    source = %artifact.display(),
                    destination = %destination.display(),
                    error = %e,
                    "Error reassembling upload"
                );
                Err(e.into())
            }
        }
    }
}
