//! Offset-precise chunk writer
//!
//! Appends a streamed request body to an upload's data file. A write is
//! all-or-nothing: on any failure the file is truncated back to the offset
//! it started from.
//!
//! # Example
//!
//! ```no_run
//! use tus_uploadr::upload::ChunkWriter;
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let writer = ChunkWriter::new("./uploads");
//! let path = writer.data_path("0f3c9a");
//! writer.create(&path).await?;
//!
//! let payload = futures::stream::iter(vec![Ok(Bytes::from("hello"))]);
//! let written = writer.write_at(&path, 0, payload, None).await?;
//! assert_eq!(written, 5);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Chunk write errors
#[derive(Error, Debug)]
pub enum ChunkWriteError {
    /// Reading the incoming payload failed (client disconnect, bad framing)
    #[error("Payload error: {0}")]
    Payload(io::Error),

    #[error("Chunk exceeds remaining capacity of {limit} bytes")]
    LimitExceeded { limit: u64 },

    #[error("IO error: {0}")]
    Storage(#[from] io::Error),
}

/// Writes upload bytes below a storage root
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    root: PathBuf,
}

impl ChunkWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of the data file for `id`
    pub fn data_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Allocate an empty data file
    pub async fn create(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.sync_all().await
    }

    /// Remove a data file; a missing file is not an error
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Truncate the data file to `offset`, dropping uncommitted bytes
    pub async fn truncate(&self, path: &Path, offset: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(offset).await?;
        file.sync_data().await
    }

    /// Write `payload` at `offset` and return the number of bytes written.
    ///
    /// The caller guarantees `offset` is the committed end of the upload.
    /// Anything past it is a leftover of an interrupted write and is dropped
    /// first. When `limit` is set, a payload longer than `limit` bytes is
    /// rejected and nothing is kept.
    pub async fn write_at<S>(
        &self,
        path: &Path,
        offset: u64,
        payload: S,
        limit: Option<u64>,
    ) -> Result<u64, ChunkWriteError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        match Self::copy_payload(&mut file, payload, limit).await {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(rollback) = file.set_len(offset).await {
                    tracing::error!(
                        path = %path.display(),
                        offset = offset,
                        error = %rollback,
                        "Failed to roll back partial chunk"
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_payload<S>(
        file: &mut File,
        mut payload: S,
        limit: Option<u64>,
    ) -> Result<u64, ChunkWriteError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut written: u64 = 0;

        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(ChunkWriteError::Payload)?;
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            if let Some(limit) = limit {
                if written + len > limit {
                    return Err(ChunkWriteError::LimitExceeded { limit });
                }
            }

            file.write_all(&chunk).await?;
            written += len;
        }

        file.flush().await?;
        file.sync_data().await?;
        Ok(written)
    }
}
