//! Filesystem metadata store
//!
//! Records are stored as `<root>/<id>.info` JSON files next to the data
//! files. Writes go to `<id>.info.tmp` first and are renamed into place, so a
//! crash never leaves a torn record behind.

use super::{MetadataStore, StoreError, UploadRecord};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

const INFO_SUFFIX: &str = ".info";
const TMP_SUFFIX: &str = ".info.tmp";

/// JSON side-car store rooted at the upload storage directory
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of the side-car for `id`
    pub fn info_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, INFO_SUFFIX))
    }

    fn tmp_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, TMP_SUFFIX))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn save(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            id: record.id.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.tmp_path(&record.id);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.info_path(&record.id)).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<UploadRecord, StoreError> {
        let body = match tokio::fs::read(self.info_path(id)).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        for path in [self.info_path(id), self.tmp_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(INFO_SUFFIX)) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}
