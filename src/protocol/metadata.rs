//! `Upload-Metadata` codec
//!
//! The header carries comma-separated pairs; each pair is a key, a single
//! space and the base64 encoded value. A key may also appear on its own, in
//! which case its value is the empty string.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata parsing errors
#[derive(Error, Debug, PartialEq)]
pub enum MetadataError {
    #[error("Empty metadata key")]
    EmptyKey,

    #[error("Invalid metadata key '{0}'")]
    InvalidKey(String),

    #[error("Duplicate metadata key '{0}'")]
    DuplicateKey(String),

    #[error("Invalid base64 value for key '{0}'")]
    InvalidEncoding(String),

    #[error("Value for key '{0}' is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Client-supplied key/value attributes of an upload, in the order sent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadMetadata(IndexMap<String, String>);

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value
    pub fn parse(header: &str) -> Result<Self, MetadataError> {
        let mut entries = IndexMap::new();

        for pair in header.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default();
            let encoded = parts.next().map(str::trim).unwrap_or_default();

            if key.is_empty() {
                return Err(MetadataError::EmptyKey);
            }
            if !key.chars().all(|c| c.is_ascii_graphic() && c != ',') {
                return Err(MetadataError::InvalidKey(key.to_string()));
            }

            let value = if encoded.is_empty() {
                String::new()
            } else {
                let raw = STANDARD
                    .decode(encoded)
                    .map_err(|_| MetadataError::InvalidEncoding(key.to_string()))?;
                String::from_utf8(raw).map_err(|_| MetadataError::InvalidUtf8(key.to_string()))?
            };

            if entries.insert(key.to_string(), value).is_some() {
                return Err(MetadataError::DuplicateKey(key.to_string()));
            }
        }

        Ok(Self(entries))
    }

    /// Render as an `Upload-Metadata` header value
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set `key`, keeping its position if already present
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UploadMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
