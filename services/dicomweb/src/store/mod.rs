//! Object storage with atomic put and compare-and-swap.
//!
//! Correctness of concurrent ingestion rests only on the two write
//! primitives here: `put` replaces an object atomically (readers see the old
//! or the new bytes, never a mix) and `put_if` replaces it only when the
//! stored version is still the one the caller read.

mod local;
mod memory;
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use crate::config::{StorageBackend, StorageConfig};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("version conflict writing {key}")]
    Conflict { key: String },

    #[error("invalid object key {key:?}")]
    InvalidKey { key: String },

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error on {key}: {message}")]
    Backend { key: String, message: String },
}

impl ObjectStoreError {
    pub fn key(&self) -> &str {
        match self {
            ObjectStoreError::NotFound { key }
            | ObjectStoreError::Conflict { key }
            | ObjectStoreError::InvalidKey { key }
            | ObjectStoreError::Io { key, .. }
            | ObjectStoreError::Backend { key, .. } => key,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ObjectStoreError::Conflict { .. })
    }

    /// I/O and backend failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Io { .. } | ObjectStoreError::Backend { .. }
        )
    }

    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            ObjectStoreError::NotFound {
                key: key.to_string(),
            }
        } else {
            ObjectStoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// Opaque version token of a stored object (content hash, ETag or counter).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion(pub String);

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub version: ObjectVersion,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError>;

    /// Atomically create or replace `key`.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, ObjectStoreError>;

    /// Write `key` only if its current version is `expected`; `None` means
    /// the object must not exist yet. Fails with `Conflict` otherwise.
    async fn put_if(
        &self,
        key: &str,
        bytes: Bytes,
        expected: Option<&ObjectVersion>,
    ) -> Result<ObjectVersion, ObjectStoreError>;

    /// Names of the immediate children under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Remove `key`; removing a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Open the configured backend.
pub async fn open(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::Local => {
            let store = LocalStore::new(&config.root_dir, config.guard_lease())
                .await
                .with_context(|| format!("Failed to open {}", config.root_dir.display()))?;
            info!(root = %config.root_dir.display(), "Local object store opened");
            Arc::new(store)
        }
        StorageBackend::S3 => Arc::new(
            S3Store::new(&config.s3)
                .await
                .context("Failed to initialize S3 object store")?,
        ),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

/// Content type and encoding to serve an object with, from its key.
pub(crate) fn object_headers(key: &str) -> (&'static str, Option<&'static str>) {
    if key.ends_with(".json.zst") {
        ("application/dicom+json", Some("zstd"))
    } else if key.ends_with(crate::layout::THUMBNAIL) {
        ("image/jpeg", None)
    } else if key.ends_with(".zst") {
        ("application/octet-stream", Some("zstd"))
    } else {
        ("application/octet-stream", None)
    }
}
