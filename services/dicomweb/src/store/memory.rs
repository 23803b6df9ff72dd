use super::{ObjectStore, ObjectStoreError, ObjectVersion, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process store for tests and embedding. Versions are a global write
/// counter, so every write yields a fresh version.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, (Bytes, u64)>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    fn next_version(&self) -> u64 {
        self.writes.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        self.objects
            .read()
            .get(key)
            .map(|(bytes, version)| StoredObject {
                bytes: bytes.clone(),
                version: ObjectVersion(version.to_string()),
            })
            .ok_or_else(|| ObjectStoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, ObjectStoreError> {
        let version = self.next_version();
        self.objects.write().insert(key.to_string(), (bytes, version));
        Ok(ObjectVersion(version.to_string()))
    }

    async fn put_if(
        &self,
        key: &str,
        bytes: Bytes,
        expected: Option<&ObjectVersion>,
    ) -> Result<ObjectVersion, ObjectStoreError> {
        let mut objects = self.objects.write();
        let current = objects.get(key).map(|(_, v)| ObjectVersion(v.to_string()));
        if current.as_ref() != expected {
            return Err(ObjectStoreError::Conflict {
                key: key.to_string(),
            });
        }
        let version = self.next_version();
        objects.insert(key.to_string(), (bytes, version));
        Ok(ObjectVersion(version.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let objects = self.objects.read();
        let names: BTreeSet<String> = objects
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .filter_map(|(key, _)| key[dir.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.write().remove(key);
        Ok(())
    }
}
