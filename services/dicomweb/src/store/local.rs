use super::{ObjectStore, ObjectStoreError, ObjectVersion, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Filesystem backend rooted at a directory.
///
/// Puts go through a uniquely named temporary file in the target directory,
/// are fsynced, then renamed over the target. Compare-and-swap holds a
/// create-exclusive guard file next to the target for the read-compare-write
/// window; a guard older than the lease is treated as abandoned. Each guard
/// carries its holder's token and is only ever removed by that holder or by
/// a reclaim that still sees the abandoned token.
pub struct LocalStore {
    root: PathBuf,
    guard_lease: Duration,
}

impl LocalStore {
    pub async fn new(root: impl AsRef<Path>, guard_lease: Duration) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root, guard_lease })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the filesystem; components may not be empty, relative
    /// or hidden, which keeps every key inside the root.
    fn path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component.starts_with('.') || component.contains('\\') {
                return Err(ObjectStoreError::InvalidKey {
                    key: key.to_string(),
                });
            }
            path.push(component);
        }
        Ok(path)
    }

    async fn read(&self, key: &str, path: &Path) -> Result<Option<StoredObject>, ObjectStoreError> {
        match fs::read(path).await {
            Ok(data) => {
                let version = content_version(&data);
                Ok(Some(StoredObject {
                    bytes: Bytes::from(data),
                    version,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::io(key, e)),
        }
    }

    async fn write_atomic(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let (dir, name) = split(key, path)?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ObjectStoreError::io(key, e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(ObjectStoreError::Io {
                key: key.to_string(),
                source: e,
            });
        }
        Ok(())
    }

    async fn acquire_guard(&self, key: &str, path: &Path) -> Result<Guard, ObjectStoreError> {
        let (dir, name) = split(key, path)?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ObjectStoreError::io(key, e))?;
        let guard_path = dir.join(format!(".{}.guard", name));
        let token = Uuid::new_v4().to_string();

        for _ in 0..3 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&guard_path)
                .await
            {
                Ok(mut file) => {
                    // From here on the guard is ours to remove.
                    let guard = Guard {
                        path: guard_path,
                        token,
                    };
                    file.write_all(guard.token.as_bytes())
                        .await
                        .map_err(|e| ObjectStoreError::io(key, e))?;
                    file.flush().await.map_err(|e| ObjectStoreError::io(key, e))?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match guard_state(&guard_path).await {
                        // Released between our attempt and the check.
                        None => continue,
                        Some((age, holder)) if age > self.guard_lease => {
                            warn!(key = %key, age_ms = age.as_millis() as u64, "Removing abandoned write guard");
                            reclaim(&guard_path, &holder).await;
                        }
                        Some(_) => {
                            return Err(ObjectStoreError::Conflict {
                                key: key.to_string(),
                            })
                        }
                    }
                }
                Err(e) => return Err(ObjectStoreError::io(key, e)),
            }
        }

        Err(ObjectStoreError::Conflict {
            key: key.to_string(),
        })
    }
}

/// Age and holder token of an existing guard.
async fn guard_state(guard: &Path) -> Option<(Duration, Vec<u8>)> {
    let modified = fs::metadata(guard).await.and_then(|m| m.modified()).ok()?;
    let holder = fs::read(guard).await.ok()?;
    Some((SystemTime::now().duration_since(modified).unwrap_or_default(), holder))
}

/// Delete an abandoned guard still held by `holder`. The guard is renamed
/// aside first so a guard re-created after the staleness check is never
/// deleted; one moved aside by mistake is linked back.
async fn reclaim(guard: &Path, holder: &[u8]) {
    let aside = guard.with_extension(format!("{}.stale", Uuid::new_v4()));
    if fs::rename(guard, &aside).await.is_err() {
        // Released or reclaimed by someone else.
        return;
    }
    match fs::read(&aside).await {
        Ok(found) if found == holder => {}
        _ => {
            if let Err(e) = fs::hard_link(&aside, guard).await {
                warn!(path = %guard.display(), error = %e, "Could not restore a live write guard");
            }
        }
    }
    let _ = fs::remove_file(&aside).await;
}

/// Removes the guard file when the compare-and-swap ends, including when
/// the surrounding future is dropped.
struct Guard {
    path: PathBuf,
    token: String,
}

impl Drop for Guard {
    fn drop(&mut self) {
        match std::fs::read(&self.path) {
            Ok(holder) if holder == self.token.as_bytes() => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %self.path.display(), error = %e, "Failed to release write guard");
                    }
                }
            }
            Ok(_) => warn!(path = %self.path.display(), "Write guard was reclaimed while held"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release write guard"),
        }
    }
}

fn split<'a>(key: &str, path: &'a Path) -> Result<(&'a Path, String), ObjectStoreError> {
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => Ok((dir, name.to_string_lossy().into_owned())),
        _ => Err(ObjectStoreError::InvalidKey {
            key: key.to_string(),
        }),
    }
}

fn content_version(data: &[u8]) -> ObjectVersion {
    let digest = Sha256::digest(data);
    ObjectVersion(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        let path = self.path(key)?;
        self.read(key, &path)
            .await?
            .ok_or_else(|| ObjectStoreError::NotFound {
                key: key.to_string(),
            })
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, ObjectStoreError> {
        let path = self.path(key)?;
        self.write_atomic(key, &path, &bytes).await?;
        debug!(key = %key, "Object written");
        Ok(content_version(&bytes))
    }

    #[instrument(skip(self, bytes, expected), fields(size = bytes.len()))]
    async fn put_if(
        &self,
        key: &str,
        bytes: Bytes,
        expected: Option<&ObjectVersion>,
    ) -> Result<ObjectVersion, ObjectStoreError> {
        let path = self.path(key)?;
        let _guard = self.acquire_guard(key, &path).await?;

        let current = self.read(key, &path).await?.map(|o| o.version);
        if current.as_ref() != expected {
            debug!(key = %key, "Compare-and-swap lost");
            return Err(ObjectStoreError::Conflict {
                key: key.to_string(),
            });
        }

        self.write_atomic(key, &path, &bytes).await?;
        Ok(content_version(&bytes))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let path = self.path(prefix)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ObjectStoreError::io(prefix, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ObjectStoreError::io(prefix, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::io(key, e)),
        }
    }
}
