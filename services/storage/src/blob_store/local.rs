use super::{bounded, validate_key, BlobEntry, BlobStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// Suffix of files still being written
const PARTIAL_SUFFIX: &str = ".partial";

/// Blob store mapping keys directly to files under a root directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    timeout: Duration,
}

impl LocalBlobStore {
    /// Create the store, creating the root directory if needed
    pub async fn new(root: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        info!(root = %root.display(), "Local blob store initialized");

        Ok(Self { root, timeout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, data), fields(key = %key, size_bytes = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        bounded(self.timeout, "local put", async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }

            // Readers never observe a half-written file
            let mut partial = path.clone().into_os_string();
            partial.push(PARTIAL_SUFFIX);
            let partial = PathBuf::from(partial);

            fs::write(&partial, &data).await?;
            fs::rename(&partial, &path).await?;

            debug!(path = %path.display(), "Blob written");
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        bounded(self.timeout, "local get", async {
            match fs::read(&path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(StorageError::NotFound(key.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        bounded(self.timeout, "local delete", async {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(key = %key, "Blob deleted");
                    Ok(true)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        // Walk from the deepest directory named by the prefix
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        if !dir_part.is_empty() {
            validate_key(dir_part)?;
        }
        let start = self.root.join(dir_part);
        let store = self.clone();
        let prefix = prefix.to_string();

        let walk = tokio::task::spawn_blocking(move || {
            if !start.exists() {
                return Ok(Vec::new());
            }

            let mut entries = Vec::new();
            for entry in WalkDir::new(&start) {
                let entry = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(key) = store.key_for(entry.path()) else {
                    continue;
                };
                if key.ends_with(PARTIAL_SUFFIX) || !key.starts_with(&prefix) {
                    continue;
                }
                let size = entry
                    .metadata()
                    .map_err(|e| StorageError::Backend(e.to_string()))?
                    .len();
                entries.push(BlobEntry { key, size });
            }
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(entries)
        });

        bounded(self.timeout, "local list", async {
            walk.await
                .map_err(|e| StorageError::Backend(format!("list task failed: {e}")))?
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}
