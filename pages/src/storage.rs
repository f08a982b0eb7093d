use crate::config::Page;
use crate::errors::{ConfigError, StorageError};
use crate::index::PageIndex;
use crate::metrics_defs::STORAGE_UPLOAD_BYTES;
use crate::s3::S3Backend;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Upper bound on concurrent object uploads per `upload_tree` call.
const UPLOAD_CONCURRENCY: usize = 10;

/// Contract for the object-storage collaborator.
///
/// The wire protocol behind it is not this crate's concern; anything that can
/// fetch and store keyed blobs with a content type satisfies the serve and
/// ingest paths.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Reads an object. `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Writes an object, overwriting any previous value.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError>;
}

/// In-memory backend for tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn content_type_of(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.objects.read().get(key).map(|(data, _)| data.clone()))
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }
}

/// Per-tenant view of object storage: the artifact tree and the page index
/// for one repository.
#[derive(Clone)]
pub struct PageStore {
    backend: Arc<dyn ObjectBackend>,
    repository: String,
}

impl PageStore {
    /// Builds a store speaking to the page's configured bucket.
    pub fn for_page(page: &Page) -> Result<Self, ConfigError> {
        let backend = S3Backend::from_bucket(&page.bucket)?;
        Ok(PageStore {
            backend: Arc::new(backend),
            repository: page.git.repository.clone(),
        })
    }

    pub fn with_backend(backend: Arc<dyn ObjectBackend>, repository: impl Into<String>) -> Self {
        PageStore {
            backend,
            repository: repository.into(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Uploads every regular file below `local_root` to
    /// `<remote_prefix>/<relative path>` (forward slashes always), with at
    /// most [`UPLOAD_CONCURRENCY`] uploads in flight.
    ///
    /// The first error observed fails the whole operation; uploads already in
    /// flight finish on their own but their results are ignored.
    pub async fn upload_tree(
        &self,
        local_root: &Path,
        remote_prefix: &str,
    ) -> Result<usize, StorageError> {
        let files = collect_files(local_root.to_path_buf()).await?;
        let file_count = files.len();

        let semaphore = Arc::new(Semaphore::new(UPLOAD_CONCURRENCY));
        let mut uploads = JoinSet::new();

        for file in files {
            let backend = self.backend.clone();
            let semaphore = semaphore.clone();
            let key = object_key(local_root, &file, remote_prefix);

            uploads.spawn(async move {
                let _permit = semaphore.acquire_owned().await;

                let data = tokio::fs::read(&file).await.map_err(|source| {
                    StorageError::ReadFile {
                        path: file.display().to_string(),
                        source,
                    }
                })?;

                let size = data.len() as u64;
                let content_type = content_type_for(&file);
                backend.put(&key, Bytes::from(data), content_type).await?;
                Ok::<u64, StorageError>(size)
            });
        }

        let mut first_error = None;
        let mut total_bytes = 0u64;
        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok(Ok(size)) => total_bytes += size,
                Ok(Err(e)) if first_error.is_none() => first_error = Some(e),
                Ok(Err(_)) => {}
                Err(_) if first_error.is_none() => first_error = Some(StorageError::WorkerPanic),
                Err(_) => {}
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        metrics::counter!(STORAGE_UPLOAD_BYTES.name, "repository" => self.repository.clone())
            .increment(total_bytes);

        Ok(file_count)
    }

    /// Fetches the page index. A missing object is an empty index; every
    /// other failure propagates.
    pub async fn read_index(&self) -> Result<PageIndex, StorageError> {
        let key = self.index_key();

        let Some(data) = self.backend.get(&key).await? else {
            return Ok(PageIndex::new());
        };

        let mut index: PageIndex = serde_yaml::from_slice(&data)?;
        index.attach_identity(&self.repository);
        Ok(index)
    }

    /// Serializes and writes the page index. There is no locking across
    /// writers; the last write wins.
    pub async fn write_index(&self, index: &PageIndex) -> Result<(), StorageError> {
        let data = serde_yaml::to_string(index)?;
        self.backend
            .put(&self.index_key(), Bytes::from(data), "application/x-yaml")
            .await
    }

    fn index_key(&self) -> String {
        format!("{}/index.yaml", self.repository)
    }
}

/// Walks `root` recursively and returns every regular file under it.
async fn collect_files(root: PathBuf) -> Result<Vec<PathBuf>, StorageError> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let mut pending = vec![root];

        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).map_err(StorageError::Walk)? {
                let entry = entry.map_err(StorageError::Walk)?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(StorageError::Walk)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    files.push(path);
                }
            }
        }

        Ok(files)
    })
    .await
    .unwrap_or(Err(StorageError::WorkerPanic))
}

fn object_key(local_root: &Path, file: &Path, remote_prefix: &str) -> String {
    let relative = file.strip_prefix(local_root).unwrap_or(file);
    let mut key = String::from(remote_prefix.trim_matches('/'));
    for component in relative.components() {
        key.push('/');
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

/// Content type by file extension; everything unknown is an octet stream.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "yaml" | "yml" => "application/x-yaml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CommitMeta;
    use chrono::Utc;

    fn store() -> (Arc<MemoryBackend>, PageStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = PageStore::with_backend(backend.clone(), "org/repo");
        (backend, store)
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a/index.html")), "text/html");
        assert_eq!(content_type_for(Path::new("style.css")), "text/css");
        assert_eq!(content_type_for(Path::new("app.js")), "application/javascript");
        assert_eq!(content_type_for(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(content_type_for(Path::new("favicon.ico")), "image/x-icon");
        assert_eq!(
            content_type_for(Path::new("data.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("noextension")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_read_missing_index_is_empty() {
        let (_backend, store) = store();
        let index = store.read_index().await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_index_round_trip_through_storage() {
        let (backend, store) = store();

        let mut index = PageIndex::new();
        index.merge(CommitMeta::new(
            "org/repo",
            "abc123",
            "main",
            "prod",
            Utc::now(),
        ));
        store.write_index(&index).await.unwrap();

        assert_eq!(backend.keys(), vec!["org/repo/index.yaml"]);
        assert_eq!(
            backend.content_type_of("org/repo/index.yaml").unwrap(),
            "application/x-yaml"
        );

        let loaded = store.read_index().await.unwrap();
        let meta = loaded.get_by_commit("abc123").unwrap();
        assert_eq!(meta.repository, "org/repo");
        assert_eq!(meta.commit_id, "abc123");
        assert_eq!(meta.branch, "main");
    }

    #[tokio::test]
    async fn test_upload_tree() {
        let (backend, store) = store();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::create_dir_all(dir.path().join("assets/img")).unwrap();
        std::fs::write(dir.path().join("assets/style.css"), "body {}").unwrap();
        std::fs::write(dir.path().join("assets/img/logo.png"), [0u8; 4]).unwrap();

        let count = store
            .upload_tree(dir.path(), "org/repo/abc123")
            .await
            .unwrap();
        assert_eq!(count, 3);

        assert_eq!(
            backend.keys(),
            vec![
                "org/repo/abc123/assets/img/logo.png",
                "org/repo/abc123/assets/style.css",
                "org/repo/abc123/index.html",
            ]
        );
        assert_eq!(
            backend
                .content_type_of("org/repo/abc123/index.html")
                .unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn test_upload_tree_missing_root_fails() {
        let (_backend, store) = store();
        let result = store
            .upload_tree(Path::new("/nonexistent-upload-root"), "org/repo/abc")
            .await;
        assert!(matches!(result, Err(StorageError::Walk(_))));
    }
}
