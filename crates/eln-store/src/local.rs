use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use eln_types::DocumentType;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::{BucketMap, StorageConfig};
use crate::error::{StoreError, StoreResult};
use crate::pool::BlockingPool;
use crate::traits::{is_document_key, validate_key, Attributes, Backend, ObjectEntry};

/// Directory, relative to the project root, that holds local buckets.
pub const LOCAL_STORE_DIR: &str = ".local/s3";

/// Filesystem backend: each bucket is a directory under `root`, each key a
/// relative file path inside it.
///
/// Object attributes are not persisted; the filesystem has no side channel
/// for them.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
    buckets: BucketMap,
    pool: BlockingPool,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, buckets: BucketMap, pool: BlockingPool) -> Self {
        Self {
            root: root.into(),
            buckets,
            pool,
        }
    }

    /// Build from configuration. A relative or missing `local_path` is
    /// resolved against the project root found from the working directory.
    pub fn from_config(config: &StorageConfig) -> StoreResult<Self> {
        let root = resolve_local_root(config.local_path.as_deref(), &std::env::current_dir()?);
        debug!(root = %root.display(), "opening local backend");
        Ok(Self::new(
            root,
            config.buckets.clone(),
            BlockingPool::new(config.blocking_workers),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, doc_type: DocumentType) -> StoreResult<(String, PathBuf)> {
        let bucket = self.buckets.bucket_for(doc_type)?;
        Ok((bucket.to_string(), self.root.join(bucket)))
    }

    fn object_path(&self, doc_type: DocumentType, key: &str) -> StoreResult<(String, PathBuf)> {
        validate_key(key)?;
        let (bucket, dir) = self.bucket_dir(doc_type)?;
        Ok((bucket, dir.join(key)))
    }

    async fn list_keys(
        &self,
        doc_type: DocumentType,
        prefix: &str,
        documents_only: bool,
    ) -> StoreResult<Vec<ObjectEntry>> {
        let (_, bucket_dir) = self.bucket_dir(doc_type)?;
        let start = match prefix.rfind('/') {
            Some(idx) => {
                let dir = &prefix[..idx];
                if !dir.is_empty() {
                    validate_key(dir)?;
                }
                bucket_dir.join(dir)
            }
            None => bucket_dir.clone(),
        };
        let prefix = prefix.to_string();
        self.pool
            .run(move || walk_entries(&bucket_dir, &start, &prefix, documents_only))
            .await
    }
}

fn walk_entries(
    bucket_dir: &Path,
    start: &Path,
    prefix: &str,
    documents_only: bool,
) -> StoreResult<Vec<ObjectEntry>> {
    if !start.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(start).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(bucket_dir) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) || (documents_only && !is_document_key(&key)) {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        entries.push(ObjectEntry {
            key,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

/// Base directory for local buckets as seen from `cwd`.
pub fn resolve_local_root(local_path: Option<&Path>, cwd: &Path) -> PathBuf {
    match local_path {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => find_project_root(cwd).join(path),
        None => find_project_root(cwd).join(LOCAL_STORE_DIR),
    }
}

/// Locate the project root by walking up from `start`.
///
/// Prefers the nearest directory holding both a `Makefile` and
/// `.local/s3`, then the nearest holding `.local/s3` alone, then `start`.
pub fn find_project_root(start: &Path) -> PathBuf {
    let has_store = |dir: &Path| dir.join(LOCAL_STORE_DIR).is_dir();

    if let Some(dir) = start
        .ancestors()
        .find(|dir| dir.join("Makefile").is_file() && has_store(dir))
    {
        return dir.to_path_buf();
    }
    if let Some(dir) = start.ancestors().find(|dir| has_store(dir)) {
        return dir.to_path_buf();
    }
    start.to_path_buf()
}

fn map_not_found(err: std::io::Error, bucket: &str, key: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::not_found(bucket, key)
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn put(
        &self,
        doc_type: DocumentType,
        key: &str,
        body: Bytes,
        _attrs: &Attributes,
    ) -> StoreResult<()> {
        let (bucket, path) = self.object_path(doc_type, key)?;
        let size = body.len();
        self.pool
            .run(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &body)?;
                Ok(())
            })
            .await?;
        debug!(bucket = %bucket, key, size, "stored object");
        Ok(())
    }

    async fn get(&self, doc_type: DocumentType, key: &str) -> StoreResult<Bytes> {
        let (bucket, path) = self.object_path(doc_type, key)?;
        let owned_key = key.to_string();
        self.pool
            .run(move || {
                std::fs::read(&path)
                    .map(Bytes::from)
                    .map_err(|e| map_not_found(e, &bucket, &owned_key))
            })
            .await
    }

    async fn head(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        let (_, path) = self.object_path(doc_type, key)?;
        self.pool
            .run(move || match std::fs::metadata(&path) {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::Io(e)),
            })
            .await
    }

    async fn delete(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        let (bucket, path) = self.object_path(doc_type, key)?;
        let existed = self
            .pool
            .run(move || match std::fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::Io(e)),
            })
            .await?;
        debug!(bucket = %bucket, key, existed, "deleted object");
        Ok(existed)
    }

    async fn list_by_prefix(
        &self,
        doc_type: DocumentType,
        prefix: &str,
    ) -> StoreResult<Vec<ObjectEntry>> {
        self.list_keys(doc_type, prefix, true).await
    }

    async fn copy(
        &self,
        src_type: DocumentType,
        src_key: &str,
        dst_type: DocumentType,
        dst_key: &str,
    ) -> StoreResult<()> {
        let (src_bucket, src) = self.object_path(src_type, src_key)?;
        let (_, dst) = self.object_path(dst_type, dst_key)?;
        let owned_key = src_key.to_string();
        self.pool
            .run(move || {
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src, &dst).map_err(|e| map_not_found(e, &src_bucket, &owned_key))?;
                Ok(())
            })
            .await?;
        debug!(src = src_key, dst = dst_key, "copied object");
        Ok(())
    }

    async fn list_raw_files(&self, doc_type: DocumentType, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.list_keys(doc_type, prefix, false).await?;
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> LocalBackend {
        LocalBackend::new(dir.path(), BucketMap::for_tests(), BlockingPool::new(2))
    }

    fn body(text: &str) -> Bytes {
        Bytes::from(text.to_string())
    }

    // ---- Basic object operations ----

    #[tokio::test]
    async fn put_get_roundtrip_under_bucket_dir() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        be.put(DocumentType::Drafts, "drafts/S1/a.json", body("{}"), &Attributes::new())
            .await
            .unwrap();
        assert!(dir.path().join("eln-drafts/drafts/S1/a.json").is_file());
        let data = be.get(DocumentType::Drafts, "drafts/S1/a.json").await.unwrap();
        assert_eq!(&data[..], b"{}");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = backend(&dir)
            .get(DocumentType::Submissions, "submissions/S1/nope.json")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn head_and_delete() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        let key = "submissions/S1/x.json";
        assert!(!be.head(DocumentType::Submissions, key).await.unwrap());
        be.put(DocumentType::Submissions, key, body("1"), &Attributes::new())
            .await
            .unwrap();
        assert!(be.head(DocumentType::Submissions, key).await.unwrap());
        assert!(be.delete(DocumentType::Submissions, key).await.unwrap());
        assert!(!be.delete(DocumentType::Submissions, key).await.unwrap());
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        be.put(DocumentType::Drafts, "k.json", body("d"), &Attributes::new())
            .await
            .unwrap();
        assert!(!be.head(DocumentType::Submissions, "k.json").await.unwrap());
    }

    #[tokio::test]
    async fn unconfigured_bucket_is_error() {
        let dir = TempDir::new().unwrap();
        let be = LocalBackend::new(dir.path(), BucketMap::default(), BlockingPool::new(1));
        let err = be.head(DocumentType::Sops, "sops/S1.json").await.unwrap_err();
        assert!(matches!(err, StoreError::BucketNotConfigured(DocumentType::Sops)));
    }

    // ---- Key validation ----

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        for key in ["../escape.json", "/abs.json", "a/../../b.json", "", "./a.json"] {
            let err = be.get(DocumentType::Drafts, key).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "key {key:?}");
        }
    }

    // ---- Listing ----

    #[tokio::test]
    async fn list_by_prefix_filters_json_and_prefix() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        let attrs = Attributes::new();
        for key in [
            "drafts/S1/b.json",
            "drafts/S1/a.json",
            "drafts/S1/attachments/u1-f-id-data.csv",
            "drafts/S2/c.json",
        ] {
            be.put(DocumentType::Drafts, key, body("{}"), &attrs).await.unwrap();
        }

        let keys: Vec<String> = be
            .list_by_prefix(DocumentType::Drafts, "drafts/S1/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["drafts/S1/a.json", "drafts/S1/b.json"]);

        let all = be.list_by_prefix(DocumentType::Drafts, "drafts/").await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|e| e.size == 2 && e.modified.is_some()));
    }

    #[tokio::test]
    async fn list_missing_prefix_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = backend(&dir)
            .list_by_prefix(DocumentType::Submissions, "submissions/none/")
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn raw_files_match_partial_name_prefix() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        let attrs = Attributes::new();
        be.put(DocumentType::Drafts, "drafts/S1/attachments/u1-f-aaaa-x.csv", body("x"), &attrs)
            .await
            .unwrap();
        be.put(DocumentType::Drafts, "drafts/S1/attachments/u1-f-bbbb-y.csv", body("y"), &attrs)
            .await
            .unwrap();
        let keys = be
            .list_raw_files(DocumentType::Drafts, "drafts/S1/attachments/u1-f-aaaa-")
            .await
            .unwrap();
        assert_eq!(keys, vec!["drafts/S1/attachments/u1-f-aaaa-x.csv"]);
    }

    // ---- Copy ----

    #[tokio::test]
    async fn copy_across_buckets() {
        let dir = TempDir::new().unwrap();
        let be = backend(&dir);
        be.put(DocumentType::Drafts, "drafts/S1/attachments/t.csv", body("abc"), &Attributes::new())
            .await
            .unwrap();
        be.copy(
            DocumentType::Drafts,
            "drafts/S1/attachments/t.csv",
            DocumentType::Submissions,
            "submissions/S1/attachments/t.csv",
        )
        .await
        .unwrap();
        let copied = be
            .get(DocumentType::Submissions, "submissions/S1/attachments/t.csv")
            .await
            .unwrap();
        assert_eq!(&copied[..], b"abc");
        assert!(be.head(DocumentType::Drafts, "drafts/S1/attachments/t.csv").await.unwrap());
    }

    #[tokio::test]
    async fn copy_missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = backend(&dir)
            .copy(DocumentType::Drafts, "missing", DocumentType::Submissions, "dst")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // ---- Project root discovery ----

    #[test]
    fn project_root_prefers_makefile_marker() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        let nested = project.join("backend/src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(project.join(LOCAL_STORE_DIR)).unwrap();
        std::fs::write(project.join("Makefile"), "all:").unwrap();
        std::fs::create_dir_all(project.join("backend").join(LOCAL_STORE_DIR)).unwrap();

        assert_eq!(find_project_root(&nested), project);
    }

    #[test]
    fn project_root_falls_back_to_store_dir_then_start() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested), nested);

        std::fs::create_dir_all(dir.path().join("a").join(LOCAL_STORE_DIR)).unwrap();
        assert_eq!(find_project_root(&nested), dir.path().join("a"));
    }

    #[test]
    fn from_config_uses_explicit_path() {
        let config = StorageConfig {
            local_path: Some(PathBuf::from("/srv/eln")),
            buckets: BucketMap::for_tests(),
            ..StorageConfig::default()
        };
        let be = LocalBackend::from_config(&config).unwrap();
        assert_eq!(be.root(), Path::new("/srv/eln"));
    }

    #[test]
    fn relative_local_path_hangs_off_project_root() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("proj");
        let nested = project.join("backend/src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(project.join("Makefile"), "all:").unwrap();
        std::fs::create_dir_all(project.join(LOCAL_STORE_DIR)).unwrap();

        let root = resolve_local_root(Some(Path::new("data/buckets")), &nested);
        assert_eq!(root, project.join("data/buckets"));
        assert!(root.is_absolute());
        assert_eq!(
            resolve_local_root(None, &nested),
            project.join(LOCAL_STORE_DIR)
        );
        assert_eq!(
            resolve_local_root(Some(Path::new("/srv/eln")), &nested),
            PathBuf::from("/srv/eln")
        );
    }
}
