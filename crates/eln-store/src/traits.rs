use std::collections::BTreeMap;
use std::path::{Component, Path};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use eln_types::DocumentType;

use crate::error::{StoreError, StoreResult};

/// Object attributes stored alongside the payload where the backend supports it.
pub type Attributes = BTreeMap<String, String>;

/// One entry of a prefix listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Key/value object storage, partitioned into one bucket per document type.
///
/// All implementations must satisfy these invariants:
/// - A missing object surfaces as [`StoreError::NotFound`](crate::StoreError::NotFound),
///   never as a backend-specific error.
/// - An unmapped document type fails with
///   [`StoreError::BucketNotConfigured`](crate::StoreError::BucketNotConfigured).
/// - Listings return keys relative to the bucket, in ascending key order.
/// - The backend never interprets payloads.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `body` under `key`, replacing any existing object.
    async fn put(
        &self,
        doc_type: DocumentType,
        key: &str,
        body: Bytes,
        attrs: &Attributes,
    ) -> StoreResult<()>;

    /// Read the object at `key`.
    async fn get(&self, doc_type: DocumentType, key: &str) -> StoreResult<Bytes>;

    /// Whether an object exists at `key`.
    async fn head(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool>;

    /// Delete the object at `key`. Returns `true` if it existed, or if the
    /// backend cannot tell.
    async fn delete(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool>;

    /// List `.json` documents whose key starts with `prefix`.
    async fn list_by_prefix(
        &self,
        doc_type: DocumentType,
        prefix: &str,
    ) -> StoreResult<Vec<ObjectEntry>>;

    /// Copy an object, possibly across buckets.
    async fn copy(
        &self,
        src_type: DocumentType,
        src_key: &str,
        dst_type: DocumentType,
        dst_key: &str,
    ) -> StoreResult<()>;

    /// List keys of any kind (not just `.json`) that start with `prefix`.
    async fn list_raw_files(&self, doc_type: DocumentType, prefix: &str) -> StoreResult<Vec<String>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Whether a key names a JSON document.
pub fn is_document_key(key: &str) -> bool {
    key.ends_with(".json")
}

/// Reject keys that are empty, absolute, or contain `.` / `..` components.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key must not be empty"));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(invalid("key must be relative"));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid("key must not contain '.', '..' or a root")),
        }
    }
    Ok(())
}
