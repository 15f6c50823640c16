use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::object::{ListPage, ObjectClient};
use crate::traits::{Attributes, ObjectEntry};

/// Default number of keys returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// An object held by [`InMemoryObjectClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub attrs: Attributes,
    pub modified: DateTime<Utc>,
}

/// In-memory object store client.
///
/// Intended for tests and embedding. Buckets spring into existence on first
/// write. Listings are paginated like a remote store so pagination handling
/// gets exercised.
pub struct InMemoryObjectClient {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    page_size: usize,
    list_calls: AtomicUsize,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Fetch a stored object with its attributes.
    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let map = self.buckets.read().await;
        map.get(bucket).and_then(|b| b.get(key)).cloned()
    }

    /// Total number of objects across all buckets.
    pub async fn len(&self) -> usize {
        self.buckets.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `list_objects` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        attrs: &Attributes,
    ) -> StoreResult<()> {
        let mut map = self.buckets.write().await;
        map.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                attrs: attrs.clone(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<Bytes>> {
        let map = self.buckets.read().await;
        Ok(map
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|obj| obj.body.clone()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let map = self.buckets.read().await;
        Ok(map.get(bucket).is_some_and(|b| b.contains_key(key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let mut map = self.buckets.write().await;
        if let Some(b) = map.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StoreResult<()> {
        let mut map = self.buckets.write().await;
        let mut object = map
            .get(src_bucket)
            .and_then(|b| b.get(src_key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(src_bucket, src_key))?;
        object.modified = Utc::now();
        map.entry(dst_bucket.to_string())
            .or_default()
            .insert(dst_key.to_string(), object);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let map = self.buckets.read().await;
        let Some(objects) = map.get(bucket) else {
            return Ok(ListPage::default());
        };

        let start = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut matching = objects
            .range::<String, _>((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));

        let entries: Vec<ObjectEntry> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(key, obj)| ObjectEntry {
                key: key.clone(),
                size: obj.body.len() as u64,
                modified: Some(obj.modified),
            })
            .collect();
        let next = match (matching.next(), entries.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };
        Ok(ListPage { entries, next })
    }
}

impl std::fmt::Debug for InMemoryObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectClient")
            .field("page_size", &self.page_size)
            .field("list_calls", &self.list_calls())
            .finish()
    }
}
