use async_trait::async_trait;
use bytes::Bytes;
use eln_types::DocumentType;
use tracing::debug;

use crate::config::BucketMap;
use crate::error::{StoreError, StoreResult};
use crate::traits::{is_document_key, validate_key, Attributes, Backend, ObjectEntry};

/// One page of a bucket listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Continuation token for the next page, if any.
    pub next: Option<String>,
}

/// Raw client for a bucket-oriented object store.
///
/// Implementations speak bucket names directly; mapping document types to
/// buckets is the job of [`ObjectStoreBackend`].
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        attrs: &Attributes,
    ) -> StoreResult<()>;

    /// Returns `Ok(None)` if the object does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<Bytes>>;

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<bool>;

    /// Deleting a missing object is not an error.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Fails with [`StoreError::NotFound`] if the source is missing.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StoreResult<()>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> StoreResult<ListPage>;
}

/// Content type sent with an object, derived from its key.
pub fn content_type_for(key: &str) -> &'static str {
    if is_document_key(key) {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// Backend over a remote (or in-memory) object store: each document type
/// maps to a named bucket.
#[derive(Debug)]
pub struct ObjectStoreBackend<C> {
    client: C,
    buckets: BucketMap,
}

impl<C: ObjectClient> ObjectStoreBackend<C> {
    pub fn new(client: C, buckets: BucketMap) -> Self {
        Self { client, buckets }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn locate<'a>(&'a self, doc_type: DocumentType, key: &str) -> StoreResult<&'a str> {
        validate_key(key)?;
        self.buckets.bucket_for(doc_type)
    }

    async fn list_all(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(bucket, prefix, token.as_deref())
                .await?;
            entries.extend(page.entries);
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[async_trait]
impl<C: ObjectClient> Backend for ObjectStoreBackend<C> {
    async fn put(
        &self,
        doc_type: DocumentType,
        key: &str,
        body: Bytes,
        attrs: &Attributes,
    ) -> StoreResult<()> {
        let bucket = self.locate(doc_type, key)?;
        let size = body.len();
        self.client
            .put_object(bucket, key, body, content_type_for(key), attrs)
            .await?;
        debug!(bucket, key, size, "stored object");
        Ok(())
    }

    async fn get(&self, doc_type: DocumentType, key: &str) -> StoreResult<Bytes> {
        let bucket = self.locate(doc_type, key)?;
        self.client
            .get_object(bucket, key)
            .await?
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }

    async fn head(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        let bucket = self.locate(doc_type, key)?;
        self.client.head_object(bucket, key).await
    }

    async fn delete(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        let bucket = self.locate(doc_type, key)?;
        self.client.delete_object(bucket, key).await?;
        debug!(bucket, key, "deleted object");
        Ok(true)
    }

    async fn list_by_prefix(
        &self,
        doc_type: DocumentType,
        prefix: &str,
    ) -> StoreResult<Vec<ObjectEntry>> {
        let bucket = self.buckets.bucket_for(doc_type)?;
        let mut entries = self.list_all(bucket, prefix).await?;
        entries.retain(|e| is_document_key(&e.key));
        Ok(entries)
    }

    async fn copy(
        &self,
        src_type: DocumentType,
        src_key: &str,
        dst_type: DocumentType,
        dst_key: &str,
    ) -> StoreResult<()> {
        let src_bucket = self.locate(src_type, src_key)?;
        let dst_bucket = self.locate(dst_type, dst_key)?;
        self.client
            .copy_object(src_bucket, src_key, dst_bucket, dst_key)
            .await?;
        debug!(src_bucket, src_key, dst_bucket, dst_key, "copied object");
        Ok(())
    }

    async fn list_raw_files(&self, doc_type: DocumentType, prefix: &str) -> StoreResult<Vec<String>> {
        let bucket = self.buckets.bucket_for(doc_type)?;
        let entries = self.list_all(bucket, prefix).await?;
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    fn name(&self) -> &'static str {
        "object_store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryObjectClient;

    fn backend(page_size: usize) -> ObjectStoreBackend<InMemoryObjectClient> {
        ObjectStoreBackend::new(
            InMemoryObjectClient::with_page_size(page_size),
            BucketMap::for_tests(),
        )
    }

    #[tokio::test]
    async fn put_records_content_type_and_attrs() {
        let be = backend(100);
        let mut attrs = Attributes::new();
        attrs.insert("user-id".into(), "u1".into());
        be.put(DocumentType::Submissions, "submissions/S1/a.json", Bytes::from_static(b"{}"), &attrs)
            .await
            .unwrap();

        let stored = be.client().object("eln", "submissions/S1/a.json").await.unwrap();
        assert_eq!(stored.content_type, "application/json");
        assert_eq!(stored.attrs.get("user-id").map(String::as_str), Some("u1"));
    }

    #[tokio::test]
    async fn get_missing_maps_to_not_found() {
        let err = backend(100)
            .get(DocumentType::Drafts, "drafts/S1/x.json")
            .await
            .unwrap_err();
        match err {
            StoreError::NotFound { bucket, key } => {
                assert_eq!(bucket, "eln-drafts");
                assert_eq!(key, "drafts/S1/x.json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn listing_follows_continuation_tokens() {
        let be = backend(2);
        for i in 0..5 {
            be.put(
                DocumentType::Drafts,
                &format!("drafts/S1/d{i}.json"),
                Bytes::from_static(b"{}"),
                &Attributes::new(),
            )
            .await
            .unwrap();
        }
        be.put(
            DocumentType::Drafts,
            "drafts/S1/attachments/u1-f-id-a.bin",
            Bytes::from_static(b"x"),
            &Attributes::new(),
        )
        .await
        .unwrap();

        let docs = be.list_by_prefix(DocumentType::Drafts, "drafts/S1/").await.unwrap();
        assert_eq!(docs.len(), 5);
        let raw = be.list_raw_files(DocumentType::Drafts, "drafts/S1/").await.unwrap();
        assert_eq!(raw.len(), 6);
        assert!(be.client().list_calls() >= 3);
    }

    #[tokio::test]
    async fn copy_between_buckets_and_delete() {
        let be = backend(100);
        be.put(
            DocumentType::Drafts,
            "drafts/S1/attachments/t.bin",
            Bytes::from_static(b"abc"),
            &Attributes::new(),
        )
        .await
        .unwrap();
        be.copy(
            DocumentType::Drafts,
            "drafts/S1/attachments/t.bin",
            DocumentType::Submissions,
            "submissions/S1/attachments/t.bin",
        )
        .await
        .unwrap();
        assert!(be
            .head(DocumentType::Submissions, "submissions/S1/attachments/t.bin")
            .await
            .unwrap());
        assert!(be.delete(DocumentType::Drafts, "drafts/S1/attachments/t.bin").await.unwrap());
        assert!(!be.head(DocumentType::Drafts, "drafts/S1/attachments/t.bin").await.unwrap());
    }

    #[tokio::test]
    async fn unmapped_bucket_is_fatal() {
        let be = ObjectStoreBackend::new(InMemoryObjectClient::new(), BucketMap::default());
        let err = be.list_by_prefix(DocumentType::Drafts, "drafts/").await.unwrap_err();
        assert!(matches!(err, StoreError::BucketNotConfigured(_)));
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for("a/b.json"), "application/json");
        assert_eq!(content_type_for("a/b.pdf"), "application/octet-stream");
    }
}
