//! Fixtures shared by the unit tests in this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use eln_store::{
    Attributes, Backend, BlockingPool, BucketMap, InMemoryObjectClient, LocalBackend, ObjectEntry,
    ObjectStoreBackend, StoreError, StoreResult,
};
use eln_types::{DocumentType, FixedClock, IdentityGenerator, ScriptedShortIds};
use tempfile::TempDir;

use crate::caller::CallerIdentity;
use crate::store::DocumentStore;

pub struct Fixture {
    pub store: DocumentStore,
    pub clock: Arc<FixedClock>,
}

pub struct FlakyFixture {
    pub fixture: Fixture,
    pub backend: Arc<FlakyBackend>,
}

/// A store over an in-memory object backend, pinned to
/// 2025-07-29 12:00:00 UTC and replaying `ids`.
pub fn fixture<I, S>(ids: I) -> Fixture
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    with_backend(memory_backend(), ids)
}

/// Like [`fixture`], but on a local directory.
pub fn local_fixture<I, S>(ids: I) -> (Fixture, TempDir)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(dir.path(), BucketMap::for_tests(), BlockingPool::new(2));
    (with_backend(Arc::new(backend), ids), dir)
}

/// Like [`fixture`], with failures injectable through the returned backend.
pub fn flaky_fixture<I, S>(ids: I) -> FlakyFixture
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let backend = Arc::new(FlakyBackend::new(memory_backend()));
    FlakyFixture {
        fixture: with_backend(backend.clone(), ids),
        backend,
    }
}

pub fn caller() -> CallerIdentity {
    CallerIdentity::new("1", "u1")
}

pub fn vars(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn memory_backend() -> Arc<dyn Backend> {
    Arc::new(ObjectStoreBackend::new(
        InMemoryObjectClient::with_page_size(3),
        BucketMap::for_tests(),
    ))
}

fn with_backend<I, S>(backend: Arc<dyn Backend>, ids: I) -> Fixture
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 7, 29, 12, 0, 0).unwrap(),
    ));
    let identity =
        IdentityGenerator::with_sources(Arc::new(ScriptedShortIds::new(ids)), clock.clone());
    Fixture {
        store: DocumentStore::with_identity(backend, identity),
        clock,
    }
}

/// Delegating backend that fails selected calls.
pub struct FlakyBackend {
    inner: Arc<dyn Backend>,
    copy_calls: AtomicUsize,
    fail_copy_at: AtomicUsize,
    fail_put_prefix: Mutex<Option<String>>,
    fail_delete_prefix: Mutex<Option<String>>,
}

impl FlakyBackend {
    fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            copy_calls: AtomicUsize::new(0),
            fail_copy_at: AtomicUsize::new(0),
            fail_put_prefix: Mutex::new(None),
            fail_delete_prefix: Mutex::new(None),
        }
    }

    /// Fail the `n`th copy from now on (1-based).
    pub fn fail_copy_on(&self, n: usize) {
        let target = self.copy_calls.load(Ordering::SeqCst) + n;
        self.fail_copy_at.store(target, Ordering::SeqCst);
    }

    pub fn fail_put_under(&self, prefix: &str) {
        *self.fail_put_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn fail_delete_under(&self, prefix: &str) {
        *self.fail_delete_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    fn injected(key: &str) -> StoreError {
        StoreError::Io(std::io::Error::other(format!("injected failure for {key}")))
    }

    fn matches(slot: &Mutex<Option<String>>, key: &str) -> bool {
        slot.lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix))
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn put(
        &self,
        doc_type: DocumentType,
        key: &str,
        body: Bytes,
        attrs: &Attributes,
    ) -> StoreResult<()> {
        if Self::matches(&self.fail_put_prefix, key) {
            return Err(Self::injected(key));
        }
        self.inner.put(doc_type, key, body, attrs).await
    }

    async fn get(&self, doc_type: DocumentType, key: &str) -> StoreResult<Bytes> {
        self.inner.get(doc_type, key).await
    }

    async fn head(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        self.inner.head(doc_type, key).await
    }

    async fn delete(&self, doc_type: DocumentType, key: &str) -> StoreResult<bool> {
        if Self::matches(&self.fail_delete_prefix, key) {
            return Err(Self::injected(key));
        }
        self.inner.delete(doc_type, key).await
    }

    async fn list_by_prefix(
        &self,
        doc_type: DocumentType,
        prefix: &str,
    ) -> StoreResult<Vec<ObjectEntry>> {
        self.inner.list_by_prefix(doc_type, prefix).await
    }

    async fn copy(
        &self,
        src_type: DocumentType,
        src_key: &str,
        dst_type: DocumentType,
        dst_key: &str,
    ) -> StoreResult<()> {
        let call = self.copy_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_copy_at.load(Ordering::SeqCst) {
            return Err(Self::injected(dst_key));
        }
        self.inner.copy(src_type, src_key, dst_type, dst_key).await
    }

    async fn list_raw_files(&self, doc_type: DocumentType, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list_raw_files(doc_type, prefix).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
