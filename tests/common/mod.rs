//! Shared test infrastructure
//!
//! Fault-injecting wrappers around the in-memory stores, plus fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use galleria::blob::memory::MemoryBlobStore;
use galleria::blob::{BlobError, BlobListing, BlobStore, BlobStream, PutBlob, StoredBlob};
use galleria::metadata::memory::MemoryMetadataStore;
use galleria::metadata::{
    CasResult, EventRecord, MetadataError, MetadataStore, UploadRecord, Versioned,
};
use galleria::upload::IncomingFile;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Barrier;

pub const MEDIA_BASE: &str = "http://localhost:3000/media";

/// Memory blob store that can fail or stall chosen calls and counts traffic
pub struct FlakyBlobStore {
    pub inner: MemoryBlobStore,
    /// 1-based put call that fails
    fail_put_at: Option<usize>,
    /// 1-based put call that never completes
    hang_put_at: Option<usize>,
    put_delay: Duration,
    fail_deletes: AtomicBool,
    missing: Mutex<HashSet<String>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    gets: AtomicUsize,
    attempted: Mutex<Vec<String>>,
}

impl FlakyBlobStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(MEDIA_BASE),
            fail_put_at: None,
            hang_put_at: None,
            put_delay: Duration::ZERO,
            fail_deletes: AtomicBool::new(false),
            missing: Mutex::new(HashSet::new()),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_put(n: usize) -> Self {
        Self {
            fail_put_at: Some(n),
            ..Self::new()
        }
    }

    pub fn hanging_put(n: usize) -> Self {
        Self {
            hang_put_at: Some(n),
            ..Self::new()
        }
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Make `key` behave as missing for reads
    pub fn hide(&self, key: &str) {
        self.missing.lock().unwrap().insert(key.to_string());
    }

    /// Every key a put was attempted for, in call order
    pub fn attempted_keys(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, blob: PutBlob) -> Result<StoredBlob, BlobError> {
        let call = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempted.lock().unwrap().push(blob.key.clone());
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        if self.hang_put_at == Some(call) {
            std::future::pending::<()>().await;
        }
        if self.fail_put_at == Some(call) {
            return Err(BlobError::Backend(format!("injected failure on put #{call}")));
        }
        self.inner.put(blob).await
    }

    async fn get(&self, key: &str) -> Result<BlobStream, BlobError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.missing.lock().unwrap().contains(key) {
            return Err(BlobError::NotFound(key.to_string()));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Backend("injected delete failure".into()));
        }
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobListing>, BlobError> {
        self.inner.list(prefix).await
    }

    fn url_for(&self, key: &str) -> String {
        self.inner.url_for(key)
    }

    fn key_for_url(&self, url: &str) -> Option<String> {
        self.inner.key_for_url(url)
    }
}

/// How [`ScriptedMetadataStore`] answers compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasMode {
    Normal,
    /// Storage failure
    Fail,
    /// The event disappeared
    Absent,
    /// Always lose the race
    Conflict,
}

/// Memory metadata store with scripted compare-and-swap outcomes
pub struct ScriptedMetadataStore {
    pub inner: MemoryMetadataStore,
    mode: Mutex<CasMode>,
}

impl ScriptedMetadataStore {
    pub fn new(mode: CasMode) -> Self {
        Self {
            inner: MemoryMetadataStore::new(3),
            mode: Mutex::new(mode),
        }
    }

    pub fn set_mode(&self, mode: CasMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl MetadataStore for ScriptedMetadataStore {
    async fn list(&self) -> Result<Vec<EventRecord>, MetadataError> {
        self.inner.list().await
    }

    async fn get(&self, event_id: &str) -> Result<Option<Versioned<EventRecord>>, MetadataError> {
        self.inner.get(event_id).await
    }

    async fn insert(&self, record: EventRecord) -> Result<(), MetadataError> {
        self.inner.insert(record).await
    }

    async fn compare_and_swap(
        &self,
        event_id: &str,
        expected_version: u64,
        record: EventRecord,
    ) -> Result<CasResult, MetadataError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            CasMode::Normal => {
                self.inner
                    .compare_and_swap(event_id, expected_version, record)
                    .await
            }
            CasMode::Fail => Err(MetadataError::Storage("injected disk failure".into())),
            CasMode::Absent => Ok(CasResult::Absent),
            CasMode::Conflict => Ok(CasResult::Conflict {
                current_version: expected_version + 1,
            }),
        }
    }

    fn max_update_attempts(&self) -> u32 {
        self.inner.max_update_attempts()
    }
}

/// Memory metadata store whose first `writers` compare-and-swaps wait for
/// each other, so concurrent writers are guaranteed to have read the same
/// version before any of them writes.
///
/// With `naive` set the version check is skipped, giving a plain
/// read-whole then write-whole store.
pub struct GatedMetadataStore {
    pub inner: MemoryMetadataStore,
    barrier: Barrier,
    gated: AtomicUsize,
    naive: bool,
}

impl GatedMetadataStore {
    pub fn new(writers: usize, naive: bool) -> Self {
        Self {
            inner: MemoryMetadataStore::new(16),
            barrier: Barrier::new(writers),
            gated: AtomicUsize::new(writers),
            naive,
        }
    }
}

#[async_trait]
impl MetadataStore for GatedMetadataStore {
    async fn list(&self) -> Result<Vec<EventRecord>, MetadataError> {
        self.inner.list().await
    }

    async fn get(&self, event_id: &str) -> Result<Option<Versioned<EventRecord>>, MetadataError> {
        self.inner.get(event_id).await
    }

    async fn insert(&self, record: EventRecord) -> Result<(), MetadataError> {
        self.inner.insert(record).await
    }

    async fn compare_and_swap(
        &self,
        event_id: &str,
        expected_version: u64,
        record: EventRecord,
    ) -> Result<CasResult, MetadataError> {
        let gated = self
            .gated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if gated {
            self.barrier.wait().await;
        }

        if self.naive {
            let current = match self.inner.get(event_id).await? {
                Some(current) => current.version,
                None => return Ok(CasResult::Absent),
            };
            return self.inner.compare_and_swap(event_id, current, record).await;
        }
        self.inner
            .compare_and_swap(event_id, expected_version, record)
            .await
    }

    fn max_update_attempts(&self) -> u32 {
        self.inner.max_update_attempts()
    }
}

pub fn jpeg(name: &str, body: &[u8]) -> IncomingFile {
    IncomingFile::new(name, "image/jpeg", Bytes::copy_from_slice(body))
}

pub fn event(id: &str, name: &str) -> EventRecord {
    EventRecord::new(id, name, None)
}

/// An upload record pointing at `key` in `store`
pub fn upload_record(store: &dyn BlobStore, id: &str, guest: &str, key: &str) -> UploadRecord {
    UploadRecord {
        id: id.into(),
        guest_name: guest.into(),
        message: None,
        storage_key: key.into(),
        url: store.url_for(key),
        media_type: "image/jpeg".into(),
        size: 0,
        original_filename: "photo.jpg".into(),
        created_at: Utc::now(),
    }
}

/// Store `body` under `key` directly, bypassing any transaction
pub async fn seed_blob(store: &dyn BlobStore, key: &str, body: &[u8]) {
    store
        .put(PutBlob {
            key: key.into(),
            body: Bytes::copy_from_slice(body),
            content_type: "image/jpeg".into(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
}
