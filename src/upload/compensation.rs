//! Upload compensation
//!
//! [`PendingBlobs`] records every blob a transaction wrote. The transaction
//! either commits it, which forgets the keys, or rolls it back, which deletes
//! them. A guard dropped while still holding keys (a panic or a cancelled
//! request future) schedules the deletes on the runtime.

use crate::blob::{self, BlobStore};
use crate::metrics;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// Blobs written by the current transaction and not yet committed
pub struct PendingBlobs {
    store: Arc<dyn BlobStore>,
    keys: Vec<String>,
    delete_timeout: Duration,
}

impl PendingBlobs {
    pub fn new(store: Arc<dyn BlobStore>, delete_timeout: Duration) -> Self {
        Self {
            store,
            keys: Vec::new(),
            delete_timeout,
        }
    }

    /// Register a key this transaction wrote (or may have written)
    pub fn register(&mut self, key: impl Into<String>) {
        self.keys.push(key.into());
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The metadata commit succeeded; the blobs are now owned by their records.
    pub fn commit(mut self) {
        self.keys.clear();
    }

    /// Delete every registered blob. Failures are logged and counted, never
    /// returned, so the caller's original error is what surfaces. Returns the
    /// number of blobs that could not be deleted.
    pub async fn rollback(mut self, reason: &'static str) -> usize {
        let keys = std::mem::take(&mut self.keys);
        let failed = delete_all(self.store.clone(), keys, self.delete_timeout).await;
        metrics::record_compensation(reason, failed);
        failed
    }
}

impl Drop for PendingBlobs {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    count = keys.len(),
                    "Upload abandoned before commit, deleting its blobs"
                );
                let store = self.store.clone();
                let timeout = self.delete_timeout;
                handle.spawn(async move {
                    let failed = delete_all(store, keys, timeout).await;
                    metrics::record_compensation("abandoned", failed);
                });
            }
            Err(_) => {
                tracing::error!(
                    keys = ?keys,
                    "Upload abandoned outside a runtime, blobs left behind"
                );
            }
        }
    }
}

async fn delete_all(store: Arc<dyn BlobStore>, keys: Vec<String>, timeout: Duration) -> usize {
    let deletes = keys.iter().map(|key| {
        let store = store.clone();
        async move { (key, blob::with_timeout(timeout, store.delete(key)).await) }
    });

    let mut failed = 0;
    for (key, result) in join_all(deletes).await {
        match result {
            Ok(()) => tracing::debug!(key = %key, "Compensating delete succeeded"),
            Err(e) => {
                failed += 1;
                tracing::error!(key = %key, error = %e, "Compensating delete failed, blob orphaned");
            }
        }
    }
    if failed == 0 {
        tracing::info!(count = keys.len(), "Rolled back upload blobs");
    }
    failed
}
