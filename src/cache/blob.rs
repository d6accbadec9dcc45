//! Local object-URL table
//!
//! Stands in for the browser's `URL.createObjectURL`: bytes are registered
//! under a `blob:lexi/<n>` URL that media backends can resolve until it is
//! revoked. Only the asset cache and providers that own a blob mint or
//! revoke URLs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Immutable shared bytes
pub type Blob = Arc<[u8]>;

const BLOB_URL_PREFIX: &str = "blob:lexi/";

#[derive(Default)]
struct BlobTable {
    next_id: u64,
    blobs: HashMap<String, Blob>,
}

/// Process-wide table of live blob URLs
#[derive(Clone, Default)]
pub struct BlobStore {
    inner: Arc<Mutex<BlobTable>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `blob` and return its URL
    pub fn create_object_url(&self, blob: Blob) -> String {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        table.next_id += 1;
        let url = format!("{}{}", BLOB_URL_PREFIX, table.next_id);
        table.blobs.insert(url.clone(), blob);
        url
    }

    /// Forget `url`. Returns false if it was not live.
    pub fn revoke_object_url(&self, url: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blobs
            .remove(url)
            .is_some()
    }

    pub fn resolve(&self, url: &str) -> Option<Blob> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blobs
            .get(url)
            .cloned()
    }

    /// Number of URLs not yet revoked
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blobs
            .len()
    }
}

pub fn is_blob_url(url: &str) -> bool {
    url.starts_with("blob:")
}
