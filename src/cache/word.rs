//! Cached audio for a single word lookup

use std::collections::HashMap;

use futures::future::join_all;

use super::{derive_storage_path, SharedAssetCache};

/// Which clip of a word card an asset belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordPart {
    Word,
    Definition,
    Example,
}

/// One signed asset of a word card
#[derive(Debug, Clone)]
pub struct AssetRef {
    pub part: WordPart,
    /// Stable key. Derived from the signed URL when absent.
    pub storage_path: Option<String>,
    pub signed_url: String,
}

impl AssetRef {
    pub fn new(part: WordPart, signed_url: impl Into<String>) -> Self {
        Self {
            part,
            storage_path: None,
            signed_url: signed_url.into(),
        }
    }

    pub fn with_path(mut self, storage_path: impl Into<String>) -> Self {
        self.storage_path = Some(storage_path.into());
        self
    }

    fn stable_path(&self) -> Option<String> {
        self.storage_path
            .clone()
            .or_else(|| derive_storage_path(&self.signed_url))
    }
}

/// Holds cache references for the clips of one word until released
pub struct WordAssets {
    cache: SharedAssetCache,
    held: Vec<String>,
    urls: HashMap<WordPart, String>,
}

impl WordAssets {
    pub fn new(cache: SharedAssetCache) -> Self {
        Self {
            cache,
            held: Vec::new(),
            urls: HashMap::new(),
        }
    }

    /// Acquire every clip concurrently, replacing what was held before
    pub async fn acquire(&mut self, refs: Vec<AssetRef>) {
        let fetches = refs.iter().map(|asset| {
            let path = asset.stable_path();
            let cache = self.cache.clone();
            async move {
                let url = cache.get_asset(path.as_deref(), &asset.signed_url).await;
                (asset.part, path, url)
            }
        });
        let resolved = join_all(fetches).await;

        self.release_all();
        for (part, path, url) in resolved {
            // Only blob URLs hold a reference
            if let Some(path) = path.filter(|_| super::is_blob_url(&url)) {
                self.held.push(path);
            }
            self.urls.insert(part, url);
        }
    }

    pub fn url(&self, part: WordPart) -> Option<&str> {
        self.urls.get(&part).map(String::as_str)
    }

    pub fn release_all(&mut self) {
        for path in self.held.drain(..) {
            self.cache.release_asset(&path);
        }
        self.urls.clear();
    }
}

impl Drop for WordAssets {
    fn drop(&mut self) {
        self.release_all();
    }
}
