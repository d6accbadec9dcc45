//! Reference-counted asset cache
//!
//! Narration audio is fetched through short-lived signed URLs, but cached
//! under its stable storage path. Each cached asset is exposed as a local
//! blob URL that stays valid while at least one holder references it:
//!
//! - memory layer: `moka` cache of bytes, also de-duplicates concurrent fetches
//! - disk layer: [`DiskStore`] so repeat sessions avoid the network
//! - registry: live blob URL and holder count per stable path

pub mod blob;
pub mod disk;
pub mod speech;
pub mod word;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::config::NarrationSettings;

pub use blob::{is_blob_url, Blob, BlobStore};
pub use disk::{CacheError, DiskStore};
pub use speech::{CachedSpeech, SpeechCache};
pub use word::{AssetRef, WordAssets, WordPart};

/// Memory budget of the bytes layer
const MEMORY_CAPACITY_BYTES: u64 = 128 * 1024 * 1024;

static STORAGE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/storage/v1/object/(?:public|sign)/[^/?#]+/([^?#]+)")
        .expect("storage path regex is valid")
});

/// Shared handle used by every orchestrator in the process
pub type SharedAssetCache = Arc<AssetCache>;

#[derive(Clone)]
struct CachedBytes {
    bytes: Blob,
    cached_at: SystemTime,
}

#[derive(Debug)]
struct RegistryEntry {
    url: String,
    holders: usize,
}

pub struct AssetCache {
    http: Client,
    blobs: BlobStore,
    memory: Cache<String, CachedBytes>,
    disk: Option<DiskStore>,
    ttl: Duration,
    registry: Mutex<HashMap<String, RegistryEntry>>,
}

impl AssetCache {
    pub fn new(blobs: BlobStore, disk: Option<DiskStore>, ttl: Duration) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("lexi-narration/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        let memory = Cache::builder()
            .max_capacity(MEMORY_CAPACITY_BYTES)
            .weigher(|_path: &String, entry: &CachedBytes| {
                u32::try_from(entry.bytes.len()).unwrap_or(u32::MAX)
            })
            .time_to_live(ttl)
            .build();

        Self {
            http,
            blobs,
            memory,
            disk,
            ttl,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Cache persisted under `settings.cache_dir/assets`, memory only if that fails
    pub fn from_settings(settings: &NarrationSettings, blobs: BlobStore) -> Self {
        let disk = settings
            .cache_dir
            .as_ref()
            .and_then(|dir| match DiskStore::new(dir.join("assets")) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Asset disk cache unavailable");
                    None
                }
            });
        Self::new(blobs, disk, settings.asset_ttl)
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Resolve a playable URL for an asset and take one reference on it.
    ///
    /// Never fails: if the asset cannot be cached the raw remote URL is
    /// returned and no reference is taken.
    pub async fn get_asset(&self, stable_path: Option<&str>, remote_url: &str) -> String {
        self.get_asset_since(stable_path, remote_url, None).await
    }

    /// Like [`get_asset`](Self::get_asset), discarding stored bytes older than `updated_at`
    #[instrument(skip(self, remote_url))]
    pub async fn get_asset_since(
        &self,
        stable_path: Option<&str>,
        remote_url: &str,
        updated_at: Option<SystemTime>,
    ) -> String {
        let Some(path) = stable_path.filter(|p| !p.is_empty()) else {
            return uncached(remote_url);
        };

        if let Some(updated_at) = updated_at {
            self.invalidate_if_stale(path, updated_at).await;
        }

        if let Some(url) = self.acquire_existing(path) {
            debug!(path = %path, "Cache hit for asset");
            return url;
        }

        match self
            .memory
            .try_get_with(path.to_string(), self.load_bytes(path, remote_url))
            .await
        {
            Ok(entry) => self.acquire_or_insert(path, entry.bytes),
            Err(e) => {
                warn!(path = %path, error = %e, "Asset caching failed, using remote URL");
                remote_url.to_string()
            }
        }
    }

    /// Drop one reference; the blob URL is revoked when none remain
    pub fn release_asset(&self, stable_path: &str) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = registry.get_mut(stable_path) else {
            return;
        };

        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            if let Some(entry) = registry.remove(stable_path) {
                self.blobs.revoke_object_url(&entry.url);
                debug!(path = %stable_path, "Revoked asset URL");
            }
        }
    }

    /// Number of live references on `stable_path`
    pub fn ref_count(&self, stable_path: &str) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stable_path)
            .map_or(0, |e| e.holders)
    }

    /// Forget everything about one asset, revoking its URL even if still held
    pub async fn purge(&self, stable_path: &str) {
        let entry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stable_path);
        if let Some(entry) = entry {
            self.blobs.revoke_object_url(&entry.url);
        }
        self.forget_bytes(stable_path).await;
    }

    /// Forget every asset and revoke every URL this cache minted
    pub async fn clear(&self) {
        let entries: Vec<RegistryEntry> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            self.blobs.revoke_object_url(&entry.url);
        }

        self.memory.invalidate_all();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear().await {
                warn!(error = %e, "Failed to clear asset disk cache");
            }
        }
        info!("Asset cache cleared");
    }

    fn acquire_existing(&self, path: &str) -> Option<String> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.get_mut(path).map(|entry| {
            entry.holders += 1;
            entry.url.clone()
        })
    }

    fn acquire_or_insert(&self, path: &str, bytes: Blob) -> String {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = registry
            .entry(path.to_string())
            .or_insert_with(|| RegistryEntry {
                url: self.blobs.create_object_url(bytes),
                holders: 0,
            });
        entry.holders += 1;
        entry.url.clone()
    }

    /// Stored bytes older than `updated_at` are dropped, unless a holder still plays them
    async fn invalidate_if_stale(&self, path: &str, updated_at: SystemTime) {
        if self.ref_count(path) > 0 {
            return;
        }

        let memory_stale = self
            .memory
            .get(path)
            .await
            .is_some_and(|entry| entry.cached_at < updated_at);
        let disk_stale = match &self.disk {
            Some(disk) => matches!(
                disk.read(path).await,
                Ok(Some(entry)) if entry.stored_at < updated_at
            ),
            None => false,
        };

        if memory_stale || disk_stale {
            debug!(path = %path, "Cached asset is older than its source, refetching");
            self.forget_bytes(path).await;
        }
    }

    async fn forget_bytes(&self, path: &str) {
        self.memory.invalidate(path).await;
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove(path).await {
                warn!(path = %path, error = %e, "Failed to remove cached asset");
            }
        }
    }

    async fn load_bytes(&self, path: &str, remote_url: &str) -> Result<CachedBytes, CacheError> {
        if let Some(disk) = &self.disk {
            match disk.read(path).await {
                Ok(Some(entry)) if !self.is_expired(entry.stored_at) => {
                    debug!(path = %path, bytes = entry.bytes.len(), "Disk hit for asset");
                    return Ok(CachedBytes {
                        bytes: Arc::from(entry.bytes),
                        cached_at: entry.stored_at,
                    });
                }
                Ok(Some(_)) => debug!(path = %path, "Disk entry expired"),
                Ok(None) => {}
                Err(e) => warn!(path = %path, error = %e, "Failed to read cached asset"),
            }
        }

        info!(path = %path, "Fetching asset");
        let response = self
            .http
            .get(remote_url)
            .send()
            .await
            .map_err(|e| CacheError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if matches!(status.as_u16(), 400 | 401 | 403) {
                let body = response.text().await.unwrap_or_default();
                let preview: String = body.chars().take(200).collect();
                warn!(
                    path = %path,
                    status = status.as_u16(),
                    body = %preview,
                    "Signed URL rejected, it may have expired"
                );
            }
            return Err(CacheError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::Fetch(e.to_string()))?;

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(path, &bytes).await {
                warn!(path = %path, error = %e, "Failed to persist asset");
            }
        }

        debug!(path = %path, bytes = bytes.len(), "Fetched asset");
        Ok(CachedBytes {
            bytes: Arc::from(&bytes[..]),
            cached_at: SystemTime::now(),
        })
    }

    fn is_expired(&self, stored_at: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(stored_at)
            .is_ok_and(|age| age > self.ttl)
    }
}

/// URLs that never expire: same-origin paths, data and blob URLs
pub fn is_stable_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "data" | "blob" | "file"),
        Err(url::ParseError::RelativeUrlWithoutBase) => true,
        Err(_) => false,
    }
}

fn uncached(remote_url: &str) -> String {
    if !is_stable_url(remote_url) {
        warn!(url = %remote_url, "Asset has no stable path, serving uncached");
    }
    remote_url.to_string()
}

/// Extract the stable object key from a storage URL.
///
/// `https://x.supabase.co/storage/v1/object/sign/audio/books/1/0.mp3?token=abc`
/// yields `books/1/0.mp3`.
pub fn derive_storage_path(url: &str) -> Option<String> {
    let captures = STORAGE_PATH_RE.captures(url)?;
    let raw = captures.get(1)?.as_str();
    let path = urlencoding::decode(raw)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    (!path.is_empty()).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn memory_cache() -> AssetCache {
        AssetCache::new(BlobStore::new(), None, Duration::from_secs(3600))
    }

    async fn audio_server(route: &str, expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3-audio".to_vec()))
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let server = audio_server("/audio/0.mp3", 1).await;
        let cache = memory_cache();
        let first = format!("{}/audio/0.mp3?sig=1", server.uri());
        let second = format!("{}/audio/0.mp3?sig=2", server.uri());

        let (a, b) = tokio::join!(
            cache.get_asset(Some("books/1/0.mp3"), &first),
            cache.get_asset(Some("books/1/0.mp3"), &second),
        );

        assert_eq!(a, b);
        assert!(is_blob_url(&a));
        assert_eq!(cache.ref_count("books/1/0.mp3"), 2);
        assert_eq!(cache.blobs().resolve(&a).as_deref(), Some(&b"ID3-audio"[..]));

        cache.release_asset("books/1/0.mp3");
        assert!(cache.blobs().resolve(&a).is_some());
        cache.release_asset("books/1/0.mp3");
        assert!(cache.blobs().resolve(&a).is_none());
        assert_eq!(cache.blobs().live_count(), 0);

        // Releasing past zero is a no-op
        cache.release_asset("books/1/0.mp3");
        assert_eq!(cache.ref_count("books/1/0.mp3"), 0);
    }

    #[tokio::test]
    async fn test_refreshed_signed_url_hits_cache() {
        let server = audio_server("/audio/3.mp3", 1).await;
        let cache = memory_cache();

        let first = cache
            .get_asset(Some("books/1/3.mp3"), &format!("{}/audio/3.mp3?sig=old", server.uri()))
            .await;
        cache.release_asset("books/1/3.mp3");

        // Bytes stay in memory after the URL is revoked
        let second = cache
            .get_asset(Some("books/1/3.mp3"), &format!("{}/audio/3.mp3?sig=new", server.uri()))
            .await;

        assert!(is_blob_url(&second));
        assert_ne!(first, second);
        assert_eq!(cache.ref_count("books/1/3.mp3"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_returns_remote_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("token expired"))
            .mount(&server)
            .await;
        let cache = memory_cache();
        let remote = format!("{}/audio/9.mp3?sig=stale", server.uri());

        let url = cache.get_asset(Some("books/1/9.mp3"), &remote).await;

        assert_eq!(url, remote);
        assert_eq!(cache.ref_count("books/1/9.mp3"), 0);
        assert_eq!(cache.blobs().live_count(), 0);
    }

    #[tokio::test]
    async fn test_bypass_without_stable_path() {
        let cache = memory_cache();

        assert_eq!(cache.get_asset(None, "/static/intro.mp3").await, "/static/intro.mp3");
        assert_eq!(
            cache.get_asset(None, "data:audio/mp3;base64,AAAA").await,
            "data:audio/mp3;base64,AAAA"
        );
        assert_eq!(
            cache.get_asset(None, "https://cdn.example/a.mp3?sig=1").await,
            "https://cdn.example/a.mp3?sig=1"
        );
        assert_eq!(cache.blobs().live_count(), 0);
    }

    #[tokio::test]
    async fn test_disk_layer_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let server = audio_server("/audio/1.mp3", 1).await;
        let remote = format!("{}/audio/1.mp3?sig=1", server.uri());

        let first = AssetCache::new(
            BlobStore::new(),
            Some(DiskStore::new(temp_dir.path()).unwrap()),
            Duration::from_secs(3600),
        );
        first.get_asset(Some("books/1/1.mp3"), &remote).await;

        let second = AssetCache::new(
            BlobStore::new(),
            Some(DiskStore::new(temp_dir.path()).unwrap()),
            Duration::from_secs(3600),
        );
        let url = second.get_asset(Some("books/1/1.mp3"), &remote).await;

        assert_eq!(second.blobs().resolve(&url).as_deref(), Some(&b"ID3-audio"[..]));
    }

    #[tokio::test]
    async fn test_stale_entry_is_refetched() {
        let server = audio_server("/audio/2.mp3", 2).await;
        let cache = memory_cache();
        let remote = format!("{}/audio/2.mp3?sig=1", server.uri());

        cache.get_asset(Some("books/1/2.mp3"), &remote).await;
        cache.release_asset("books/1/2.mp3");

        let updated_at = SystemTime::now() + Duration::from_secs(60);
        let url = cache
            .get_asset_since(Some("books/1/2.mp3"), &remote, Some(updated_at))
            .await;
        assert!(is_blob_url(&url));
    }

    #[tokio::test]
    async fn test_purge_revokes_live_url() {
        let server = audio_server("/audio/4.mp3", 2).await;
        let cache = memory_cache();
        let remote = format!("{}/audio/4.mp3", server.uri());

        let url = cache.get_asset(Some("books/1/4.mp3"), &remote).await;
        cache.purge("books/1/4.mp3").await;

        assert!(cache.blobs().resolve(&url).is_none());
        assert_eq!(cache.ref_count("books/1/4.mp3"), 0);

        cache.get_asset(Some("books/1/4.mp3"), &remote).await;
        cache.clear().await;
        assert_eq!(cache.blobs().live_count(), 0);
    }

    #[test]
    fn test_derive_storage_path() {
        assert_eq!(
            derive_storage_path(
                "https://abc.supabase.co/storage/v1/object/sign/audio/books/7/chunk%200.mp3?token=x"
            ),
            Some("books/7/chunk 0.mp3".to_string())
        );
        assert_eq!(
            derive_storage_path("https://abc.supabase.co/storage/v1/object/public/words/cat.mp3"),
            Some("cat.mp3".to_string())
        );
        assert_eq!(derive_storage_path("https://cdn.example/a.mp3"), None);
    }

    #[test]
    fn test_is_stable_url() {
        assert!(is_stable_url("/static/a.mp3"));
        assert!(is_stable_url("blob:lexi/3"));
        assert!(is_stable_url("data:audio/mp3;base64,AAAA"));
        assert!(!is_stable_url("https://cdn.example/a.mp3?sig=1"));
    }
}
