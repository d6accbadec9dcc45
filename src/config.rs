//! Runtime settings for the narration engine

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::cache::disk::DiskStore;
use crate::types::ProviderRequest;

pub const DEFAULT_SYNTHESIS_ENDPOINT: &str = "http://localhost:3000/api/polly";
pub const DEFAULT_API_BASE: &str = "http://localhost:3000";

/// Words per minute assumed when a provider cannot report timings
pub const DEFAULT_FALLBACK_WPM: u32 = 150;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NarrationSettings {
    /// Forces a provider type for every content unit
    pub provider_override: Option<ProviderRequest>,
    pub synthesis_endpoint: String,
    pub api_base: String,
    /// Root of the persistent caches. `None` keeps everything in memory.
    pub cache_dir: Option<PathBuf>,
    #[serde(with = "secs")]
    pub asset_ttl: Duration,
    #[serde(with = "secs")]
    pub metadata_timeout: Duration,
    #[serde(with = "secs")]
    pub save_debounce: Duration,
    pub fallback_wpm: u32,
}

impl Default for NarrationSettings {
    fn default() -> Self {
        Self {
            provider_override: None,
            synthesis_endpoint: DEFAULT_SYNTHESIS_ENDPOINT.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            cache_dir: DiskStore::default_dir().ok(),
            asset_ttl: Duration::from_secs(24 * 60 * 60),
            metadata_timeout: Duration::from_secs(3),
            save_debounce: Duration::from_secs(1),
            fallback_wpm: DEFAULT_FALLBACK_WPM,
        }
    }
}

impl NarrationSettings {
    /// Defaults overlaid with `NARRATION_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(raw) = lookup("NARRATION_PROVIDER") {
            match raw.parse::<ProviderRequest>() {
                Ok(request) => settings.provider_override = Some(request),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring NARRATION_PROVIDER"),
            }
        }
        if let Some(url) = lookup("NARRATION_SYNTH_URL").filter(|v| !v.is_empty()) {
            settings.synthesis_endpoint = url;
        }
        if let Some(base) = lookup("NARRATION_API_BASE").filter(|v| !v.is_empty()) {
            settings.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(dir) = lookup("NARRATION_CACHE_DIR").filter(|v| !v.is_empty()) {
            settings.cache_dir = Some(PathBuf::from(dir));
        }

        settings
    }

    /// Settings with no persistent cache directory
    pub fn in_memory() -> Self {
        Self {
            cache_dir: None,
            ..Self::default()
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
