//! Cache of synthesis responses keyed by chunk text

use std::time::{SystemTime, UNIX_EPOCH};

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::disk::DiskStore;

/// A synthesis response as returned by the endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSpeech {
    /// Base64 audio
    pub audio_content: String,
    /// Newline-delimited JSON speech marks
    pub speech_marks: String,
    /// Unix millis at write time
    pub timestamp: u64,
}

#[derive(Clone)]
pub struct SpeechCache {
    memory: Cache<String, CachedSpeech>,
    disk: Option<DiskStore>,
}

impl SpeechCache {
    pub fn in_memory() -> Self {
        Self {
            memory: Cache::builder().max_capacity(512).build(),
            disk: None,
        }
    }

    pub fn with_disk(disk: DiskStore) -> Self {
        Self {
            disk: Some(disk),
            ..Self::in_memory()
        }
    }

    /// Cache key for `text` spoken with `voice`
    pub fn key(text: &str, voice: Option<&str>) -> String {
        match voice {
            Some(voice) => format!("{}:{}", voice, text),
            None => text.to_string(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedSpeech> {
        if let Some(hit) = self.memory.get(key).await {
            debug!(chars = key.len(), "Speech cache hit");
            return Some(hit);
        }

        let disk = self.disk.as_ref()?;
        let entry = match disk.read(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, "Failed to read speech cache");
                return None;
            }
        };

        match serde_json::from_slice::<CachedSpeech>(&entry.bytes) {
            Ok(speech) => {
                debug!(chars = key.len(), "Speech disk cache hit");
                self.memory.insert(key.to_string(), speech.clone()).await;
                Some(speech)
            }
            Err(e) => {
                warn!(error = %e, "Discarding corrupt speech cache entry");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, audio_content: String, speech_marks: String) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let speech = CachedSpeech {
            audio_content,
            speech_marks,
            timestamp,
        };

        if let Some(disk) = &self.disk {
            let written = match serde_json::to_vec(&speech) {
                Ok(json) => disk.write(key, &json).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = written {
                warn!(error = %e, "Failed to persist speech cache entry");
            }
        }

        self.memory.insert(key.to_string(), speech).await;
    }

    pub async fn clear(&self) {
        self.memory.invalidate_all();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear().await {
                warn!(error = %e, "Failed to clear speech cache");
            }
        }
    }
}
