//! Providers for one pre-rendered audio file

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::media::MediaElement;
use super::playback::MediaPlayback;
use super::{valid_rate, Capabilities, Listener, NarrationProvider};
use crate::cache::{Blob, BlobStore};
use crate::events::{NarrationEvent, Subscription};
use crate::types::{
    NarrationError, NarrationMeta, NarrationResult, PrepareInput, ProviderKind, WordTiming,
};

/// Where the audio comes from
#[derive(Clone)]
pub enum AudioSource {
    Url(String),
    /// Bytes exposed through a blob URL owned by the provider
    Bytes(Blob),
}

/// Plays one audio resource with timings supplied by the caller.
///
/// The URL variant reports time on a rate-scaled timeline (media time divided
/// by the playback rate); the blob variant reports raw media time.
pub struct AudioFileProvider {
    kind: ProviderKind,
    source: AudioSource,
    timings: Option<Vec<WordTiming>>,
    playback: MediaPlayback,
    blobs: BlobStore,
    /// Blob URL minted for `AudioSource::Bytes`, revoked on reload and drop
    owned_url: Option<String>,
    metadata_timeout: Duration,
}

impl AudioFileProvider {
    pub fn remote(url: impl Into<String>, media: Box<dyn MediaElement>, blobs: BlobStore) -> Self {
        Self::new(ProviderKind::RemoteAudio, AudioSource::Url(url.into()), media, blobs, true)
    }

    pub fn blob(source: AudioSource, media: Box<dyn MediaElement>, blobs: BlobStore) -> Self {
        Self::new(ProviderKind::Blob, source, media, blobs, false)
    }

    fn new(
        kind: ProviderKind,
        source: AudioSource,
        media: Box<dyn MediaElement>,
        blobs: BlobStore,
        scaled_timeline: bool,
    ) -> Self {
        Self {
            kind,
            source,
            timings: None,
            playback: MediaPlayback::new(media, scaled_timeline),
            blobs,
            owned_url: None,
            metadata_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timings(mut self, timings: Option<Vec<WordTiming>>) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn set_word_timings(&mut self, timings: Option<Vec<WordTiming>>) {
        self.timings = timings;
    }

    fn release(&mut self) {
        self.playback.unload();
        if let Some(url) = self.owned_url.take() {
            self.blobs.revoke_object_url(&url);
            debug!(url = %url, "Revoked provider blob URL");
        }
    }
}

#[async_trait(?Send)]
impl NarrationProvider for AudioFileProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: false,
            supports_word_timings: true,
            supports_voices: false,
            supports_time_seek: true,
        }
    }

    async fn prepare(&mut self, input: &PrepareInput) -> Result<NarrationResult, NarrationError> {
        self.release();

        let url = match &self.source {
            AudioSource::Url(url) => url.clone(),
            AudioSource::Bytes(bytes) => {
                let url = self.blobs.create_object_url(bytes.clone());
                self.owned_url = Some(url.clone());
                url
            }
        };

        if let Some(speed) = input.speed.and_then(valid_rate) {
            self.playback.set_rate(speed);
        }
        let duration_ms = self.playback.load(&url, self.metadata_timeout).await;

        Ok(NarrationResult {
            provider: self.kind,
            audio_url: Some(url),
            word_timings: self.timings.clone(),
            meta: NarrationMeta {
                duration_ms,
                fallback_wpm: None,
            },
        })
    }

    async fn play(&mut self) {
        self.playback.play().await;
    }

    fn pause(&mut self) {
        self.playback.pause();
    }

    fn stop(&mut self) {
        self.playback.stop();
    }

    fn set_playback_rate(&mut self, rate: f32) {
        self.playback.set_rate(rate);
    }

    fn current_time_sec(&self) -> Option<f64> {
        self.playback.current_time_sec()
    }

    fn seek_to_time(&mut self, seconds: f64) {
        self.playback.seek_to_time(seconds);
    }

    fn on(&self, event: NarrationEvent, listener: Listener) -> Subscription {
        self.playback.emitter().on(event, listener)
    }

    fn pump(&mut self) {
        self.playback.pump();
    }
}

impl Drop for AudioFileProvider {
    fn drop(&mut self) {
        self.release();
    }
}
