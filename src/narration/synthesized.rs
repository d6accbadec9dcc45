//! Remote synthesis with a response cache, played as one stream

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tracing::{debug, info, instrument};

use super::media::{probe_duration, MediaElement};
use super::playback::MediaPlayback;
use super::synthesis::SynthesisClient;
use super::{valid_rate, Capabilities, Listener, NarrationProvider};
use crate::cache::{BlobStore, CachedSpeech, SpeechCache};
use crate::chunker::{normalize_whitespace, split_into_chunks, ChunkerPreset};
use crate::events::{NarrationEvent, Subscription};
use crate::timing::{align_to_tokens, chunk_timings, parse_speech_marks};
use crate::types::{
    NarrationError, NarrationMeta, NarrationResult, PrepareInput, ProviderKind, TextChunk,
};

/// Added after the last speech mark when the audio length cannot be probed
const TRAILING_WORD_MS: u64 = 400;

pub struct SynthesizedProvider {
    client: SynthesisClient,
    cache: SpeechCache,
    voice: Option<String>,
    playback: MediaPlayback,
    blobs: BlobStore,
    owned_url: Option<String>,
    chunks: Vec<TextChunk>,
    metadata_timeout: Duration,
}

impl SynthesizedProvider {
    pub fn new(
        client: SynthesisClient,
        cache: SpeechCache,
        media: Box<dyn MediaElement>,
        blobs: BlobStore,
    ) -> Self {
        Self {
            client,
            cache,
            voice: None,
            playback: MediaPlayback::new(media, false),
            blobs,
            owned_url: None,
            chunks: Vec::new(),
            metadata_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// Chunks of the last prepared text
    pub fn chunks(&self) -> &[TextChunk] {
        &self.chunks
    }

    fn release(&mut self) {
        self.playback.unload();
        if let Some(url) = self.owned_url.take() {
            self.blobs.revoke_object_url(&url);
        }
    }

    async fn speech_for(&self, chunk: &TextChunk) -> Result<CachedSpeech, NarrationError> {
        let key = SpeechCache::key(&chunk.text, self.voice.as_deref());
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let response = self
            .client
            .synthesize(&chunk.text, self.voice.as_deref())
            .await?;
        self.cache
            .put(&key, response.audio_content.clone(), response.speech_marks.clone())
            .await;

        Ok(CachedSpeech {
            audio_content: response.audio_content,
            speech_marks: response.speech_marks,
            timestamp: 0,
        })
    }

    #[instrument(skip(self, input), fields(content = %input.content_id))]
    async fn synthesize_all(
        &mut self,
        input: &PrepareInput,
    ) -> Result<NarrationResult, NarrationError> {
        let normalized = normalize_whitespace(&input.raw_text);
        self.chunks = split_into_chunks(&normalized, ChunkerPreset::SYNTHESIS);
        if self.chunks.len() > 1 {
            debug!(chars = normalized.len(), chunks = self.chunks.len(), "Split synthesis text");
        }

        let mut audio = Vec::new();
        let mut timings = Vec::new();
        let mut total_ms = 0u64;

        for chunk in &self.chunks {
            let speech = self.speech_for(chunk).await?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(speech.audio_content.trim())
                .map_err(|e| NarrationError::Decode(e.to_string()))?;
            let marks = parse_speech_marks(&speech.speech_marks);

            let chunk_ms = probe_duration(&bytes)
                .map(|secs| (secs * 1000.0).floor() as u64)
                .unwrap_or_else(|| marks.last().map_or(0, |m| m.start_ms + TRAILING_WORD_MS));

            timings.extend(chunk_timings(&marks, chunk.start_word_index, total_ms, chunk_ms));
            audio.extend_from_slice(&bytes);
            total_ms += chunk_ms;
        }

        if !input.tokens.is_empty() {
            timings = align_to_tokens(timings, &input.tokens);
        }

        if self.chunks.len() > 1 {
            info!(
                chunks = self.chunks.len(),
                duration_ms = total_ms,
                words = timings.len(),
                "Concatenated synthesized audio"
            );
        }

        let audio_url = if audio.is_empty() {
            None
        } else {
            let url = self.blobs.create_object_url(Arc::from(audio));
            self.owned_url = Some(url.clone());
            if let Some(speed) = input.speed.and_then(valid_rate) {
                self.playback.set_rate(speed);
            }
            self.playback.load(&url, self.metadata_timeout).await;
            Some(url)
        };

        Ok(NarrationResult {
            provider: ProviderKind::Synthesized,
            audio_url,
            word_timings: Some(timings),
            meta: NarrationMeta {
                duration_ms: Some(total_ms),
                fallback_wpm: None,
            },
        })
    }
}

#[async_trait(?Send)]
impl NarrationProvider for SynthesizedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Synthesized
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: false,
            supports_word_timings: true,
            supports_voices: true,
            supports_time_seek: true,
        }
    }

    async fn prepare(&mut self, input: &PrepareInput) -> Result<NarrationResult, NarrationError> {
        self.release();
        self.synthesize_all(input).await
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

impl Drop for SynthesizedProvider {
    fn drop(&mut self) {
        self.release();
    }
}
