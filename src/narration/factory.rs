//! Provider selection and construction

use std::time::Duration;

use tracing::{debug, warn};

use super::audio_file::{AudioFileProvider, AudioSource};
use super::media::{MediaElement, RodioMedia};
use super::speech::{NativeSpeech, SpeechEngine, SpeechError, SpeechProvider};
use super::synthesis::SynthesisClient;
use super::synthesized::SynthesizedProvider;
use super::NarrationProvider;
use crate::cache::{Blob, BlobStore, DiskStore, SpeechCache};
use crate::config::NarrationSettings;
use crate::types::{NarrationError, ProviderKind, ProviderRequest, WordTiming};

pub type MediaConstructor = Box<dyn Fn() -> Box<dyn MediaElement>>;
pub type SpeechConstructor = Box<dyn Fn() -> Result<Box<dyn SpeechEngine>, SpeechError>>;

/// Platform pieces the providers are built from
pub struct Backends {
    pub media: MediaConstructor,
    pub speech: SpeechConstructor,
    pub blobs: BlobStore,
    pub synthesis: SynthesisClient,
    pub speech_cache: SpeechCache,
    pub metadata_timeout: Duration,
}

impl Backends {
    /// rodio output, OS speech and the configured synthesis endpoint
    pub fn native(settings: &NarrationSettings, blobs: BlobStore) -> Self {
        let speech_cache = settings
            .cache_dir
            .as_ref()
            .and_then(|dir| match DiskStore::new(dir.join("speech")) {
                Ok(store) => Some(SpeechCache::with_disk(store)),
                Err(e) => {
                    warn!(error = %e, "Speech disk cache unavailable");
                    None
                }
            })
            .unwrap_or_else(SpeechCache::in_memory);

        let media_blobs = blobs.clone();
        Self {
            media: Box::new(move || {
                Box::new(RodioMedia::new(media_blobs.clone())) as Box<dyn MediaElement>
            }),
            speech: Box::new(|| Ok(Box::new(NativeSpeech::new()?) as Box<dyn SpeechEngine>)),
            blobs,
            synthesis: SynthesisClient::new(settings.synthesis_endpoint.clone()),
            speech_cache,
            metadata_timeout: settings.metadata_timeout,
        }
    }
}

/// Inputs available for one content unit
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub audio_url: Option<String>,
    pub audio_blob: Option<Blob>,
    /// Timings handed through unchanged by the file-backed providers
    pub word_timings: Option<Vec<WordTiming>>,
}

impl ProviderConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            audio_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_blob(blob: Blob) -> Self {
        Self {
            audio_blob: Some(blob),
            ..Self::default()
        }
    }

    pub fn timings(mut self, word_timings: Vec<WordTiming>) -> Self {
        self.word_timings = Some(word_timings);
        self
    }
}

pub struct NarrationFactory {
    backends: Backends,
    env_override: Option<ProviderRequest>,
}

impl NarrationFactory {
    pub fn new(backends: Backends, env_override: Option<ProviderRequest>) -> Self {
        Self {
            backends,
            env_override,
        }
    }

    pub fn from_settings(settings: &NarrationSettings, blobs: BlobStore) -> Self {
        Self::new(Backends::native(settings, blobs), settings.provider_override)
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.backends.blobs
    }

    /// Which variant a request maps to.
    ///
    /// An explicit type wins, then the environment override, then the inputs:
    /// a blob, a URL, or platform speech.
    pub fn resolve(&self, requested: ProviderRequest, config: &ProviderConfig) -> ProviderKind {
        if let ProviderRequest::Kind(kind) = requested {
            return kind;
        }
        if let Some(ProviderRequest::Kind(kind)) = self.env_override {
            return kind;
        }
        if config.audio_blob.is_some() {
            ProviderKind::Blob
        } else if config.audio_url.is_some() {
            ProviderKind::RemoteAudio
        } else {
            ProviderKind::WebSpeech
        }
    }

    /// Parse a provider name and build it. Unknown names are rejected.
    pub fn create_named(
        &self,
        requested: &str,
        config: &ProviderConfig,
    ) -> Result<Box<dyn NarrationProvider>, NarrationError> {
        self.create(requested.parse()?, config)
    }

    pub fn create(
        &self,
        requested: ProviderRequest,
        config: &ProviderConfig,
    ) -> Result<Box<dyn NarrationProvider>, NarrationError> {
        let kind = self.resolve(requested, config);
        debug!(requested = %String::from(requested), resolved = %kind, "Creating narration provider");

        let backends = &self.backends;
        let provider: Box<dyn NarrationProvider> = match kind {
            ProviderKind::WebSpeech => self.speech_provider()?,
            ProviderKind::RemoteAudio => {
                let url = config.audio_url.clone().ok_or_else(|| {
                    NarrationError::Config(
                        "remote_audio requested but no audio URL provided".to_string(),
                    )
                })?;
                Box::new(
                    AudioFileProvider::remote(url, (backends.media)(), backends.blobs.clone())
                        .with_timings(config.word_timings.clone())
                        .with_metadata_timeout(backends.metadata_timeout),
                )
            }
            ProviderKind::Blob => {
                let blob = config.audio_blob.clone().ok_or_else(|| {
                    NarrationError::Config("blob requested but no audio blob provided".to_string())
                })?;
                Box::new(
                    AudioFileProvider::blob(
                        AudioSource::Bytes(blob),
                        (backends.media)(),
                        backends.blobs.clone(),
                    )
                    .with_timings(config.word_timings.clone())
                    .with_metadata_timeout(backends.metadata_timeout),
                )
            }
            ProviderKind::Synthesized => Box::new(
                SynthesizedProvider::new(
                    backends.synthesis.clone(),
                    backends.speech_cache.clone(),
                    (backends.media)(),
                    backends.blobs.clone(),
                )
                .with_metadata_timeout(backends.metadata_timeout),
            ),
            ProviderKind::Gemini => {
                warn!("Gemini narration is not implemented yet, using platform speech");
                self.speech_provider()?
            }
        };

        Ok(provider)
    }

    fn speech_provider(&self) -> Result<Box<dyn NarrationProvider>, NarrationError> {
        let engine = (self.backends.speech)()?;
        Ok(Box::new(SpeechProvider::new(engine)))
    }
}
