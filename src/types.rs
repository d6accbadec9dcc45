//! Narration data model and error definitions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::narration::media::MediaError;
use crate::narration::speech::SpeechError;

/// A slice of narration text sized for one backend request.
///
/// Word indices are global to the whole document, so chunk `i + 1` starts at
/// `chunks[i].end_word_index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    pub text: String,
    pub start_word_index: usize,
    pub end_word_index: usize,
    /// Byte offset of the chunk inside the normalized text
    pub start_char: usize,
    /// Exclusive byte offset of the chunk end inside the normalized text
    pub end_char: usize,
}

impl TextChunk {
    /// Number of words carried by this chunk
    pub fn word_count(&self) -> usize {
        self.end_word_index + 1 - self.start_word_index
    }

    pub fn contains_word(&self, word_index: usize) -> bool {
        (self.start_word_index..=self.end_word_index).contains(&word_index)
    }
}

/// Window during which a word is the active word, on one audio stream's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word_index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl WordTiming {
    pub fn start_sec(&self) -> f64 {
        self.start_ms as f64 / 1000.0
    }
}

/// Closed set of narration backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Platform speech-synthesis queue
    WebSpeech,
    /// Single pre-rendered audio file behind a URL
    RemoteAudio,
    /// Single pre-rendered audio file handed over as bytes
    Blob,
    /// Remote synthesis endpoint with a local response cache
    Synthesized,
    /// Reserved backend, not implemented yet
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSpeech => "web_speech",
            Self::RemoteAudio => "remote_audio",
            Self::Blob => "blob",
            Self::Synthesized => "synthesized",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider type requested by a caller or by the environment override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderRequest {
    #[default]
    Auto,
    Kind(ProviderKind),
}

impl FromStr for ProviderRequest {
    type Err = NarrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => return Ok(Self::Auto),
            "web_speech" => ProviderKind::WebSpeech,
            // "remote_tts" was the old name of the URL-backed variant
            "remote_audio" | "remote_tts" => ProviderKind::RemoteAudio,
            "blob" => ProviderKind::Blob,
            "synthesized" | "polly" => ProviderKind::Synthesized,
            "gemini" => ProviderKind::Gemini,
            other => return Err(NarrationError::UnknownProvider(other.to_string())),
        };
        Ok(Self::Kind(kind))
    }
}

impl TryFrom<String> for ProviderRequest {
    type Error = NarrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderRequest> for String {
    fn from(value: ProviderRequest) -> Self {
        match value {
            ProviderRequest::Auto => "auto".to_string(),
            ProviderRequest::Kind(kind) => kind.as_str().to_string(),
        }
    }
}

impl From<ProviderKind> for ProviderRequest {
    fn from(kind: ProviderKind) -> Self {
        Self::Kind(kind)
    }
}

/// One whitespace-delimited word of the content unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub word_index: usize,
    pub text: String,
}

/// Input of a provider's prepare step
#[derive(Debug, Clone, Default)]
pub struct PrepareInput {
    pub content_id: String,
    pub raw_text: String,
    pub tokens: Vec<Token>,
    pub speed: Option<f32>,
}

impl PrepareInput {
    /// Build an input whose tokens are the whitespace-delimited words of `text`
    pub fn from_text(content_id: impl Into<String>, text: impl Into<String>) -> Self {
        let raw_text = text.into();
        let tokens = raw_text
            .split_whitespace()
            .enumerate()
            .map(|(word_index, word)| Token {
                word_index,
                text: word.to_string(),
            })
            .collect();

        Self {
            content_id: content_id.into(),
            raw_text,
            tokens,
            speed: None,
        }
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }
}

/// Optional facts a provider learned while preparing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationMeta {
    pub duration_ms: Option<u64>,
    pub fallback_wpm: Option<u32>,
}

/// Output of a provider's prepare step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationResult {
    pub provider: ProviderKind,
    pub audio_url: Option<String>,
    pub word_timings: Option<Vec<WordTiming>>,
    #[serde(default)]
    pub meta: NarrationMeta,
}

/// Book-level audio for one chunk of narration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationShard {
    pub chunk_index: usize,
    pub start_word_index: usize,
    pub end_word_index: usize,
    /// Stable storage path, used as the cache key
    pub audio_path: Option<String>,
    /// Signed URL, changes between requests
    pub audio_url_signed: String,
    pub timings: Vec<WordTiming>,
}

impl NarrationShard {
    pub fn contains_word(&self, word_index: usize) -> bool {
        (self.start_word_index..=self.end_word_index).contains(&word_index)
    }

    /// Timing mark of `word_index` inside this shard, if the shard has one
    pub fn timing_for(&self, word_index: usize) -> Option<&WordTiming> {
        self.timings.iter().find(|t| t.word_index == word_index)
    }
}

/// Where to resume a book
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePoint {
    pub word_index: Option<usize>,
    pub shard_index: usize,
    pub time_sec: f64,
}

/// Playback state exposed by the orchestrators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Buffering,
    Playing,
    Paused,
}

impl PlaybackState {
    /// Whether a media source is attached and may be re-targeted
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Payload of a provider `state` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderState {
    Playing,
    Paused,
    Stopped,
}

impl From<ProviderState> for PlaybackState {
    fn from(state: ProviderState) -> Self {
        match state {
            ProviderState::Playing => Self::Playing,
            ProviderState::Paused => Self::Paused,
            ProviderState::Stopped => Self::Stopped,
        }
    }
}

/// Errors raised by providers, the factory and the orchestrators
#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("Invalid provider configuration: {0}")]
    Config(String),
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Synthesis failed with status {status}: {message}")]
    Synthesis { status: u16, message: String },
    #[error("Audio decode error: {0}")]
    Decode(String),
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
    #[error("Speech error: {0}")]
    Speech(#[from] SpeechError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Playback interrupted")]
    Interrupted,
}

impl NarrationError {
    /// Intentional cancellations (skip, seek, content switch) are never shown to the user
    pub fn is_interruption(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Media(e) => e.is_interruption(),
            Self::Speech(e) => e.is_interruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_request_parsing() {
        assert_eq!("auto".parse::<ProviderRequest>().unwrap(), ProviderRequest::Auto);
        assert_eq!(
            "web_speech".parse::<ProviderRequest>().unwrap(),
            ProviderRequest::Kind(ProviderKind::WebSpeech)
        );
        assert_eq!(
            "remote_tts".parse::<ProviderRequest>().unwrap(),
            ProviderRequest::Kind(ProviderKind::RemoteAudio)
        );
        assert_eq!(
            "POLLY".parse::<ProviderRequest>().unwrap(),
            ProviderRequest::Kind(ProviderKind::Synthesized)
        );
        assert!(matches!(
            "carrier-pigeon".parse::<ProviderRequest>(),
            Err(NarrationError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_prepare_input_tokens() {
        let input = PrepareInput::from_text("book-1", "  The cat\n sat. ");
        let words: Vec<_> = input.tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(words, vec!["The", "cat", "sat."]);
        assert_eq!(input.tokens[2].word_index, 2);
    }

    #[test]
    fn test_shard_lookup() {
        let shard = NarrationShard {
            chunk_index: 0,
            start_word_index: 10,
            end_word_index: 12,
            audio_path: Some("books/1/0.mp3".to_string()),
            audio_url_signed: "https://signed.example/0?sig=1".to_string(),
            timings: vec![
                WordTiming { word_index: 10, start_ms: 0, end_ms: 300 },
                WordTiming { word_index: 11, start_ms: 300, end_ms: 700 },
            ],
        };
        assert!(shard.contains_word(12));
        assert!(!shard.contains_word(13));
        assert_eq!(shard.timing_for(11).map(|t| t.start_ms), Some(300));
        assert!(shard.timing_for(12).is_none());
    }

    #[test]
    fn test_provider_state_serialization() {
        let json = serde_json::to_string(&ProviderState::Playing).unwrap();
        assert_eq!(json, "\"PLAYING\"");
        let json = serde_json::to_string(&PlaybackState::Buffering).unwrap();
        assert_eq!(json, "\"buffering\"");
    }

    #[test]
    fn test_interruption_detection() {
        assert!(NarrationError::Interrupted.is_interruption());
        assert!(NarrationError::Media(MediaError::Aborted).is_interruption());
        assert!(!NarrationError::Config("x".to_string()).is_interruption());
    }
}
