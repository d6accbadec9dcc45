//! Narration providers
//!
//! Every backend implements [`NarrationProvider`]:
//!
//! - [`speech::SpeechProvider`]: platform speech queue, word boundaries from the engine
//! - [`audio_file::AudioFileProvider`]: one pre-rendered file from a URL or from bytes
//! - [`synthesized::SynthesizedProvider`]: remote synthesis with a response cache
//!
//! [`factory::NarrationFactory`] picks the variant for a content unit.
//! Playback calls never fail; problems are reported through the `error` event.

pub mod audio_file;
pub mod factory;
pub mod media;
pub mod playback;
pub mod speech;
pub mod synthesis;
pub mod synthesized;
pub mod tooltip;

use async_trait::async_trait;

use crate::events::{NarrationEvent, ProviderEvent, Subscription};
use crate::types::{NarrationError, NarrationResult, PrepareInput, ProviderKind};

pub use audio_file::AudioFileProvider;
pub use factory::{Backends, NarrationFactory, ProviderConfig};
pub use media::{MediaElement, MediaError, MediaEvent, RodioMedia};
pub use speech::{NativeSpeech, SpeechEngine, SpeechError, SpeechProvider};
pub use synthesis::SynthesisClient;
pub use synthesized::SynthesizedProvider;

/// Static feature flags of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub supports_word_timings: bool,
    pub supports_voices: bool,
    /// False when the backend has no time axis and only word seeking works
    pub supports_time_seek: bool,
}

/// Boxed event listener accepted by [`NarrationProvider::on`]
pub type Listener = Box<dyn FnMut(&ProviderEvent)>;

#[async_trait(?Send)]
pub trait NarrationProvider {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Load the content unit and report what the provider knows about it
    async fn prepare(&mut self, input: &PrepareInput) -> Result<NarrationResult, NarrationError>;

    async fn play(&mut self);

    fn pause(&mut self);

    fn stop(&mut self);

    /// Non-finite and non-positive rates are ignored
    fn set_playback_rate(&mut self, rate: f32);

    /// Position on the narration timeline, `None` without a time axis
    fn current_time_sec(&self) -> Option<f64>;

    fn seek_to_time(&mut self, seconds: f64);

    /// Start the next `play` from `word_index`
    fn seek_to_word(&mut self, _word_index: usize) {}

    fn on(&self, event: NarrationEvent, listener: Listener) -> Subscription;

    /// Deliver pending backend events to listeners
    fn pump(&mut self);
}

/// `Some(rate)` when `rate` is usable as a playback rate
pub fn valid_rate(rate: f32) -> Option<f32> {
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rate() {
        assert_eq!(valid_rate(1.25), Some(1.25));
        assert_eq!(valid_rate(0.0), None);
        assert_eq!(valid_rate(-1.0), None);
        assert_eq!(valid_rate(f32::NAN), None);
        assert_eq!(valid_rate(f32::INFINITY), None);
    }
}
