//! Speech-synthesis queue backend and the provider built on it

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use tts::{Features, Tts};

use super::{valid_rate, Capabilities, Listener, NarrationProvider};
use crate::chunker::{chunk_for_word, count_words, split_into_chunks, text_from_word, ChunkerPreset};
use crate::config::DEFAULT_FALLBACK_WPM;
use crate::events::{EventEmitter, NarrationEvent, ProviderEvent, Subscription};
use crate::types::{
    NarrationError, NarrationMeta, NarrationResult, PrepareInput, ProviderKind, ProviderState,
    TextChunk,
};

/// Errors reported by a speech engine
#[derive(Debug, Clone, Error)]
pub enum SpeechError {
    #[error("Speech engine unavailable: {0}")]
    Unavailable(String),
    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("Utterance interrupted")]
    Interrupted,
    #[error("Utterance canceled")]
    Canceled,
}

impl SpeechError {
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Canceled)
    }
}

pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// 1.0 is the engine's normal speed
    pub rate: f32,
}

#[derive(Debug, Clone)]
pub enum SpeechEvent {
    /// The engine started speaking the next word of the utterance
    WordBoundary(UtteranceId),
    End(UtteranceId),
    Error(UtteranceId, SpeechError),
}

/// A platform speech queue. Utterances are spoken in the order queued.
pub trait SpeechEngine {
    /// Whether `pause`/`resume` keep the position inside an utterance
    fn supports_true_pause(&self) -> bool;

    fn speak(&mut self, utterance: Utterance) -> Result<UtteranceId, SpeechError>;

    /// Drop the current and queued utterances
    fn cancel(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    fn is_paused(&self) -> bool;

    /// Speaking or holding queued utterances
    fn is_speaking(&self) -> bool;

    fn poll_events(&mut self) -> Vec<SpeechEvent>;
}

struct QueuedUtterance {
    id: UtteranceId,
    text: String,
    words: usize,
    rate: f32,
}

struct ActiveUtterance {
    id: UtteranceId,
    native: Option<tts::UtteranceId>,
    started: Instant,
    words: usize,
    reported: usize,
    rate: f32,
}

/// OS speech through the `tts` crate.
///
/// The OS engines expose neither pause nor word callbacks, so pause is
/// unsupported and word boundaries are paced at the fallback words-per-minute.
pub struct NativeSpeech {
    tts: Tts,
    features: Features,
    finished: Arc<Mutex<Vec<tts::UtteranceId>>>,
    pending: VecDeque<QueuedUtterance>,
    current: Option<ActiveUtterance>,
    events: Vec<SpeechEvent>,
    next_id: UtteranceId,
    words_per_minute: u32,
}

impl NativeSpeech {
    pub fn new() -> Result<Self, SpeechError> {
        let tts = Tts::default().map_err(|e| SpeechError::Unavailable(e.to_string()))?;
        let features = tts.supported_features();
        let finished = Arc::new(Mutex::new(Vec::new()));

        if features.utterance_callbacks {
            let sink = Arc::clone(&finished);
            tts.on_utterance_end(Some(Box::new(move |id| {
                sink.lock().unwrap_or_else(PoisonError::into_inner).push(id);
            })))
            .map_err(|e| SpeechError::Unavailable(e.to_string()))?;
        }

        info!(callbacks = features.utterance_callbacks, "Native speech initialized");
        Ok(Self {
            tts,
            features,
            finished,
            pending: VecDeque::new(),
            current: None,
            events: Vec::new(),
            next_id: 0,
            words_per_minute: DEFAULT_FALLBACK_WPM,
        })
    }

    /// Map a relative rate onto the engine's own range
    fn platform_rate(&self, rate: f32) -> f32 {
        (self.tts.normal_rate() * rate).clamp(self.tts.min_rate(), self.tts.max_rate())
    }

    fn start_next(&mut self) {
        while let Some(next) = self.pending.pop_front() {
            if self.features.rate {
                let rate = self.platform_rate(next.rate);
                if let Err(e) = self.tts.set_rate(rate) {
                    warn!(error = %e, "Failed to set speech rate");
                }
            }

            match self.tts.speak(&next.text, false) {
                Ok(native) => {
                    self.current = Some(ActiveUtterance {
                        id: next.id,
                        native,
                        started: Instant::now(),
                        words: next.words,
                        reported: 0,
                        rate: next.rate,
                    });
                    return;
                }
                Err(e) => self
                    .events
                    .push(SpeechEvent::Error(next.id, SpeechError::Synthesis(e.to_string()))),
            }
        }
    }

    fn is_finished(&self, active: &ActiveUtterance) -> bool {
        if self.features.utterance_callbacks {
            if let Some(native) = &active.native {
                return self
                    .finished
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(native);
            }
        }
        // Grace period so a just-queued utterance is not taken for finished
        active.started.elapsed().as_millis() > 250 && !self.tts.is_speaking().unwrap_or(false)
    }
}

impl SpeechEngine for NativeSpeech {
    fn supports_true_pause(&self) -> bool {
        false
    }

    fn speak(&mut self, utterance: Utterance) -> Result<UtteranceId, SpeechError> {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.push_back(QueuedUtterance {
            id,
            words: count_words(&utterance.text),
            text: utterance.text,
            rate: utterance.rate,
        });
        if self.current.is_none() {
            self.start_next();
        }
        Ok(id)
    }

    fn cancel(&mut self) {
        if let Err(e) = self.tts.stop() {
            debug!(error = %e, "Speech stop failed");
        }
        self.pending.clear();
        self.current = None;
        self.events.clear();
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn is_paused(&self) -> bool {
        false
    }

    fn is_speaking(&self) -> bool {
        self.current.is_some() || !self.pending.is_empty()
    }

    fn poll_events(&mut self) -> Vec<SpeechEvent> {
        if let Some(mut active) = self.current.take() {
            let finished = self.is_finished(&active);
            let words_per_sec = self.words_per_minute as f64 * active.rate as f64 / 60.0;
            let due = if finished {
                active.words
            } else {
                let spoken = (active.started.elapsed().as_secs_f64() * words_per_sec) as usize;
                (spoken + 1).min(active.words)
            };

            while active.reported < due {
                active.reported += 1;
                self.events.push(SpeechEvent::WordBoundary(active.id));
            }

            if finished {
                self.events.push(SpeechEvent::End(active.id));
                self.start_next();
            } else {
                self.current = Some(active);
            }
        }

        std::mem::take(&mut self.events)
    }
}

/// Narration through a [`SpeechEngine`].
///
/// Text is split into utterances with the web-speech preset. Word indices
/// stay global across the queue by counting boundary events.
pub struct SpeechProvider {
    engine: Box<dyn SpeechEngine>,
    emitter: EventEmitter,
    chunks: Vec<TextChunk>,
    rate: f32,
    /// Utterances of the current run with the chunk each one speaks
    queue: Vec<(UtteranceId, usize)>,
    /// First word of the current run
    run_start: usize,
    /// Last word the engine reached in the current run
    global_word_index: Option<usize>,
    paused: bool,
    /// Resume point recorded by a simulated pause
    saved_word_index: Option<usize>,
    /// Start point requested by a word seek while not speaking
    seek_word_index: Option<usize>,
}

impl SpeechProvider {
    pub fn new(engine: Box<dyn SpeechEngine>) -> Self {
        Self {
            engine,
            emitter: EventEmitter::new(),
            chunks: Vec::new(),
            rate: 1.0,
            queue: Vec::new(),
            run_start: 0,
            global_word_index: None,
            paused: false,
            saved_word_index: None,
            seek_word_index: None,
        }
    }

    /// Word the engine is currently speaking
    pub fn current_word_index(&self) -> Option<usize> {
        self.global_word_index
    }

    fn is_running(&self) -> bool {
        !self.queue.is_empty() && !self.paused
    }

    fn cancel_run(&mut self) {
        if self.engine.is_speaking() || self.engine.is_paused() {
            self.engine.cancel();
        }
        self.queue.clear();
    }

    /// Queue utterances from `start` to the end of the text
    fn speak_from(&mut self, start: usize) {
        self.cancel_run();

        let Some(first) = chunk_for_word(&self.chunks, start) else {
            debug!(word = start, "Nothing to speak from this word");
            return;
        };

        self.run_start = start;
        self.global_word_index = start.checked_sub(1);
        self.paused = false;

        for chunk_index in first..self.chunks.len() {
            let chunk = &self.chunks[chunk_index];
            let text = if chunk_index == first {
                text_from_word(chunk, start)
            } else {
                chunk.text.clone()
            };

            match self.engine.speak(Utterance {
                text,
                rate: self.rate,
            }) {
                Ok(id) => self.queue.push((id, chunk_index)),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, error: SpeechError) {
        warn!(error = %error, "Speech playback failed");
        self.cancel_run();
        self.paused = false;
        self.emitter.emit(ProviderEvent::Error(error.into()));
        self.emitter.emit(ProviderEvent::State(ProviderState::Stopped));
    }
}

#[async_trait(?Send)]
impl NarrationProvider for SpeechProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WebSpeech
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: false,
            supports_word_timings: false,
            supports_voices: true,
            supports_time_seek: false,
        }
    }

    async fn prepare(&mut self, input: &PrepareInput) -> Result<NarrationResult, NarrationError> {
        self.cancel_run();
        self.chunks = split_into_chunks(&input.raw_text, ChunkerPreset::WEB_SPEECH);
        self.rate = input.speed.and_then(valid_rate).unwrap_or(1.0);
        self.global_word_index = None;
        self.paused = false;
        self.saved_word_index = None;
        self.seek_word_index = None;

        if self.chunks.len() > 1 {
            debug!(
                chars = input.raw_text.len(),
                chunks = self.chunks.len(),
                "Split speech text"
            );
        }

        Ok(NarrationResult {
            provider: self.kind(),
            audio_url: None,
            word_timings: None,
            meta: NarrationMeta {
                duration_ms: None,
                fallback_wpm: Some(DEFAULT_FALLBACK_WPM),
            },
        })
    }

    async fn play(&mut self) {
        if self.chunks.is_empty() {
            return;
        }

        if self.paused && self.engine.supports_true_pause() && self.engine.is_paused() {
            self.engine.resume();
            self.paused = false;
            self.emitter.emit(ProviderEvent::State(ProviderState::Playing));
            return;
        }

        let start = self
            .saved_word_index
            .take()
            .or_else(|| self.seek_word_index.take())
            .unwrap_or(0);
        self.speak_from(start);

        if !self.queue.is_empty() {
            self.emitter.emit(ProviderEvent::State(ProviderState::Playing));
        }
    }

    fn pause(&mut self) {
        if !self.is_running() {
            return;
        }

        if self.engine.supports_true_pause() {
            self.engine.pause();
        } else {
            // No pause primitive: remember the word and start over from it on play
            self.saved_word_index = Some(self.global_word_index.unwrap_or(self.run_start));
            self.cancel_run();
        }
        self.paused = true;
        self.emitter.emit(ProviderEvent::State(ProviderState::Paused));
    }

    fn stop(&mut self) {
        self.cancel_run();
        self.global_word_index = None;
        self.paused = false;
        self.saved_word_index = None;
        self.seek_word_index = None;
        self.emitter.emit(ProviderEvent::State(ProviderState::Stopped));
    }

    fn set_playback_rate(&mut self, rate: f32) {
        // Applies from the next utterance
        if let Some(rate) = valid_rate(rate) {
            self.rate = rate;
        }
    }

    fn current_time_sec(&self) -> Option<f64> {
        None
    }

    fn seek_to_time(&mut self, _seconds: f64) {}

    fn seek_to_word(&mut self, word_index: usize) {
        self.saved_word_index = None;
        if self.is_running() {
            self.speak_from(word_index);
        } else {
            if self.paused {
                self.cancel_run();
            }
            self.seek_word_index = Some(word_index);
        }
    }

    fn on(&self, event: NarrationEvent, listener: Listener) -> Subscription {
        self.emitter.on(event, listener)
    }

    fn pump(&mut self) {
        for event in self.engine.poll_events() {
            match event {
                SpeechEvent::WordBoundary(id) if self.queue.iter().any(|(q, _)| *q == id) => {
                    let next = self.global_word_index.map_or(self.run_start, |i| i + 1);
                    self.global_word_index = Some(next);
                    self.emitter.emit(ProviderEvent::Boundary(next));
                }
                SpeechEvent::End(id) if self.queue.last().is_some_and(|(q, _)| *q == id) => {
                    self.queue.clear();
                    self.emitter.emit(ProviderEvent::Ended);
                }
                SpeechEvent::Error(_, e) if e.is_interruption() => {}
                SpeechEvent::Error(id, e) if self.queue.iter().any(|(q, _)| *q == id) => {
                    let chunk = self.queue.iter().find(|(q, _)| *q == id).map(|(_, c)| *c);
                    warn!(chunk = ?chunk, total = self.chunks.len(), "Speech error in chunk");
                    self.fail(e);
                }
                // Events of utterances from a cancelled run
                _ => {}
            }
        }
    }
}
