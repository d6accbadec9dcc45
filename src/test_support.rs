//! Test doubles for the platform boundaries

use std::cell::{RefCell, RefMut};
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;

use crate::events::{NarrationEvent, ProviderEvent};
use crate::narration::media::{MediaElement, MediaError, MediaEvent};
use crate::narration::speech::{SpeechEngine, SpeechError, SpeechEvent, Utterance, UtteranceId};
use crate::narration::NarrationProvider;
use crate::persistence::{ProgressPayload, ProgressTransport, TransportError};
use crate::types::ProviderState;

pub struct FakeMediaState {
    pub source: Option<String>,
    /// Every source set, in order
    pub sources: Vec<String>,
    pub current_time: f64,
    pub paused: bool,
    pub rate: f32,
    pub duration: Option<f64>,
    pub metadata_delay: Option<Duration>,
    pub metadata_error: bool,
    pub play_delay: Option<Duration>,
    pub play_error: Option<MediaError>,
    pub play_calls: usize,
    pub seeks: Vec<f64>,
    pub events: Vec<MediaEvent>,
}

/// Scriptable media element; clones share state
#[derive(Clone)]
pub struct FakeMedia(Rc<RefCell<FakeMediaState>>);

impl FakeMedia {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(FakeMediaState {
            source: None,
            sources: Vec::new(),
            current_time: 0.0,
            paused: true,
            rate: 1.0,
            duration: Some(10.0),
            metadata_delay: None,
            metadata_error: false,
            play_delay: None,
            play_error: None,
            play_calls: 0,
            seeks: Vec::new(),
            events: Vec::new(),
        })))
    }

    pub fn state(&self) -> RefMut<'_, FakeMediaState> {
        self.0.borrow_mut()
    }

    pub fn push(&self, event: MediaEvent) {
        self.0.borrow_mut().events.push(event);
    }

    pub fn boxed(&self) -> Box<dyn MediaElement> {
        Box::new(self.clone())
    }
}

#[async_trait(?Send)]
impl MediaElement for FakeMedia {
    fn set_source(&mut self, url: &str) {
        let mut state = self.0.borrow_mut();
        if state.source.as_deref() == Some(url) {
            return;
        }
        state.source = Some(url.to_string());
        state.sources.push(url.to_string());
        state.current_time = 0.0;
        state.paused = true;
    }

    fn source(&self) -> Option<String> {
        self.0.borrow().source.clone()
    }

    fn clear_source(&mut self) {
        let mut state = self.0.borrow_mut();
        state.source = None;
        state.paused = true;
    }

    async fn load_metadata(&mut self) -> Result<Option<f64>, MediaError> {
        let delay = self.0.borrow().metadata_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.0.borrow();
        if state.metadata_error {
            return Err(MediaError::Fetch("unreachable".to_string()));
        }
        Ok(state.duration)
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        let delay = self.0.borrow().play_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.0.borrow_mut();
        state.play_calls += 1;
        if let Some(error) = state.play_error.take() {
            return Err(error);
        }
        if state.source.is_none() {
            return Err(MediaError::NoSource);
        }
        state.paused = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.0.borrow_mut().paused = true;
    }

    fn is_paused(&self) -> bool {
        self.0.borrow().paused
    }

    fn current_time(&self) -> f64 {
        self.0.borrow().current_time
    }

    fn set_current_time(&mut self, seconds: f64) {
        let mut state = self.0.borrow_mut();
        state.seeks.push(seconds);
        state.current_time = seconds;
    }

    fn set_playback_rate(&mut self, rate: f32) {
        self.0.borrow_mut().rate = rate;
    }

    fn poll_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.0.borrow_mut().events)
    }
}

pub struct FakeSpeechState {
    pub true_pause: bool,
    pub spoken: Vec<(UtteranceId, Utterance)>,
    pub cancels: usize,
    pub paused: bool,
    pub speaking: bool,
    pub events: Vec<SpeechEvent>,
    next_id: UtteranceId,
}

/// Scriptable speech queue; clones share state
#[derive(Clone)]
pub struct FakeSpeech(Rc<RefCell<FakeSpeechState>>);

impl FakeSpeech {
    pub fn new(true_pause: bool) -> Self {
        Self(Rc::new(RefCell::new(FakeSpeechState {
            true_pause,
            spoken: Vec::new(),
            cancels: 0,
            paused: false,
            speaking: false,
            events: Vec::new(),
            next_id: 0,
        })))
    }

    pub fn push(&self, event: SpeechEvent) {
        self.0.borrow_mut().events.push(event);
    }

    pub fn spoken_ids(&self) -> Vec<UtteranceId> {
        self.0.borrow().spoken.iter().map(|(id, _)| *id).collect()
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.0
            .borrow()
            .spoken
            .iter()
            .map(|(_, u)| u.text.clone())
            .collect()
    }

    pub fn last_text(&self) -> Option<String> {
        self.0.borrow().spoken.last().map(|(_, u)| u.text.clone())
    }

    pub fn last_rate(&self) -> Option<f32> {
        self.0.borrow().spoken.last().map(|(_, u)| u.rate)
    }

    pub fn cancel_count(&self) -> usize {
        self.0.borrow().cancels
    }

    pub fn is_paused(&self) -> bool {
        self.0.borrow().paused
    }
}

impl SpeechEngine for FakeSpeech {
    fn supports_true_pause(&self) -> bool {
        self.0.borrow().true_pause
    }

    fn speak(&mut self, utterance: Utterance) -> Result<UtteranceId, SpeechError> {
        let mut state = self.0.borrow_mut();
        state.next_id += 1;
        let id = state.next_id;
        state.spoken.push((id, utterance));
        state.speaking = true;
        Ok(id)
    }

    fn cancel(&mut self) {
        let mut state = self.0.borrow_mut();
        state.cancels += 1;
        state.speaking = false;
        state.paused = false;
    }

    fn pause(&mut self) {
        let mut state = self.0.borrow_mut();
        if state.true_pause {
            state.paused = true;
        }
    }

    fn resume(&mut self) {
        self.0.borrow_mut().paused = false;
    }

    fn is_paused(&self) -> bool {
        self.0.borrow().paused
    }

    fn is_speaking(&self) -> bool {
        self.0.borrow().speaking
    }

    fn poll_events(&mut self) -> Vec<SpeechEvent> {
        std::mem::take(&mut self.0.borrow_mut().events)
    }
}

/// Record every event of `provider` as a short label
pub fn record_events(provider: &dyn NarrationProvider) -> Rc<RefCell<Vec<String>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    for event in [
        NarrationEvent::Ended,
        NarrationEvent::Error,
        NarrationEvent::State,
        NarrationEvent::Boundary,
    ] {
        let log = Rc::clone(&log);
        // Dropping a subscription keeps its listener registered
        let _subscription = provider.on(
            event,
            Box::new(move |e: &ProviderEvent| log.borrow_mut().push(label(e))),
        );
    }
    log
}

fn label(event: &ProviderEvent) -> String {
    match event {
        ProviderEvent::Ended => "ended".to_string(),
        ProviderEvent::Error(_) => "error".to_string(),
        ProviderEvent::State(ProviderState::Playing) => "state:PLAYING".to_string(),
        ProviderEvent::State(ProviderState::Paused) => "state:PAUSED".to_string(),
        ProviderEvent::State(ProviderState::Stopped) => "state:STOPPED".to_string(),
        ProviderEvent::Boundary(index) => format!("boundary:{}", index),
    }
}

/// 16-bit mono silence
pub fn silent_wav(seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..(seconds * 8000.0) as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Post,
    Beacon,
}

#[derive(Default)]
struct RecordingState {
    deliveries: Vec<(Delivery, ProgressPayload)>,
    beacon_disabled: bool,
    fail_next: bool,
}

/// Progress transport that keeps every payload; clones share state
#[derive(Clone, Default)]
pub struct RecordingTransport(Rc<RefCell<RecordingState>>);

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(Delivery, ProgressPayload)> {
        self.0.borrow().deliveries.clone()
    }

    pub fn disable_beacon(&self) {
        self.0.borrow_mut().beacon_disabled = true;
    }

    pub fn fail_next(&self) {
        self.0.borrow_mut().fail_next = true;
    }
}

#[async_trait(?Send)]
impl ProgressTransport for RecordingTransport {
    async fn post(&self, payload: &ProgressPayload) -> Result<(), TransportError> {
        let mut state = self.0.borrow_mut();
        if std::mem::take(&mut state.fail_next) {
            return Err(TransportError::Status(503));
        }
        state.deliveries.push((Delivery::Post, payload.clone()));
        Ok(())
    }

    fn beacon(&self, payload: &ProgressPayload) -> bool {
        let mut state = self.0.borrow_mut();
        if state.beacon_disabled {
            return false;
        }
        state.deliveries.push((Delivery::Beacon, payload.clone()));
        true
    }
}
