//! Event and state plumbing shared by the file-backed providers

use std::time::Duration;

use tracing::{debug, warn};

use super::media::{MediaElement, MediaEvent};
use super::valid_rate;
use crate::events::{EventEmitter, ProviderEvent};
use crate::types::{NarrationError, ProviderState};

pub struct MediaPlayback {
    media: Box<dyn MediaElement>,
    emitter: EventEmitter,
    rate: f32,
    /// Report and accept times divided by the playback rate
    scaled_timeline: bool,
    loaded: bool,
}

impl MediaPlayback {
    pub fn new(media: Box<dyn MediaElement>, scaled_timeline: bool) -> Self {
        Self {
            media,
            emitter: EventEmitter::new(),
            rate: 1.0,
            scaled_timeline,
            loaded: false,
        }
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Attach `url` and wait up to `timeout` for its duration.
    ///
    /// A failed or slow metadata load is not an error; the source stays
    /// attached and the duration is simply unknown.
    pub async fn load(&mut self, url: &str, timeout: Duration) -> Option<u64> {
        self.media.set_source(url);
        self.media.set_playback_rate(self.rate);
        self.loaded = true;

        match tokio::time::timeout(timeout, self.media.load_metadata()).await {
            Ok(Ok(duration)) => duration
                .filter(|d| d.is_finite())
                .map(|d| (d * 1000.0).floor() as u64),
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Media metadata failed to load");
                None
            }
            Err(_) => {
                debug!(url = %url, "Timed out waiting for media metadata");
                None
            }
        }
    }

    pub fn unload(&mut self) {
        if self.loaded {
            self.media.pause();
            self.media.clear_source();
            self.loaded = false;
        }
    }

    pub async fn play(&mut self) {
        if !self.loaded || !self.media.is_paused() {
            return;
        }
        match self.media.play().await {
            Ok(()) => self.emitter.emit(ProviderEvent::State(ProviderState::Playing)),
            Err(e) if e.is_interruption() => debug!("Playback interrupted"),
            Err(e) => self.fail(e.into()),
        }
    }

    pub fn pause(&mut self) {
        if !self.loaded || self.media.is_paused() {
            return;
        }
        self.media.pause();
        self.emitter.emit(ProviderEvent::State(ProviderState::Paused));
    }

    pub fn stop(&mut self) {
        if !self.loaded {
            return;
        }
        self.media.pause();
        self.media.set_current_time(0.0);
        self.emitter.emit(ProviderEvent::State(ProviderState::Stopped));
    }

    pub fn set_rate(&mut self, rate: f32) {
        let Some(rate) = valid_rate(rate) else {
            return;
        };
        self.rate = rate;
        if self.loaded {
            self.media.set_playback_rate(rate);
        }
    }

    pub fn current_time_sec(&self) -> Option<f64> {
        if !self.loaded {
            return None;
        }
        Some(self.media.current_time() / self.timeline_scale())
    }

    pub fn seek_to_time(&mut self, seconds: f64) {
        if !self.loaded || !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        self.media.set_current_time(seconds * self.timeline_scale());
    }

    pub fn pump(&mut self) {
        for event in self.media.poll_events() {
            match event {
                MediaEvent::Ended => self.emitter.emit(ProviderEvent::Ended),
                MediaEvent::Error(e) if e.is_interruption() => debug!("Media load interrupted"),
                MediaEvent::Error(e) => self.fail(e.into()),
                MediaEvent::TimeUpdate(_) => {}
            }
        }
    }

    /// Report a genuine failure and leave the provider stopped
    pub fn fail(&mut self, error: NarrationError) {
        warn!(error = %error, "Narration playback failed");
        if self.loaded {
            self.media.pause();
            self.media.set_current_time(0.0);
        }
        self.emitter.emit(ProviderEvent::Error(error));
        self.emitter.emit(ProviderEvent::State(ProviderState::Stopped));
    }

    fn timeline_scale(&self) -> f64 {
        if self.scaled_timeline {
            self.rate as f64
        } else {
            1.0
        }
    }
}
