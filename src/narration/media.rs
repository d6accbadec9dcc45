//! Audio element abstraction and the rodio-backed implementation
//!
//! A [`MediaElement`] behaves like an HTML audio element: it is pointed at a
//! URL, loads metadata, plays from a current time and reports progress
//! through polled [`MediaEvent`]s.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{is_blob_url, Blob, BlobStore};

/// Errors that can occur during media playback
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to create output stream: {0}")]
    Stream(String),
    #[error("Audio format error: {0}")]
    Format(String),
    #[error("Failed to load media: {0}")]
    Fetch(String),
    #[error("No media source")]
    NoSource,
    /// Playback was cut short by a newer request
    #[error("Playback aborted")]
    Aborted,
}

impl MediaError {
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[derive(Debug)]
pub enum MediaEvent {
    /// Current position in seconds, on the media's own timeline
    TimeUpdate(f64),
    Ended,
    Error(MediaError),
}

#[async_trait(?Send)]
pub trait MediaElement {
    /// Point the element at `url`. Setting the current source again is a no-op.
    fn set_source(&mut self, url: &str);

    fn source(&self) -> Option<String>;

    /// Detach the source and release decoded audio
    fn clear_source(&mut self);

    /// Load the source and return its duration in seconds, if known
    async fn load_metadata(&mut self) -> Result<Option<f64>, MediaError>;

    async fn play(&mut self) -> Result<(), MediaError>;

    fn pause(&mut self);

    /// True while not playing, including after the end of the source
    fn is_paused(&self) -> bool;

    fn current_time(&self) -> f64;

    fn set_current_time(&mut self, seconds: f64);

    fn set_playback_rate(&mut self, rate: f32);

    /// Drain events raised since the last call
    fn poll_events(&mut self) -> Vec<MediaEvent>;
}

/// Duration in seconds of encoded audio
pub fn probe_duration(bytes: &[u8]) -> Option<f64> {
    let decoded = Decoder::new(Cursor::new(bytes.to_vec()))
        .ok()
        .and_then(|decoder| decoder.total_duration())
        .map(|d| d.as_secs_f64());

    decoded.or_else(|| {
        let reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
        let sample_rate = reader.spec().sample_rate;
        (sample_rate > 0).then(|| reader.duration() as f64 / sample_rate as f64)
    })
}

/// Read the bytes behind a blob, data, http(s) or file URL
pub async fn fetch_source(url: &str, blobs: &BlobStore, http: &Client) -> Result<Blob, MediaError> {
    if is_blob_url(url) {
        return blobs
            .resolve(url)
            .ok_or_else(|| MediaError::Fetch(format!("blob URL revoked: {}", url)));
    }

    if let Some(data) = url.strip_prefix("data:") {
        let (_, payload) = data
            .split_once(";base64,")
            .ok_or_else(|| MediaError::Format("only base64 data URLs are supported".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| MediaError::Format(e.to_string()))?;
        return Ok(Arc::from(bytes));
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        let response = http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MediaError::Fetch(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| MediaError::Fetch(e.to_string()))?;
        return Ok(Arc::from(&bytes[..]));
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| MediaError::Fetch(format!("{}: {}", path, e)))?;
    Ok(Arc::from(bytes))
}

/// Media element playing through the default audio output
pub struct RodioMedia {
    blobs: BlobStore,
    http: Client,
    /// Output stream, opened on first playback and kept alive afterwards
    output: Option<OutputStream>,
    sink: Option<Sink>,
    source: Option<String>,
    bytes: Option<Blob>,
    duration: Option<f64>,
    rate: f32,
    /// Position to start from once a sink exists
    start_at: f64,
    ended: bool,
    last_reported: f64,
}

impl RodioMedia {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            blobs,
            http: Client::new(),
            output: None,
            sink: None,
            source: None,
            bytes: None,
            duration: None,
            rate: 1.0,
            start_at: 0.0,
            ended: false,
            last_reported: -1.0,
        }
    }

    fn build_sink(&mut self) -> Result<(), MediaError> {
        let bytes = self.bytes.clone().ok_or(MediaError::NoSource)?;

        if self.output.is_none() {
            let mut stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| MediaError::Stream(e.to_string()))?;
            stream.log_on_drop(false);
            self.output = Some(stream);
        }
        let output = self.output.as_ref().ok_or(MediaError::NoSource)?;

        let decoder = Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| MediaError::Format(e.to_string()))?;
        let sink = Sink::connect_new(output.mixer());
        sink.pause();
        sink.set_speed(self.rate);
        sink.append(decoder);

        if self.start_at > 0.0 {
            if let Err(e) = sink.try_seek(Duration::from_secs_f64(self.start_at)) {
                warn!(position = self.start_at, error = %e, "Seek failed");
            }
        }

        self.sink = Some(sink);
        Ok(())
    }
}

#[async_trait(?Send)]
impl MediaElement for RodioMedia {
    fn set_source(&mut self, url: &str) {
        if self.source.as_deref() == Some(url) {
            return;
        }
        self.clear_source();
        self.source = Some(url.to_string());
    }

    fn source(&self) -> Option<String> {
        self.source.clone()
    }

    fn clear_source(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.source = None;
        self.bytes = None;
        self.duration = None;
        self.start_at = 0.0;
        self.ended = false;
        self.last_reported = -1.0;
    }

    async fn load_metadata(&mut self) -> Result<Option<f64>, MediaError> {
        if self.bytes.is_none() {
            let url = self.source.clone().ok_or(MediaError::NoSource)?;
            let bytes = fetch_source(&url, &self.blobs, &self.http).await?;
            self.duration = probe_duration(&bytes);
            debug!(url = %url, bytes = bytes.len(), duration = ?self.duration, "Loaded media");
            self.bytes = Some(bytes);
        }
        Ok(self.duration)
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() {
            return Err(MediaError::NoSource);
        }
        self.load_metadata().await?;

        if self.ended {
            // Replay from the start, like an audio element after `ended`
            self.sink = None;
            self.start_at = 0.0;
            self.ended = false;
        }
        if self.sink.is_none() {
            self.build_sink()?;
        }
        if let Some(ref sink) = self.sink {
            sink.play();
        }
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(ref sink) = self.sink {
            sink.pause();
        }
    }

    fn is_paused(&self) -> bool {
        self.sink.as_ref().map_or(true, |s| s.is_paused() || s.empty())
    }

    fn current_time(&self) -> f64 {
        match self.sink {
            Some(ref sink) if !self.ended => sink.get_pos().as_secs_f64(),
            Some(_) => self.duration.unwrap_or(self.start_at),
            None => self.start_at,
        }
    }

    fn set_current_time(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        match self.sink {
            Some(ref sink) if !sink.empty() => {
                if let Err(e) = sink.try_seek(Duration::from_secs_f64(seconds)) {
                    warn!(position = seconds, error = %e, "Seek failed");
                }
            }
            _ => {
                // Rebuilt at the new position on the next play
                self.sink = None;
                self.ended = false;
                self.start_at = seconds;
            }
        }
    }

    fn set_playback_rate(&mut self, rate: f32) {
        self.rate = rate;
        if let Some(ref sink) = self.sink {
            sink.set_speed(rate);
        }
    }

    fn poll_events(&mut self) -> Vec<MediaEvent> {
        let Some(ref sink) = self.sink else {
            return Vec::new();
        };

        if sink.empty() {
            if self.ended {
                return Vec::new();
            }
            self.ended = true;
            return vec![MediaEvent::Ended];
        }

        let position = sink.get_pos().as_secs_f64();
        if sink.is_paused() || (position - self.last_reported).abs() < f64::EPSILON {
            return Vec::new();
        }
        self.last_reported = position;
        vec![MediaEvent::TimeUpdate(position)]
    }
}
