//! Reading-progress persistence
//!
//! [`ProgressSaver`] decides when a playback position is worth sending and
//! how. Regular updates go through a trailing debounce ([`ProgressSaver::update`]
//! then [`ProgressSaver::flush_due`]); pause, stop and exit are forced saves
//! sent over the transport's beacon channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::types::PlaybackState;

/// Elapsed time must move by more than this to be worth a save
const MIN_TIME_DELTA_SEC: f64 = 2.0;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Progress endpoint returned status {0}")]
    Status(u16),
}

/// Body of the progress endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub child_id: Option<String>,
    pub book_id: String,
    pub token_index: usize,
    pub shard_index: usize,
    pub total_read_seconds: f64,
    pub view_mode: String,
    pub speed: f32,
    pub is_completed: bool,
    pub is_mission: bool,
    pub title: Option<String>,
    pub is_opening: bool,
}

/// Position of the reader at one moment
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub word_index: usize,
    pub shard_index: usize,
    pub time_sec: f64,
    pub view_mode: String,
    pub speed: f32,
    pub is_completed: bool,
}

impl ProgressSnapshot {
    /// The position a freshly mounted reader reports before resume data arrives
    pub fn is_zero(&self) -> bool {
        self.word_index == 0 && self.shard_index == 0 && self.time_sec <= 0.0 && !self.is_completed
    }

    /// Whether this position differs enough from `last` to send
    pub fn is_meaningful_since(&self, last: Option<&ProgressSnapshot>) -> bool {
        let Some(last) = last else {
            return true;
        };
        self.word_index.abs_diff(last.word_index) >= 1
            || (self.time_sec - last.time_sec).abs() > MIN_TIME_DELTA_SEC
            || self.view_mode != last.view_mode
            || self.speed != last.speed
            || self.is_completed != last.is_completed
    }
}

/// Fixed facts about what is being read
#[derive(Debug, Clone, Default)]
pub struct ProgressContext {
    pub book_id: String,
    pub child_id: Option<String>,
    pub title: Option<String>,
    pub is_mission: bool,
}

/// Delivery channels of the progress endpoint
#[async_trait(?Send)]
pub trait ProgressTransport {
    async fn post(&self, payload: &ProgressPayload) -> Result<(), TransportError>;

    /// Queue a send that survives the caller going away.
    ///
    /// Returns `false` when no such channel is available.
    fn beacon(&self, payload: &ProgressPayload) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Sent,
    Beaconed,
    Skipped,
    Failed,
}

pub struct ProgressSaver<T> {
    transport: T,
    context: ProgressContext,
    debounce: Duration,
    current: Option<ProgressSnapshot>,
    last_saved: Option<ProgressSnapshot>,
    deadline: Option<Instant>,
    session_logged: bool,
    last_state: PlaybackState,
}

impl<T: ProgressTransport> ProgressSaver<T> {
    pub fn new(transport: T, context: ProgressContext, debounce: Duration) -> Self {
        Self {
            transport,
            context,
            debounce,
            current: None,
            last_saved: None,
            deadline: None,
            session_logged: false,
            last_state: PlaybackState::Stopped,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// When the pending debounced save becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Record the latest position and restart the quiet period
    pub fn update(&mut self, snapshot: ProgressSnapshot, now: Instant) {
        self.current = Some(snapshot);
        self.deadline = Some(now + self.debounce);
    }

    /// Trailing edge of the debounce: save if the quiet period has passed
    pub async fn flush_due(&mut self, now: Instant) -> Option<SaveOutcome> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(self.save(false, false, false).await)
            }
            _ => None,
        }
    }

    /// Immediate save over the regular channel
    pub async fn save_now(&mut self, force: bool) -> SaveOutcome {
        self.save(false, force, false).await
    }

    /// Report that the reader opened the book. Only the first call sends.
    pub async fn log_session_open(&mut self, snapshot: ProgressSnapshot) -> SaveOutcome {
        if self.session_logged {
            return SaveOutcome::Skipped;
        }
        self.session_logged = true;
        self.current = Some(snapshot);
        self.save(false, true, true).await
    }

    /// Force a save when playback leaves the playing state
    pub async fn on_playback_transition(&mut self, state: PlaybackState) -> Option<SaveOutcome> {
        let previous = std::mem::replace(&mut self.last_state, state);
        let stopped_playing = previous == PlaybackState::Playing
            && matches!(state, PlaybackState::Paused | PlaybackState::Stopped);
        if !stopped_playing {
            return None;
        }
        Some(self.save(true, true, false).await)
    }

    /// Forced final save when the reader goes away. An empty position is never sent.
    pub async fn on_exit(&mut self) -> SaveOutcome {
        if self.current.as_ref().is_some_and(ProgressSnapshot::is_zero) {
            debug!("Not overwriting progress with an empty position");
            return SaveOutcome::Skipped;
        }
        self.save(true, true, false).await
    }

    #[instrument(skip(self), fields(book = %self.context.book_id))]
    async fn save(&mut self, exiting: bool, force: bool, opening: bool) -> SaveOutcome {
        let Some(snapshot) = self.current.clone() else {
            return SaveOutcome::Skipped;
        };
        if self.context.book_id.is_empty() {
            return SaveOutcome::Skipped;
        }
        if !force && !snapshot.is_meaningful_since(self.last_saved.as_ref()) {
            return SaveOutcome::Skipped;
        }
        if snapshot.is_zero() && !force && !opening {
            debug!("Not overwriting progress with an empty position");
            return SaveOutcome::Skipped;
        }

        let payload = self.payload(&snapshot, opening);
        let outcome = if exiting && self.transport.beacon(&payload) {
            SaveOutcome::Beaconed
        } else {
            match self.transport.post(&payload).await {
                Ok(()) => SaveOutcome::Sent,
                Err(e) => {
                    warn!(error = %e, "Failed to save progress");
                    SaveOutcome::Failed
                }
            }
        };

        if outcome != SaveOutcome::Failed {
            debug!(word = snapshot.word_index, outcome = ?outcome, "Progress saved");
            self.last_saved = Some(snapshot);
            self.deadline = None;
        }
        outcome
    }

    fn payload(&self, snapshot: &ProgressSnapshot, opening: bool) -> ProgressPayload {
        ProgressPayload {
            child_id: self.context.child_id.clone(),
            book_id: self.context.book_id.clone(),
            token_index: snapshot.word_index,
            shard_index: snapshot.shard_index,
            total_read_seconds: snapshot.time_sec,
            view_mode: snapshot.view_mode.clone(),
            speed: snapshot.speed,
            is_completed: snapshot.is_completed,
            is_mission: self.context.is_mission,
            title: self.context.title.clone(),
            is_opening: opening,
        }
    }
}

/// Progress endpoint over HTTP
pub struct HttpProgressTransport {
    http: Client,
    api_base: String,
}

impl HttpProgressTransport {
    pub fn new(api_base: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, book_id: &str) -> String {
        format!(
            "{}/api/books/{}/progress",
            self.api_base,
            urlencoding::encode(book_id)
        )
    }
}

#[async_trait(?Send)]
impl ProgressTransport for HttpProgressTransport {
    async fn post(&self, payload: &ProgressPayload) -> Result<(), TransportError> {
        let url = self.url(&payload.book_id);
        debug!(url = %url, "Posting progress");

        let response = self.http.post(&url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    fn beacon(&self, payload: &ProgressPayload) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not encode progress beacon");
                return false;
            }
        };

        let request = self
            .http
            .post(self.url(&payload.book_id))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => debug!("Progress beacon delivered"),
                Ok(response) => info!(status = %response.status(), "Progress beacon rejected"),
                Err(e) => info!(error = %e, "Progress beacon failed"),
            }
        });
        true
    }
}
