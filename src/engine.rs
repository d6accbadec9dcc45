//! Shard-level narration orchestrator
//!
//! A book's narration is a list of [`NarrationShard`]s played back to back
//! through one [`MediaElement`]. The engine tracks the active word across
//! shard boundaries, holds one asset-cache reference for the loaded shard and
//! drives the playback state machine:
//!
//! ```text
//! stopped -> buffering -> playing <-> paused -> stopped
//! ```

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cache::{is_blob_url, SharedAssetCache};
use crate::narration::media::{MediaElement, MediaEvent};
use crate::narration::valid_rate;
use crate::timing::active_timing;
use crate::types::{NarrationShard, PlaybackState, ResumePoint};

/// Paused position may differ from the word's mark by this much before a re-seek
const DRIFT_TOLERANCE_SEC: f64 = 0.5;

/// Time past the last word's start that counts as having finished the book
const FINISHED_MARGIN_SEC: f64 = 0.1;

/// Called with `(word_index, shard_index, time_sec)` when the active word changes
pub type ProgressCallback = Box<dyn FnMut(usize, usize, f64)>;

/// Observable engine state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSnapshot {
    pub state: PlaybackState,
    pub shard_index: usize,
    pub word_index: Option<usize>,
    pub time_sec: f64,
    pub speed: f32,
}

struct LoadedShard {
    shard_index: usize,
    url: String,
}

pub struct NarrationEngine {
    media: Box<dyn MediaElement>,
    cache: SharedAssetCache,
    book_id: Option<String>,
    shards: Vec<NarrationShard>,
    state: PlaybackState,
    shard_index: usize,
    word_index: Option<usize>,
    time_sec: f64,
    speed: f32,
    /// Resume point last supplied by the caller
    initial: ResumePoint,
    loaded: Option<LoadedShard>,
    /// Storage path whose cache reference this engine holds
    held_path: Option<String>,
    metadata_timeout: Duration,
    on_progress: Option<ProgressCallback>,
}

impl NarrationEngine {
    pub fn new(media: Box<dyn MediaElement>, cache: SharedAssetCache) -> Self {
        Self {
            media,
            cache,
            book_id: None,
            shards: Vec::new(),
            state: PlaybackState::Stopped,
            shard_index: 0,
            word_index: None,
            time_sec: 0.0,
            speed: 1.0,
            initial: ResumePoint::default(),
            loaded: None,
            held_path: None,
            metadata_timeout: Duration::from_secs(3),
            on_progress: None,
        }
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn set_on_progress(&mut self, callback: ProgressCallback) {
        self.on_progress = Some(callback);
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn word_index(&self) -> Option<usize> {
        self.word_index
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    pub fn current_time(&self) -> f64 {
        self.time_sec
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn shards(&self) -> &[NarrationShard] {
        &self.shards
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            shard_index: self.shard_index,
            word_index: self.word_index,
            time_sec: self.time_sec,
            speed: self.speed,
        }
    }

    /// Load a book, or refresh the shards and resume point of the current one
    #[instrument(skip(self, shards, resume), fields(shards = shards.len()))]
    pub fn load_book(&mut self, book_id: &str, shards: Vec<NarrationShard>, resume: ResumePoint) {
        self.shards = shards;

        if self.book_id.as_deref() == Some(book_id) {
            self.update_resume_point(resume);
            return;
        }

        self.teardown();
        self.book_id = Some(book_id.to_string());
        self.state = PlaybackState::Stopped;
        self.apply_resume(resume);
        debug!(word = ?resume.word_index, shard = resume.shard_index, "Book loaded");
    }

    /// Resume data that arrives after the book was loaded.
    ///
    /// Applied only while nothing is playing, so a late response never
    /// yanks an active reader back.
    pub fn update_resume_point(&mut self, resume: ResumePoint) {
        if resume == self.initial {
            return;
        }
        if matches!(self.state, PlaybackState::Stopped | PlaybackState::Buffering) {
            debug!(word = ?resume.word_index, "Applying late resume point");
            self.apply_resume(resume);
        } else {
            self.initial = resume;
        }
    }

    /// Owning shard of a global word index
    pub fn find_shard(&self, word_index: usize) -> Option<usize> {
        self.shards.iter().position(|s| s.contains_word(word_index))
    }

    pub async fn play(&mut self) {
        let word = self.word_index.unwrap_or(0);
        let shard_index = self.find_shard(word);

        if self.state == PlaybackState::Paused {
            let resumable = matches!(
                (&self.loaded, shard_index),
                (Some(loaded), Some(index)) if loaded.shard_index == index
            );
            if resumable {
                self.resume_in_place(word).await;
                return;
            }
        }

        let Some(shard_index) = shard_index else {
            warn!(word = word, "No shard contains the current word");
            return;
        };
        let start = self.mark_time(shard_index, word);

        let is_last_shard = shard_index + 1 == self.shards.len();
        let at_last_word = word >= self.shards[shard_index].end_word_index;
        if is_last_shard
            && at_last_word
            && self.state != PlaybackState::Paused
            && self.time_sec > start + FINISHED_MARGIN_SEC
        {
            info!("Last word finished, restarting from the beginning");
            self.word_index = Some(0);
            self.shard_index = 0;
            self.time_sec = 0.0;
            self.play_shard(0, 0.0, true).await;
            return;
        }

        self.play_shard(shard_index, start, true).await;
    }

    pub fn pause(&mut self) {
        if self.loaded.is_none() || !self.state.is_active() {
            return;
        }
        self.media.pause();
        self.time_sec = self.media.current_time();
        self.state = PlaybackState::Paused;
    }

    /// Move to `word_index`, keeping the current play/pause state
    pub async fn seek_to_word(&mut self, word_index: usize) {
        let Some(shard_index) = self.find_shard(word_index) else {
            debug!(word = word_index, "Seek target outside the narration");
            return;
        };
        let start = self.mark_time(shard_index, word_index);
        self.word_index = Some(word_index);

        if self.state.is_active() {
            let autoplay = self.state == PlaybackState::Playing;
            self.play_shard(shard_index, start, autoplay).await;
        } else {
            self.shard_index = shard_index;
            self.time_sec = start;
        }
    }

    pub fn set_speed(&mut self, speed: f32) {
        let Some(speed) = valid_rate(speed) else {
            return;
        };
        self.speed = speed;
        self.media.set_playback_rate(speed);
    }

    /// Deliver pending media events
    pub async fn pump(&mut self) {
        for event in self.media.poll_events() {
            match event {
                MediaEvent::TimeUpdate(time) => self.handle_time_update(time),
                MediaEvent::Ended => self.handle_ended().await,
                MediaEvent::Error(e) if e.is_interruption() => debug!("Media interrupted"),
                MediaEvent::Error(e) => {
                    warn!(error = %e, shard = self.shard_index, "Narration media failed");
                    self.state = PlaybackState::Stopped;
                }
            }
        }
    }

    pub fn handle_time_update(&mut self, time_sec: f64) {
        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(shard) = self.shards.get(self.shard_index) else {
            return;
        };

        let time_ms = (time_sec.max(0.0) * 1000.0) as u64;
        if let Some(mark) = active_timing(&shard.timings, time_ms) {
            if Some(mark.word_index) != self.word_index {
                self.word_index = Some(mark.word_index);
                if let Some(callback) = self.on_progress.as_mut() {
                    callback(mark.word_index, self.shard_index, time_sec);
                }
            }
        }
        self.time_sec = time_sec;
    }

    pub async fn handle_ended(&mut self) {
        if self.shard_index + 1 < self.shards.len() {
            self.play_shard(self.shard_index + 1, 0.0, true).await;
        } else {
            debug!("Narration finished");
            self.state = PlaybackState::Stopped;
        }
    }

    /// Release the media source and the held cache reference
    pub fn unload(&mut self) {
        self.teardown();
        self.book_id = None;
        self.state = PlaybackState::Stopped;
    }

    async fn resume_in_place(&mut self, word: usize) {
        if let Some(expected) = self
            .loaded
            .as_ref()
            .and_then(|loaded| self.shards[loaded.shard_index].timing_for(word))
            .map(|mark| mark.start_sec())
        {
            if (self.media.current_time() - expected).abs() > DRIFT_TOLERANCE_SEC {
                debug!(expected = expected, "Re-syncing paused position");
                self.media.set_current_time(expected);
            }
        }

        self.state = PlaybackState::Playing;
        self.start_media().await;
    }

    #[instrument(skip(self))]
    async fn play_shard(&mut self, shard_index: usize, start_sec: f64, autoplay: bool) {
        let Some(shard) = self.shards.get(shard_index).cloned() else {
            return;
        };
        if shard.audio_url_signed.is_empty() {
            warn!(shard = shard_index, "Shard has no audio");
            return;
        }

        let reuse = match (&self.loaded, &self.held_path) {
            (Some(loaded), Some(held)) if shard.audio_path.as_ref() == Some(held) => {
                Some(loaded.url.clone())
            }
            _ => None,
        };
        let url = match reuse {
            Some(url) => url,
            None => self.acquire(&shard).await,
        };

        if self.media.source().as_deref() != Some(url.as_str()) {
            self.state = PlaybackState::Buffering;
            self.media.set_source(&url);
            match tokio::time::timeout(self.metadata_timeout, self.media.load_metadata()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(shard = shard_index, error = %e, "Metadata load failed"),
                Err(_) => debug!(shard = shard_index, "Metadata wait timed out"),
            }
        }

        self.media.set_playback_rate(self.speed);
        self.media.set_current_time(start_sec);
        self.loaded = Some(LoadedShard { shard_index, url });
        self.shard_index = shard_index;
        self.time_sec = start_sec;

        if autoplay {
            self.state = PlaybackState::Playing;
            self.start_media().await;
        } else {
            self.state = PlaybackState::Paused;
        }
    }

    /// Take a cache reference on the shard's audio, then drop the previous one
    async fn acquire(&mut self, shard: &NarrationShard) -> String {
        let url = self
            .cache
            .get_asset(shard.audio_path.as_deref(), &shard.audio_url_signed)
            .await;

        let acquired = shard.audio_path.clone().filter(|_| is_blob_url(&url));
        match &shard.audio_path {
            Some(path) if acquired.is_some() => debug!(path = %path, "Shard audio cached"),
            Some(path) => debug!(path = %path, "Shard audio uncached"),
            None => {}
        }

        if let Some(previous) = std::mem::replace(&mut self.held_path, acquired) {
            self.cache.release_asset(&previous);
        }
        url
    }

    async fn start_media(&mut self) {
        match self.media.play().await {
            Ok(()) => {}
            Err(e) if e.is_interruption() => debug!("Playback interrupted"),
            Err(e) => {
                warn!(error = %e, "Playback failed");
                self.state = PlaybackState::Stopped;
            }
        }
    }

    fn mark_time(&self, shard_index: usize, word_index: usize) -> f64 {
        self.shards[shard_index]
            .timing_for(word_index)
            .map_or(0.0, |mark| mark.start_sec())
    }

    fn apply_resume(&mut self, resume: ResumePoint) {
        self.initial = resume;
        self.word_index = resume.word_index;
        self.shard_index = resume.shard_index;
        self.time_sec = resume.time_sec;
    }

    fn teardown(&mut self) {
        if self.loaded.take().is_some() {
            self.media.pause();
            self.media.clear_source();
        }
        if let Some(path) = self.held_path.take() {
            self.cache.release_asset(&path);
        }
    }
}

impl Drop for NarrationEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AssetCache, BlobStore};
    use crate::narration::media::MediaError;
    use crate::test_support::FakeMedia;
    use crate::types::WordTiming;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Two shards of five words, one word per second
    fn shards(base: &str, with_paths: bool) -> Vec<NarrationShard> {
        (0..2)
            .map(|chunk| {
                let first = chunk * 5;
                NarrationShard {
                    chunk_index: chunk,
                    start_word_index: first,
                    end_word_index: first + 4,
                    audio_path: with_paths.then(|| format!("books/1/{}.mp3", chunk)),
                    audio_url_signed: format!("{}/audio/{}.mp3?sig=abc", base, chunk),
                    timings: (0..5)
                        .map(|i| WordTiming {
                            word_index: first + i,
                            start_ms: i as u64 * 1000,
                            end_ms: (i as u64 + 1) * 1000,
                        })
                        .collect(),
                }
            })
            .collect()
    }

    fn memory_cache() -> SharedAssetCache {
        Arc::new(AssetCache::new(BlobStore::new(), None, Duration::from_secs(60)))
    }

    fn engine(media: &FakeMedia) -> NarrationEngine {
        let mut engine = NarrationEngine::new(media.boxed(), memory_cache());
        engine.load_book("book-1", shards("", false), ResumePoint::default());
        engine
    }

    #[tokio::test]
    async fn test_play_starts_at_word_mark() {
        let media = FakeMedia::new();
        let mut engine = NarrationEngine::new(media.boxed(), memory_cache());
        engine.load_book(
            "book-1",
            shards("", false),
            ResumePoint {
                word_index: Some(7),
                shard_index: 1,
                time_sec: 2.0,
            },
        );
        assert_eq!(engine.state(), PlaybackState::Stopped);

        engine.play().await;

        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.shard_index(), 1);
        assert_eq!(media.state().source.as_deref(), Some("/audio/1.mp3?sig=abc"));
        assert_eq!(media.state().current_time, 2.0);
        assert!(!media.state().paused);
    }

    #[tokio::test]
    async fn test_paused_resume_corrects_drift() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        engine.play().await;

        engine.handle_time_update(4.2);
        assert_eq!(engine.word_index(), Some(4));
        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Paused);

        media.state().current_time = 4.8;
        engine.play().await;

        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(media.state().seeks.last(), Some(&4.0));
        assert_eq!(media.state().play_calls, 2);
    }

    #[tokio::test]
    async fn test_paused_resume_within_tolerance_does_not_seek() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        engine.play().await;
        engine.handle_time_update(4.2);
        engine.pause();
        let seeks = media.state().seeks.len();

        media.state().current_time = 4.3;
        engine.play().await;

        assert_eq!(media.state().seeks.len(), seeks);
    }

    #[tokio::test]
    async fn test_auto_restart_after_finishing() {
        let media = FakeMedia::new();
        let mut engine = NarrationEngine::new(media.boxed(), memory_cache());
        engine.load_book(
            "book-1",
            shards("", false),
            ResumePoint {
                word_index: Some(9),
                shard_index: 1,
                time_sec: 4.9,
            },
        );

        engine.play().await;

        assert_eq!(engine.word_index(), Some(0));
        assert_eq!(engine.shard_index(), 0);
        assert_eq!(media.state().source.as_deref(), Some("/audio/0.mp3?sig=abc"));
        assert_eq!(media.state().current_time, 0.0);
    }

    #[tokio::test]
    async fn test_no_restart_when_parked_on_last_word() {
        let media = FakeMedia::new();
        let mut engine = NarrationEngine::new(media.boxed(), memory_cache());
        engine.load_book(
            "book-1",
            shards("", false),
            ResumePoint {
                word_index: Some(9),
                shard_index: 1,
                time_sec: 4.0,
            },
        );

        engine.play().await;

        assert_eq!(engine.word_index(), Some(9));
        assert_eq!(media.state().current_time, 4.0);
    }

    #[tokio::test]
    async fn test_ended_advances_then_stops() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        engine.play().await;

        media.push(MediaEvent::Ended);
        engine.pump().await;
        assert_eq!(engine.shard_index(), 1);
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(media.state().source.as_deref(), Some("/audio/1.mp3?sig=abc"));

        media.push(MediaEvent::Ended);
        engine.pump().await;
        assert_eq!(engine.state(), PlaybackState::Stopped);

        // A finished narration cannot be paused
        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn test_progress_reported_on_word_change() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        let progress = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&progress);
        engine.set_on_progress(Box::new(move |word, shard, time| {
            sink.borrow_mut().push((word, shard, time));
        }));

        // Ignored while stopped
        engine.handle_time_update(1.5);
        engine.play().await;
        media.push(MediaEvent::TimeUpdate(0.2));
        media.push(MediaEvent::TimeUpdate(1.1));
        media.push(MediaEvent::TimeUpdate(1.6));
        engine.pump().await;

        assert_eq!(progress.borrow().as_slice(), &[(0, 0, 0.2), (1, 0, 1.1)]);
        assert_eq!(engine.current_time(), 1.6);
    }

    #[tokio::test]
    async fn test_seek_to_word_by_state() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);

        engine.seek_to_word(6).await;
        assert_eq!(engine.word_index(), Some(6));
        assert_eq!(engine.shard_index(), 1);
        assert_eq!(engine.current_time(), 1.0);
        assert!(media.state().source.is_none());

        engine.play().await;
        engine.pause();
        engine.seek_to_word(2).await;
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_eq!(media.state().source.as_deref(), Some("/audio/0.mp3?sig=abc"));
        assert_eq!(media.state().current_time, 2.0);

        engine.play().await;
        engine.seek_to_word(8).await;
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(media.state().current_time, 3.0);

        // Outside every shard: nothing changes
        engine.seek_to_word(99).await;
        assert_eq!(engine.word_index(), Some(8));
    }

    #[tokio::test]
    async fn test_late_resume_point() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        let late = ResumePoint {
            word_index: Some(7),
            shard_index: 1,
            time_sec: 2.0,
        };

        engine.load_book("book-1", shards("", false), late);
        assert_eq!(engine.word_index(), Some(7));

        engine.play().await;
        engine.update_resume_point(ResumePoint::default());
        assert_eq!(engine.word_index(), Some(7));
    }

    #[tokio::test]
    async fn test_play_failure_stops() {
        let media = FakeMedia::new();
        let mut engine = engine(&media);
        media.state().play_error = Some(MediaError::Fetch("decode".to_string()));

        engine.play().await;
        assert_eq!(engine.state(), PlaybackState::Stopped);

        media.state().play_error = Some(MediaError::Aborted);
        engine.play().await;
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_metadata_still_plays() {
        let media = FakeMedia::new();
        media.state().metadata_delay = Some(Duration::from_secs(60));
        let mut engine = engine(&media);

        engine.play().await;

        assert_eq!(engine.state(), PlaybackState::Playing);
        assert!(!media.state().paused);
    }

    #[tokio::test]
    async fn test_cache_reference_follows_loaded_shard() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3".to_vec()))
            .expect(2)
            .mount(&server)
            .await;

        let cache = memory_cache();
        let media = FakeMedia::new();
        let mut engine = NarrationEngine::new(media.boxed(), cache.clone());
        engine.load_book("book-1", shards(&server.uri(), true), ResumePoint::default());

        engine.play().await;
        assert_eq!(cache.ref_count("books/1/0.mp3"), 1);
        assert!(media.state().source.as_deref().unwrap().starts_with("blob:"));

        // Seeking inside the loaded shard keeps the single reference
        engine.seek_to_word(3).await;
        assert_eq!(cache.ref_count("books/1/0.mp3"), 1);

        media.push(MediaEvent::Ended);
        engine.pump().await;
        assert_eq!(cache.ref_count("books/1/0.mp3"), 0);
        assert_eq!(cache.ref_count("books/1/1.mp3"), 1);

        engine.load_book("book-2", Vec::new(), ResumePoint::default());
        assert_eq!(cache.ref_count("books/1/1.mp3"), 0);
        assert_eq!(cache.blobs().live_count(), 0);
        assert!(media.state().source.is_none());
    }
}
