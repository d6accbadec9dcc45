//! Provider lifecycle for the content unit on screen
//!
//! A [`NarrationSession`] owns at most one provider. Loading new content tears
//! the previous provider down (listeners and audio) before the next one is
//! built, and every load carries a request id so a slow `prepare` that
//! finishes after a newer load is discarded.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::events::{NarrationEvent, ProviderEvent, Subscription};
use crate::highlight::{estimated_duration_ms, highlighted_word, HighlightInput};
use crate::narration::{NarrationFactory, NarrationProvider, ProviderConfig};
use crate::types::{NarrationError, NarrationResult, PlaybackState, PrepareInput, ProviderRequest};

/// What the listeners have seen of the active provider
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub content_id: Option<String>,
    pub state: PlaybackState,
    pub boundary_word_index: Option<usize>,
    pub result: Option<NarrationResult>,
    pub token_count: usize,
    pub ended: bool,
    /// Last failure worth showing to the reader
    pub last_error: Option<String>,
}

struct ActiveProvider {
    provider: Box<dyn NarrationProvider>,
    subscriptions: Vec<Subscription>,
}

impl ActiveProvider {
    fn teardown(mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.provider.stop();
    }
}

type DeferredCall = Box<dyn FnOnce(&mut dyn NarrationProvider)>;

struct SessionInner {
    factory: NarrationFactory,
    latest_request: Cell<u64>,
    /// Request id of a `play` that currently holds the provider
    play_in_flight: Cell<Option<u64>>,
    /// Calls made while `play` held the provider, replayed when it returns
    deferred: RefCell<Vec<DeferredCall>>,
    active: RefCell<Option<ActiveProvider>>,
    status: Rc<RefCell<SessionStatus>>,
}

/// Cheap-to-clone handle; clones drive the same session
#[derive(Clone)]
pub struct NarrationSession {
    inner: Rc<SessionInner>,
}

impl NarrationSession {
    pub fn new(factory: NarrationFactory) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                factory,
                latest_request: Cell::new(0),
                play_in_flight: Cell::new(None),
                deferred: RefCell::new(Vec::new()),
                active: RefCell::new(None),
                status: Rc::new(RefCell::new(SessionStatus::default())),
            }),
        }
    }

    pub fn factory(&self) -> &NarrationFactory {
        &self.inner.factory
    }

    pub fn status(&self) -> Ref<'_, SessionStatus> {
        self.inner.status.borrow()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.status.borrow().state
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.active.borrow().is_some()
    }

    /// Build and prepare a provider for `content`.
    ///
    /// Returns `Ok(None)` when a newer load started while this one was
    /// preparing, or when preparation was interrupted on purpose.
    pub async fn load(
        &self,
        content: PrepareInput,
        requested: ProviderRequest,
        config: &ProviderConfig,
    ) -> Result<Option<NarrationResult>, NarrationError> {
        let request_id = self.inner.latest_request.get() + 1;
        self.inner.latest_request.set(request_id);

        self.teardown();
        *self.inner.status.borrow_mut() = SessionStatus {
            content_id: Some(content.content_id.clone()),
            token_count: content.tokens.len(),
            ..SessionStatus::default()
        };

        let mut provider = match self.inner.factory.create(requested, config) {
            Ok(provider) => provider,
            Err(e) => {
                self.inner.status.borrow_mut().last_error = Some(e.to_string());
                return Err(e);
            }
        };
        info!(
            content = %content.content_id,
            provider = %provider.kind(),
            request = request_id,
            "Preparing narration"
        );
        let subscriptions = self.subscribe(provider.as_ref(), request_id);

        let prepared = provider.prepare(&content).await;

        let active = ActiveProvider {
            provider,
            subscriptions,
        };
        if self.inner.latest_request.get() != request_id {
            debug!(request = request_id, "Discarding stale narration result");
            active.teardown();
            return Ok(None);
        }

        match prepared {
            Ok(result) => {
                self.inner.status.borrow_mut().result = Some(result.clone());
                *self.inner.active.borrow_mut() = Some(active);
                Ok(Some(result))
            }
            Err(e) if e.is_interruption() => {
                debug!("Narration preparation interrupted");
                active.teardown();
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Narration preparation failed");
                active.teardown();
                let mut status = self.inner.status.borrow_mut();
                status.state = PlaybackState::Stopped;
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn play(&self) {
        let request_id = self.inner.latest_request.get();
        // Out of the cell while awaiting so listeners and other calls never hit a borrow
        let Some(mut active) = self.inner.active.borrow_mut().take() else {
            return;
        };
        self.inner.status.borrow_mut().ended = false;
        self.inner.play_in_flight.set(Some(request_id));
        active.provider.play().await;
        self.inner.play_in_flight.set(None);
        let deferred = std::mem::take(&mut *self.inner.deferred.borrow_mut());

        if self.inner.latest_request.get() == request_id && self.inner.active.borrow().is_none() {
            if !deferred.is_empty() {
                debug!(calls = deferred.len(), "Replaying calls made during play");
            }
            for call in deferred {
                call(active.provider.as_mut());
            }
            *self.inner.active.borrow_mut() = Some(active);
        } else {
            active.teardown();
        }
    }

    pub fn pause(&self) {
        self.with_provider(|p| p.pause());
    }

    pub fn stop(&self) {
        self.with_provider(|p| p.stop());
    }

    pub fn set_playback_rate(&self, rate: f32) {
        self.with_provider(move |p| p.set_playback_rate(rate));
    }

    pub fn seek_to_time(&self, seconds: f64) {
        self.with_provider(move |p| p.seek_to_time(seconds));
    }

    pub fn seek_to_word(&self, word_index: usize) {
        self.with_provider(move |p| p.seek_to_word(word_index));
        self.inner.status.borrow_mut().boundary_word_index = None;
    }

    pub fn current_time_sec(&self) -> Option<f64> {
        self.inner
            .active
            .borrow()
            .as_ref()
            .and_then(|a| a.provider.current_time_sec())
    }

    /// Deliver pending provider events
    pub fn pump(&self) {
        self.with_provider(|p| p.pump());
    }

    /// Word to highlight for the current position
    pub fn highlighted_word(&self) -> Option<usize> {
        let current_time_sec = self.current_time_sec().unwrap_or(0.0);
        let status = self.inner.status.borrow();
        let result = status.result.as_ref();
        let duration_ms = result.and_then(|r| {
            r.meta.duration_ms.or_else(|| {
                r.meta
                    .fallback_wpm
                    .and_then(|wpm| estimated_duration_ms(status.token_count, wpm))
            })
        });

        highlighted_word(&HighlightInput {
            state: status.state,
            current_time_sec,
            word_timings: result.and_then(|r| r.word_timings.as_deref()),
            token_count: status.token_count,
            duration_ms,
            boundary_word_index: status.boundary_word_index,
        })
    }

    /// Drop the provider and reset the observed state
    pub fn unload(&self) {
        self.inner.latest_request.set(self.inner.latest_request.get() + 1);
        self.teardown();
        *self.inner.status.borrow_mut() = SessionStatus::default();
    }

    fn with_provider(&self, f: impl FnOnce(&mut dyn NarrationProvider) + 'static) {
        if let Some(active) = self.inner.active.borrow_mut().as_mut() {
            f(active.provider.as_mut());
            return;
        }
        if self.inner.play_in_flight.get() == Some(self.inner.latest_request.get()) {
            self.inner.deferred.borrow_mut().push(Box::new(f));
        }
    }

    fn teardown(&self) {
        self.inner.deferred.borrow_mut().clear();
        let previous = self.inner.active.borrow_mut().take();
        if let Some(active) = previous {
            active.teardown();
        }
    }

    fn subscribe(&self, provider: &dyn NarrationProvider, request_id: u64) -> Vec<Subscription> {
        [
            NarrationEvent::State,
            NarrationEvent::Boundary,
            NarrationEvent::Ended,
            NarrationEvent::Error,
        ]
        .into_iter()
        .map(|event| {
            let status = Rc::clone(&self.inner.status);
            let inner = Rc::downgrade(&self.inner);
            provider.on(
                event,
                Box::new(move |e: &ProviderEvent| {
                    let current = inner
                        .upgrade()
                        .is_some_and(|i| i.latest_request.get() == request_id);
                    if current {
                        apply_event(&mut status.borrow_mut(), e);
                    }
                }),
            )
        })
        .collect()
    }
}

fn apply_event(status: &mut SessionStatus, event: &ProviderEvent) {
    match event {
        ProviderEvent::State(state) => status.state = (*state).into(),
        ProviderEvent::Boundary(index) => status.boundary_word_index = Some(*index),
        ProviderEvent::Ended => {
            status.ended = true;
            status.state = PlaybackState::Stopped;
        }
        ProviderEvent::Error(e) if e.is_interruption() => {}
        ProviderEvent::Error(e) => {
            status.last_error = Some(e.to_string());
            status.state = PlaybackState::Stopped;
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.teardown();
        }
    }
}
