//! Observer lists for provider events
//!
//! Each provider owns an [`EventEmitter`]. Callers register listeners with
//! [`EventEmitter::on`] and keep the returned [`Subscription`] to remove them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::types::{NarrationError, ProviderState};

/// Event names a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NarrationEvent {
    Ended,
    Error,
    State,
    Boundary,
}

/// Payload delivered to listeners
#[derive(Debug)]
pub enum ProviderEvent {
    Ended,
    Error(NarrationError),
    State(ProviderState),
    /// Global index of the word the speech engine just reached
    Boundary(usize),
}

impl ProviderEvent {
    pub fn name(&self) -> NarrationEvent {
        match self {
            Self::Ended => NarrationEvent::Ended,
            Self::Error(_) => NarrationEvent::Error,
            Self::State(_) => NarrationEvent::State,
            Self::Boundary(_) => NarrationEvent::Boundary,
        }
    }
}

type Listener = Rc<RefCell<Box<dyn FnMut(&ProviderEvent)>>>;

#[derive(Default)]
struct Listeners {
    next_id: Cell<u64>,
    by_event: RefCell<HashMap<NarrationEvent, Vec<(u64, Listener)>>>,
}

/// Per-event listener registry
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Rc<Listeners>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`
    pub fn on<F>(&self, event: NarrationEvent, callback: F) -> Subscription
    where
        F: FnMut(&ProviderEvent) + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let listener: Listener = Rc::new(RefCell::new(Box::new(callback)));
        self.inner
            .by_event
            .borrow_mut()
            .entry(event)
            .or_default()
            .push((id, listener));

        Subscription {
            registry: Rc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// The listener list is snapshotted first, so a callback may subscribe or
    /// unsubscribe while being called.
    pub fn emit(&self, event: ProviderEvent) {
        let snapshot: Vec<Listener> = match self.inner.by_event.borrow().get(&event.name()) {
            Some(listeners) => listeners.iter().map(|(_, l)| Rc::clone(l)).collect(),
            None => return,
        };

        for listener in snapshot {
            // A listener that re-enters emit for itself is skipped instead of panicking
            if let Ok(mut callback) = listener.try_borrow_mut() {
                callback(&event);
            }
        }
    }

    pub fn listener_count(&self, event: NarrationEvent) -> usize {
        self.inner
            .by_event
            .borrow()
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.inner.by_event.borrow_mut().clear();
    }
}

/// Handle returned by [`EventEmitter::on`]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Listeners>,
    event: NarrationEvent,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Safe to call after the emitter is gone.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(listeners) = registry.by_event.borrow_mut().get_mut(&self.event) {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
