//! Delivery of "new track source" events from whatever owns the import flow.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value as JsonValue};

/// Well-known name of the track source event.
pub const TRACK_SOURCE_EVENT: &str = "gpx-track-source";
/// Payload key carrying the track URL.
pub const TRACK_SOURCE_URL_KEY: &str = "url";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSourceEvent {
    pub url: String,
}

type Handler = Rc<RefCell<dyn FnMut(&TrackSourceEvent)>>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Single-threaded publish/subscribe channel for track source events.
#[derive(Clone, Default)]
pub struct TrackSourceBus {
    inner: Rc<RefCell<BusInner>>,
}

impl TrackSourceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. It stays registered until the returned
    /// subscription is dropped.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&TrackSourceEvent) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = inner.next_id;
        let handler: Handler = Rc::new(RefCell::new(handler));
        inner.handlers.push((id, handler));

        Subscription {
            id,
            bus: Rc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber. Returns how many received it.
    pub fn post(&self, event: &TrackSourceEvent) -> usize {
        // Handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .inner
            .borrow()
            .handlers
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();

        log::debug!("posting track source {} to {} subscriber(s)", event.url, handlers.len());
        for handler in &handlers {
            (&mut *handler.borrow_mut())(event);
        }
        handlers.len()
    }

    /// Deliver a loosely typed event. Anything other than
    /// [`TRACK_SOURCE_EVENT`] with a string [`TRACK_SOURCE_URL_KEY`] is
    /// ignored and reported as `false`.
    pub fn post_named(&self, name: &str, payload: &Map<String, JsonValue>) -> bool {
        if name != TRACK_SOURCE_EVENT {
            return false;
        }
        match payload.get(TRACK_SOURCE_URL_KEY) {
            Some(JsonValue::String(url)) => {
                self.post(&TrackSourceEvent { url: url.clone() });
                true
            }
            _ => {
                log::warn!("{TRACK_SOURCE_EVENT} event without a '{TRACK_SOURCE_URL_KEY}' string");
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().handlers.len()
    }
}

/// Handle of a registered handler; unregisters on drop.
pub struct Subscription {
    id: u64,
    bus: Weak<RefCell<BusInner>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.borrow_mut().handlers.retain(|(id, _)| *id != self.id);
        }
    }
}
