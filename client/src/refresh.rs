//! Routes room events to cache-refresh callbacks.
//!
//! DESIGN
//! ======
//! An event payload is only a hint. Receivers never patch cached data from
//! it; they refetch whatever `RoomEvent::refresh_targets` names. Each
//! registered callback runs exactly once per routed event, with every
//! target of that event in one request, so a callback that refetches a
//! list does not fire twice for a card moving between two lists it shows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use frames::event::{EventEnvelope, RefreshTarget};
use serde_json::Value;
use tracing::debug;

/// Why a refresh was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshCause {
    Event(EventEnvelope),
    /// Connection was re-established; events may have been missed.
    Reconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    pub targets: Vec<RefreshTarget>,
    pub cause: RefreshCause,
}

pub type RefreshCallback = Arc<dyn Fn(&RefreshRequest) + Send + Sync>;

/// Handle returned by [`RefreshRouter::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct RefreshRouter {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(CallbackId, RefreshCallback)>>,
}

impl RefreshRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: impl Fn(&RefreshRequest) + Send + Sync + 'static) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Decode a `room:event` payload and route it. Unknown event types are
    /// dropped. Returns the decoded envelope when it was routed.
    pub fn route_value(&self, payload: &Value) -> Option<EventEnvelope> {
        match serde_json::from_value::<EventEnvelope>(payload.clone()) {
            Ok(envelope) => {
                self.route_event(&envelope);
                Some(envelope)
            }
            Err(e) => {
                let kind = payload.get("type").and_then(Value::as_str).unwrap_or("-");
                debug!(kind, error = %e, "refresh: ignoring unrecognized room event");
                None
            }
        }
    }

    /// Returns the number of callbacks invoked.
    pub fn route_event(&self, envelope: &EventEnvelope) -> usize {
        let request = RefreshRequest {
            targets: envelope.event.refresh_targets(),
            cause: RefreshCause::Event(envelope.clone()),
        };
        self.fire(&request)
    }

    pub fn route_reconnect(&self) -> usize {
        self.fire(&RefreshRequest { targets: vec![RefreshTarget::All], cause: RefreshCause::Reconnected })
    }

    fn fire(&self, request: &RefreshRequest) -> usize {
        // Callbacks run outside the lock so they may register or unregister.
        let callbacks: Vec<RefreshCallback> = self.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in &callbacks {
            callback(request);
        }
        callbacks.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(CallbackId, RefreshCallback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "refresh_test.rs"]
mod tests;
