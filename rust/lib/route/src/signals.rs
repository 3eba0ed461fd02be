use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::TransitionError;
use crate::params::Params;
use crate::tree::StateId;
use crate::value::SubscriptionId;

/// One side of a transition: a leaf state and its params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub state: StateId,
    /// Dotted full name of `state`.
    pub name: String,
    pub params: Params,
}

/// Transition lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Completed,
    Failed,
    Cancelled,
    /// Fires after each `Completed`, `Failed` or `Cancelled`.
    Ended,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Cancelled => "cancelled",
            EventKind::Ended => "ended",
        })
    }
}

/// Payload delivered to event handlers.
#[derive(Debug, Clone)]
pub struct RouterEvent {
    pub kind: EventKind,
    /// `None` for the first transition.
    pub from: Option<Endpoint>,
    pub to: Endpoint,
    /// Set for `Failed`.
    pub error: Option<TransitionError>,
}

/// Callback type for lifecycle events.
pub type EventHandler = Arc<dyn Fn(&RouterEvent) + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Per-kind event subscriptions.
///
/// Handlers run synchronously on the thread that emits, after the router
/// released its own locks, so they may call back into the router.
pub(crate) struct Signals {
    handlers: RwLock<Vec<HandlerEntry>>,
    /// Monotonic counter for subscription IDs.
    next_id: AtomicU64,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = HandlerEntry {
            id,
            kind,
            handler: Arc::new(handler),
        };
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        id
    }

    /// Returns `true` if a handler was removed.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|e| e.id != id);
        handlers.len() < before
    }

    pub(crate) fn emit(&self, event: &RouterEvent) {
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == event.kind)
            .map(|e| Arc::clone(&e.handler))
            .collect();
        for handler in matching {
            handler(event);
        }
    }

    /// Emit `kind` and then `Ended` for the same endpoints.
    pub(crate) fn emit_terminal(
        &self,
        kind: EventKind,
        from: Option<Endpoint>,
        to: Endpoint,
        error: Option<TransitionError>,
    ) {
        let mut event = RouterEvent {
            kind,
            from,
            to,
            error,
        };
        self.emit(&event);
        event.kind = EventKind::Ended;
        self.emit(&event);
    }
}
