//! Event handler registry.
//!
//! Sinks registered here receive every payload the session's bridge loop
//! decodes, in gateway order.

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use crate::event::Event;

/// Events a subscriber may fall behind by before new ones are dropped for it.
pub const SUBSCRIBER_BACKLOG: usize = 10_000;

type Sink = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Inner {
    sinks: Vec<(u64, Sink)>,
}

/// Publish/subscribe registry for decoded gateway events.
#[derive(Default)]
pub struct Handler {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Handler {
    /// Create an empty handler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback. It is removed when the returned guard is dropped
    /// or [`HandlerGuard::remove`]d.
    ///
    /// Callbacks run on the bridge loop's task and must not block.
    pub fn add_handler<F>(self: &Arc<Self>, sink: F) -> HandlerGuard
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sinks
            .push((id, Arc::new(sink)));

        HandlerGuard {
            handler: Arc::clone(self),
            id: Some(id),
        }
    }

    /// Register a channel that receives a clone of every event, buffering up
    /// to [`SUBSCRIBER_BACKLOG`] of them.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> (HandlerGuard, mpsc::Receiver<Event>) {
        self.subscribe_with_backlog(SUBSCRIBER_BACKLOG)
    }

    /// Like [`Handler::subscribe`] with an explicit backlog.
    ///
    /// Once the receiver is `backlog` events behind, further events are
    /// dropped for it (and logged) until it catches up. Other sinks are not
    /// affected.
    #[must_use]
    pub fn subscribe_with_backlog(
        self: &Arc<Self>,
        backlog: usize,
    ) -> (HandlerGuard, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let guard = self.add_handler(move |ev| match tx.try_send(ev.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::warn!(event = ev.kind(), "Subscriber lagging, dropping event");
            }
        });
        (guard, rx)
    }

    /// Publish an event to every registered sink.
    pub fn call(&self, event: &Event) {
        // Snapshot so sinks may add or remove handlers while running.
        let sinks: Vec<Sink> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sinks
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        for sink in sinks {
            sink(event);
        }
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sinks
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sinks
            .retain(|(sink_id, _)| *sink_id != id);
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("sinks", &self.len()).finish()
    }
}

/// Registration handle returned by [`Handler::add_handler`].
#[must_use = "the handler is removed as soon as the guard is dropped"]
pub struct HandlerGuard {
    handler: Arc<Handler>,
    id: Option<u64>,
}

impl HandlerGuard {
    /// Remove the handler now.
    pub fn remove(mut self) {
        if let Some(id) = self.id.take() {
            self.handler.remove(id);
        }
    }

    /// Keep the handler registered for the lifetime of the [`Handler`].
    pub fn detach(mut self) {
        self.id = None;
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.handler.remove(id);
        }
    }
}
