//! Listener registries backing the event streams of proxies, devices and characteristics.

use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use futures_channel::mpsc;
use futures_util::Stream;

/// Identifies a listener registered on an [`Emitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A cloneable, thread-safe set of listeners for events of type `T`.
///
/// Clones share the same set of listeners. Listeners are invoked in registration order, outside
/// of the internal lock, so a listener may register or remove listeners (including itself).
pub struct Emitter<T> {
    listeners: Arc<Mutex<Vec<(ListenerId, Callback<T>)>>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Callback<T>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `listener`, returning an id that can be passed to [`Emitter::off`].
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered (anymore).
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    /// Removes every listener.
    pub fn remove_all(&self) {
        self.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: &T) {
        let snapshot = self
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect::<Vec<_>>();
        for cb in snapshot {
            cb(event);
        }
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Returns a [`Stream`] yielding every event emitted from now on.
    ///
    /// The underlying listener is removed when the stream is dropped.
    pub fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let id = self.on(move |event: &T| {
            // The receiver may already be gone; the listener is removed on drop.
            let _ = tx.unbounded_send(event.clone());
        });
        EventStream {
            rx,
            id,
            emitter: self.clone(),
        }
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// A [`Stream`] of events, returned by [`Emitter::stream`].
///
/// The stream ends when all listeners of the [`Emitter`] are removed.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    id: ListenerId,
    emitter: Emitter<T>,
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.emitter.off(self.id);
    }
}
