//! The single-producer, multiple-subscriber asynchronous stream contract every operator
//! consumes and produces.
//!
//! A stream carries at most one terminal event (`Error` or `Completed`) after any number of
//! `Next` events; nothing further is delivered once a terminal has been observed. Subscribing
//! returns a [`Subscription`] whose `Drop` impl is the cancellation handle: it stops delivery,
//! cancels any finalizer registered with [`Subscription::on_dispose`], and (via the disposer
//! closure an operator installs) releases every upstream subscription the operator created —
//! cancellation composes the same way `mongodb`'s `WorkerHandle` composes pool-worker lifetime
//! with connection-handle lifetime.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::error::{Error, ErrorKind};

/// One of the three values an observable stream can deliver: zero or more `Next`s, followed by
/// at most one terminal (`Error` or `Completed`).
#[derive(Clone, Debug)]
pub enum Event<T> {
    /// A regular emission — for a change-set stream, one atomic batch.
    Next(T),
    /// A terminal failure. No further events follow.
    Error(Error),
    /// Graceful completion. No further events follow.
    Completed,
}

impl<T> Event<T> {
    /// The carried value, if this is a `Next` event.
    pub fn next(self) -> Option<T> {
        match self {
            Event::Next(v) => Some(v),
            _ => None,
        }
    }
}

/// A live subscription to an [`Observable`]. Implements [`Stream`] so it can be consumed with
/// the usual combinators; dropping it (or calling [`Subscription::unsubscribe`] explicitly) runs
/// the registered disposer exactly once, even if the subscription is dropped while the stream is
/// mid-delivery or while unwinding from a panic.
pub struct Subscription<T> {
    inner: Pin<Box<dyn Stream<Item = Event<T>> + Send>>,
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(inner: Pin<Box<dyn Stream<Item = Event<T>> + Send>>) -> Self {
        Self { inner, disposer: None }
    }

    /// Registers a finalizer to run exactly once, when this subscription is disposed. Operators
    /// use this to release upstream subscriptions and cancel pending timers.
    pub(crate) fn on_dispose(mut self, disposer: impl FnOnce() + Send + 'static) -> Self {
        self.disposer = Some(Box::new(disposer));
        self
    }

    /// Explicitly disposes the subscription. Idempotent: calling this and then dropping the
    /// value (or calling it twice, via separate owned references) only runs the disposer once.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Event<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Prepends a synthetic initial emission to a live event stream. This is the mechanism behind
/// every `connect`-style subscription: the initial value is captured under the operator's gate
/// at subscribe time, so it reflects exactly the state the instant before the live stream takes
/// over, with no gap and no duplicate in between.
pub(crate) fn snapshot_then_live<T: Send + 'static>(
    initial: T,
    live: Pin<Box<dyn Stream<Item = Event<T>> + Send>>,
) -> Pin<Box<dyn Stream<Item = Event<T>> + Send>> {
    Box::pin(futures_util::stream::once(async move { Event::Next(initial) }).chain(live))
}

/// A source of an observable stream of `T`. Operators implement this over their downstream
/// change-set type; subscribing is what causes the operator to (lazily) subscribe to its own
/// upstream in turn, forming the subscription tree described in the ownership model.
pub trait Observable<T>: Send + Sync {
    /// Subscribes to this observable, returning a live [`Subscription`].
    fn subscribe(&self) -> Subscription<T>;
}

/// The multi-subscriber broadcast hub backing every operator's downstream stream. Wraps a
/// `tokio::sync::broadcast` channel; a subscriber that falls too far behind to keep up with the
/// channel's capacity observes an `Error` (rather than silently missing change sets, which would
/// violate the ordering guarantee) and is not otherwise special-cased.
pub(crate) struct Broadcaster<T: Clone + Send + 'static> {
    sender: broadcast::Sender<Event<T>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, item: T) {
        // No receivers is not an error: a broadcaster with zero live subscribers simply drops
        // the emission, the same way a `mongodb` event handler with no configured sink is a
        // no-op rather than a failure.
        let _ = self.sender.send(Event::Next(item));
    }

    pub(crate) fn fail(&self, error: Error) {
        let _ = self.sender.send(Event::Error(error));
    }

    pub(crate) fn complete(&self) {
        let _ = self.sender.send(Event::Completed);
    }

    /// Subscribes a raw receiver stream, without any synthetic initial emission. Operators that
    /// need to prepend an initial snapshot (the source cache's `connect`, a group's member
    /// stream) wrap this with their own logic before handing it to the caller.
    pub(crate) fn subscribe_stream(&self) -> Pin<Box<dyn Stream<Item = Event<T>> + Send>>
    where
        T: Send + 'static,
    {
        let stream = BroadcastStream::new(self.sender.subscribe()).map(|result| match result {
            Ok(event) => event,
            Err(_lagged) => Event::Error(Error::from(ErrorKind::Internal {
                message: "subscriber fell too far behind the change-set broadcaster".into(),
            })),
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use futures_util::StreamExt;

    use super::Event;
    use crate::change::ChangeSet;

    /// Drains a subscription's change sets into a `Vec`, the way the engine's operator tests
    /// collect emissions for assertion instead of driving a real downstream consumer.
    pub(crate) async fn collect<K, V>(
        mut sub: super::Subscription<ChangeSet<K, V>>,
        count: usize,
    ) -> Vec<ChangeSet<K, V>> {
        let out = Arc::new(Mutex::new(Vec::new()));
        while out.lock().unwrap().len() < count {
            match sub.next().await {
                Some(Event::Next(cs)) => out.lock().unwrap().push(cs),
                Some(Event::Error(e)) => panic!("unexpected error: {e}"),
                Some(Event::Completed) | None => break,
                _ => {}
            }
        }
        Arc::try_unwrap(out).unwrap().into_inner().unwrap()
    }
}
