//! Cold, lazy, cancellable streams of partial results.
//!
//! A [`PartialStream`] owns a producer closure that runs only once a
//! consumer subscribes; each subscription is an independent execution that
//! delivers zero or more items followed by exactly one termination event
//! (`Complete` or `Error`). Disposal is cooperative: cancelling the
//! subscription token stops delivery immediately and producers observe the
//! token at their next suspension point.
//!
//! Combinators:
//! - [`PartialStream::map`]: synchronous, order-preserving, errors from the
//!   function terminate the stream;
//! - [`PartialStream::concat`]: subscribes to the second stream only after
//!   the first completes;
//! - [`PartialStream::merge`]: interleaves N streams, completes when all
//!   complete, errors eagerly and disposes the siblings;
//! - [`PartialStream::observe_on`]: re-dispatches the producer onto a
//!   compute pool, preserving per-subscription order.
//!
//! There is no backpressure at this level: payloads are small and item rate
//! is bounded by the scheduler.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use pdq_common::{PdqError, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::scheduler::ComputePool;

/// One delivery on a subscription.
#[derive(Debug)]
pub enum Event<R> {
    /// A stream item.
    Next(R),
    /// Successful termination.
    Complete,
    /// Failed termination.
    Error(PdqError),
}

type Producer<R> = Box<dyn FnOnce(Emitter<R>) -> BoxFuture<'static, ()> + Send>;

/// A cold producer of items of type `R`.
pub struct PartialStream<R> {
    producer: Producer<R>,
    scheduler: Option<tokio::runtime::Handle>,
}

/// The producer side of one subscription.
pub struct Emitter<R> {
    tx: mpsc::UnboundedSender<Event<R>>,
    cancel: CancellationToken,
}

impl<R> Emitter<R> {
    /// Delivers one item. Returns false once the subscription is disposed
    /// or the consumer is gone; producers should stop promptly.
    pub fn next(&self, item: R) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(Event::Next(item)).is_ok()
    }

    /// Terminates the subscription successfully.
    pub fn complete(&self) {
        let _ = self.tx.send(Event::Complete);
    }

    /// Terminates the subscription with an error.
    pub fn error(&self, err: PdqError) {
        let _ = self.tx.send(Event::Error(err));
    }

    /// Whether the consumer disposed this subscription.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The subscription's cancellation token. Producers pass it to child
    /// subscriptions so disposal propagates all the way upstream.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A disposable reference to a live subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Builds a handle around an existing token.
    pub fn from_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Builds an already-disposed handle.
    pub fn disposed() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self { cancel }
    }

    /// Cancels production and delivery. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Whether the subscription has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One live execution of a [`PartialStream`].
///
/// Yields events in producer order; after disposal or a termination event
/// no further events are delivered. Dropping the subscription disposes it.
pub struct StreamSubscription<R> {
    rx: mpsc::UnboundedReceiver<Event<R>>,
    handle: SubscriptionHandle,
    terminated: bool,
}

impl<R> StreamSubscription<R> {
    /// A disposable handle to this subscription.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Disposes the subscription. Idempotent.
    pub fn dispose(&mut self) {
        self.handle.dispose();
    }

    /// Awaits the next event; `None` after termination or disposal.
    pub async fn next_event(&mut self) -> Option<Event<R>> {
        if self.terminated || self.handle.is_disposed() {
            return None;
        }
        match self.rx.recv().await {
            Some(ev) => {
                if matches!(ev, Event::Complete | Event::Error(_)) {
                    self.terminated = true;
                }
                if self.handle.is_disposed() {
                    return None;
                }
                Some(ev)
            }
            None => {
                self.terminated = true;
                None
            }
        }
    }

    /// Collects all items, returning them with the termination outcome.
    pub async fn drain(mut self) -> (Vec<R>, Result<()>) {
        let mut items = Vec::new();
        loop {
            match self.next_event().await {
                Some(Event::Next(item)) => items.push(item),
                Some(Event::Complete) => return (items, Ok(())),
                Some(Event::Error(e)) => return (items, Err(e)),
                None => return (items, Err(PdqError::Cancelled)),
            }
        }
    }
}

impl<R> futures::Stream for StreamSubscription<R> {
    type Item = Result<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated || self.handle.is_disposed() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Event::Next(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Event::Complete)) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Event::Error(e))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Drop for StreamSubscription<R> {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}

impl<R: Send + 'static> PartialStream<R> {
    /// Wraps an async producer. The closure runs only when a consumer
    /// subscribes, once per subscription.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Emitter<R>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            producer: Box::new(move |em| producer(em).boxed()),
            scheduler: None,
        }
    }

    /// A stream of exactly one item.
    pub fn just(item: R) -> Self {
        Self::new(move |em| async move {
            em.next(item);
            em.complete();
        })
    }

    /// A stream that terminates immediately with `err`.
    pub fn error(err: PdqError) -> Self {
        Self::new(move |em| async move {
            em.error(err);
        })
    }

    /// A stream that completes without items.
    pub fn empty() -> Self {
        Self::new(move |em| async move {
            em.complete();
        })
    }

    /// A single-item stream whose value is computed lazily at subscription
    /// time. A disposed subscription skips the computation entirely.
    pub fn from_callable<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        Self::new(move |em| async move {
            if em.is_disposed() {
                return;
            }
            match f() {
                Ok(item) => {
                    if em.next(item) {
                        em.complete();
                    }
                }
                Err(e) => em.error(e),
            }
        })
    }

    /// Subscribes with a fresh cancellation token.
    pub fn subscribe(self) -> StreamSubscription<R> {
        self.subscribe_with(CancellationToken::new())
    }

    /// Subscribes using the given token, so the caller (or a parent
    /// stream) controls disposal.
    pub fn subscribe_with(self, cancel: CancellationToken) -> StreamSubscription<R> {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Emitter {
            tx,
            cancel: cancel.clone(),
        };
        let fut = (self.producer)(emitter);
        match self.scheduler {
            Some(handle) => {
                handle.spawn(fut);
            }
            None => {
                tokio::spawn(fut);
            }
        }
        StreamSubscription {
            rx,
            handle: SubscriptionHandle::from_token(cancel),
            terminated: false,
        }
    }

    /// Order-preserving synchronous transformation; an error from `f`
    /// terminates the stream.
    pub fn map<S, F>(self, mut f: F) -> PartialStream<S>
    where
        S: Send + 'static,
        F: FnMut(R) -> Result<S> + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        let mut stream = PartialStream::new(move |em: Emitter<S>| async move {
            let mut sub = self.subscribe_with(em.token().child_token());
            loop {
                match sub.next_event().await {
                    Some(Event::Next(item)) => match f(item) {
                        Ok(mapped) => {
                            if !em.next(mapped) {
                                return;
                            }
                        }
                        Err(e) => {
                            em.error(e);
                            return;
                        }
                    },
                    Some(Event::Complete) => {
                        em.complete();
                        return;
                    }
                    Some(Event::Error(e)) => {
                        em.error(e);
                        return;
                    }
                    None => return,
                }
            }
        });
        stream.scheduler = scheduler;
        stream
    }

    /// Runs `other` after this stream completes. An error in this stream
    /// suppresses `other` entirely; disposal cancels whichever stream is
    /// active.
    pub fn concat(self, other: PartialStream<R>) -> PartialStream<R> {
        PartialStream::new(move |em| async move {
            let mut first = self.subscribe_with(em.token().child_token());
            loop {
                match first.next_event().await {
                    Some(Event::Next(item)) => {
                        if !em.next(item) {
                            return;
                        }
                    }
                    Some(Event::Complete) => break,
                    Some(Event::Error(e)) => {
                        em.error(e);
                        return;
                    }
                    None => return,
                }
            }
            let mut second = other.subscribe_with(em.token().child_token());
            loop {
                match second.next_event().await {
                    Some(Event::Next(item)) => {
                        if !em.next(item) {
                            return;
                        }
                    }
                    Some(Event::Complete) => {
                        em.complete();
                        return;
                    }
                    Some(Event::Error(e)) => {
                        em.error(e);
                        return;
                    }
                    None => return,
                }
            }
        })
    }

    /// Interleaves items from all streams in arrival order. Completes when
    /// every input completes; the first error disposes the remaining
    /// inputs and is propagated.
    pub fn merge(streams: Vec<PartialStream<R>>) -> PartialStream<R> {
        PartialStream::new(move |em| async move {
            if streams.is_empty() {
                em.complete();
                return;
            }
            let total = streams.len();
            let (funnel_tx, mut funnel_rx) = mpsc::unbounded_channel::<Event<R>>();
            let children = em.token().child_token();
            for stream in streams {
                let funnel = funnel_tx.clone();
                let token = children.child_token();
                tokio::spawn(async move {
                    let mut sub = stream.subscribe_with(token);
                    loop {
                        match sub.next_event().await {
                            Some(ev) => {
                                let terminal = matches!(ev, Event::Complete | Event::Error(_));
                                if funnel.send(ev).is_err() || terminal {
                                    return;
                                }
                            }
                            // Producer vanished without terminating; count
                            // the branch as finished so the merge can end.
                            None => {
                                let _ = funnel.send(Event::Complete);
                                return;
                            }
                        }
                    }
                });
            }
            drop(funnel_tx);

            let mut completed = 0usize;
            while let Some(ev) = funnel_rx.recv().await {
                match ev {
                    Event::Next(item) => {
                        if !em.next(item) {
                            children.cancel();
                            return;
                        }
                    }
                    Event::Complete => {
                        completed += 1;
                        if completed == total {
                            em.complete();
                            return;
                        }
                    }
                    Event::Error(e) => {
                        children.cancel();
                        em.error(e);
                        return;
                    }
                }
            }
            em.complete();
        })
    }

    /// Re-dispatches this stream's production (and hence item delivery)
    /// onto the given compute pool. Per-subscription order is preserved;
    /// the subscriber's own task never runs the producer.
    pub fn observe_on(mut self, pool: &ComputePool) -> Self {
        self.scheduler = Some(pool.handle());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn from_callable_is_cold_until_subscribed() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let stream = PartialStream::from_callable(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(7i64)
        });
        assert!(!ran.load(Ordering::SeqCst));
        let (items, outcome) = stream.subscribe().drain().await;
        assert!(outcome.is_ok());
        assert_eq!(items, vec![7]);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn map_preserves_order_and_propagates_errors() {
        let stream = PartialStream::just(1i64)
            .concat(PartialStream::just(2))
            .map(|x| Ok(x * 10));
        let (items, outcome) = stream.subscribe().drain().await;
        assert!(outcome.is_ok());
        assert_eq!(items, vec![10, 20]);

        let failing = PartialStream::just(1i64).map(|_| -> Result<i64> {
            Err(PdqError::UserCode("bad mapper".to_string()))
        });
        let (items, outcome) = failing.subscribe().drain().await;
        assert!(items.is_empty());
        assert!(matches!(outcome, Err(PdqError::UserCode(_))));
    }

    #[tokio::test]
    async fn concat_runs_second_only_after_first_completes() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let second = PartialStream::from_callable(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(2i64)
        });
        let first = PartialStream::error(PdqError::UserCode("first failed".to_string()));
        let (items, outcome) = first.concat(second).subscribe().drain().await;
        assert!(items.is_empty());
        assert!(outcome.is_err());
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn merge_completes_when_all_children_complete() {
        let streams = vec![
            PartialStream::just(1i64),
            PartialStream::just(2),
            PartialStream::just(3),
        ];
        let (mut items, outcome) = PartialStream::merge(streams).subscribe().drain().await;
        assert!(outcome.is_ok());
        items.sort_unstable();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn merge_propagates_first_error_eagerly() {
        let slow = PartialStream::new(|em: Emitter<i64>| async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            em.next(1);
            em.complete();
        });
        let failing = PartialStream::error(PdqError::UserCode("child failed".to_string()));
        let merged = PartialStream::merge(vec![slow, failing]);
        let start = std::time::Instant::now();
        let (items, outcome) = merged.subscribe().drain().await;
        assert!(items.is_empty());
        assert!(matches!(outcome, Err(PdqError::UserCode(_))));
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dispose_stops_delivery() {
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        let stream = PartialStream::new(move |em: Emitter<u64>| async move {
            for i in 0.. {
                if !em.next(i) {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        });
        let mut sub = stream.subscribe();
        let first = sub.next_event().await;
        assert!(matches!(first, Some(Event::Next(0))));
        sub.dispose();
        assert!(sub.next_event().await.is_none());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after_dispose = emitted.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Producer observed the disposal and stopped.
        assert!(emitted.load(Ordering::SeqCst) <= after_dispose + 1);
    }

    #[tokio::test]
    async fn observe_on_preserves_order() {
        let pool = ComputePool::new(2).expect("pool");
        let stream = PartialStream::just(1i64)
            .concat(PartialStream::just(2))
            .concat(PartialStream::just(3))
            .observe_on(&pool);
        let (items, outcome) = stream.subscribe().drain().await;
        assert!(outcome.is_ok());
        assert_eq!(items, vec![1, 2, 3]);
    }
}
