//! # Async Iterator Adapter
//!
//! Pull-based view of one subscription, as consumed by a GraphQL
//! subscription resolver.
//!
//! ```text
//!   Unstarted --next()--> Subscribed --> Running --cancel()/throw()/close--> Closed
//! ```
//!
//! The bus subscribe runs at most once per adapter, however many `next()`
//! calls race for it; its result (handle or error) is cached and replayed.
//! It runs on its own task, so a `next()` dropped mid-subscribe neither
//! restarts it nor loses the subscription it creates.
//! Teardown closes the delivery queue, resolves every waiting `next()` with
//! `None` and unsubscribes exactly once.

use crate::bus::ReceivedMessage;
use crate::engine::{PubSubEngine, SubscribeOptions, SubscriptionHandler};
use crate::error::PubSubError;
use crate::queue::DeliveryQueue;
use crate::tracker::SubscriptionHandle;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The one subscribe an adapter performs, awaitable by any number of callers.
type SharedSubscribe = Shared<BoxFuture<'static, Result<SubscriptionHandle, PubSubError>>>;

/// Async iterator over the payloads delivered to one subscription.
///
/// Dropping a running adapter schedules its teardown on the current tokio
/// runtime.
pub struct PubSubAsyncIterator<T> {
    inner: Arc<IteratorInner<T>>,
}

struct IteratorInner<T> {
    engine: PubSubEngine,
    subscription_id: String,
    options: SubscribeOptions,
    /// Set by the first `next()`; never set once the adapter is closed.
    subscribe: Mutex<Option<SharedSubscribe>>,
    running: AtomicBool,
    /// `None` is the end-of-stream marker handed to waiters on close.
    queue: Mutex<DeliveryQueue<Option<T>>>,
}

impl<T> PubSubAsyncIterator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        engine: PubSubEngine,
        subscription_id: String,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(IteratorInner {
                engine,
                subscription_id,
                options,
                subscribe: Mutex::new(None),
                running: AtomicBool::new(true),
                queue: Mutex::new(DeliveryQueue::new()),
            }),
        }
    }

    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait for the next payload.
    ///
    /// `Ok(None)` means the iterator is done. The first call subscribes.
    ///
    /// # Errors
    ///
    /// The subscribe failure, returned once; the adapter is closed afterwards.
    pub async fn next(&self) -> Result<Option<T>, PubSubError> {
        let inner = &self.inner;
        let Some(subscribe) = inner.start_subscribe() else {
            return Ok(None);
        };

        if let Err(error) = subscribe.await {
            // Whoever performs the teardown reports the failure; the rest see done.
            return match inner.teardown().await {
                Ok(true) => Err(error),
                Ok(false) | Err(_) => Ok(None),
            };
        }
        if !inner.running.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        if inner.queue.lock().consume(tx).is_err() {
            return Ok(None);
        }
        Ok(rx.await.unwrap_or(None))
    }

    /// Stop iterating and release the subscription.
    ///
    /// Safe to call repeatedly; only the first call does anything. A subscribe
    /// still in flight is awaited and then released.
    ///
    /// # Errors
    ///
    /// Transport errors from unsubscribing.
    pub async fn cancel(&self) -> Result<(), PubSubError> {
        self.inner.teardown().await.map(|_| ())
    }

    /// Tear down like [`cancel`](Self::cancel), then hand `error` back.
    ///
    /// # Errors
    ///
    /// Always `error`.
    pub async fn throw<E>(&self, error: E) -> Result<Option<T>, E> {
        if let Err(teardown_error) = self.inner.teardown().await {
            warn!(
                subscription_id = %self.inner.subscription_id,
                error = %teardown_error,
                "Teardown failed while throwing"
            );
        }
        Err(error)
    }

    /// Consume the adapter as a stream that ends when the iterator is done.
    ///
    /// A subscribe failure is yielded as the last item.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, PubSubError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let iterator = state?;
            match iterator.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(iterator))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T> IteratorInner<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// The shared subscribe, spawned on first use. `None` once closed.
    fn start_subscribe(self: &Arc<Self>) -> Option<SharedSubscribe> {
        let mut slot = self.subscribe.lock();
        // Checked under the slot lock: teardown clears `running` before it
        // reads the slot, so a subscribe is never started behind its back.
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(pending) = slot.as_ref() {
            return Some(pending.clone());
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let handler: Arc<dyn SubscriptionHandler> = Arc::clone(&inner) as _;
            let result = inner
                .engine
                .subscribe(&inner.subscription_id, handler, &inner.options)
                .await;
            if let Err(e) = &result {
                warn!(subscription_id = %inner.subscription_id, error = %e, "Subscribe failed");
            }
            result
        });
        let shared = task
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(PubSubError::SubscribeAborted(e.to_string())))
            })
            .boxed()
            .shared();
        *slot = Some(shared.clone());
        Some(shared)
    }
}

impl<T> IteratorInner<T> {
    /// Stop accepting values and wake every waiter with `None`.
    ///
    /// Returns `false` if the iterator was already closed.
    fn close_queue(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let waiting = self.queue.lock().close().unwrap_or_default();
        for consumer in waiting {
            let _ = consumer.send(None);
        }
        true
    }

    /// Returns whether this call performed the teardown.
    async fn teardown(&self) -> Result<bool, PubSubError> {
        if !self.close_queue() {
            return Ok(false);
        }
        let Some(subscribe) = self.subscribe.lock().clone() else {
            return Ok(true);
        };
        let Ok(handle) = subscribe.await else {
            return Ok(true);
        };
        release(&self.engine, handle, &self.subscription_id).await?;
        Ok(true)
    }
}

async fn release(
    engine: &PubSubEngine,
    handle: SubscriptionHandle,
    subscription_id: &str,
) -> Result<(), PubSubError> {
    match engine.unsubscribe(handle).await {
        Ok(()) => {
            debug!(subscription_id = %subscription_id, handle = %handle, "Iterator closed");
            Ok(())
        }
        Err(PubSubError::UnknownHandle(handle)) => {
            debug!(
                subscription_id = %subscription_id,
                handle = %handle,
                "Subscription already released"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<T> SubscriptionHandler for IteratorInner<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn on_message(&self, message: &ReceivedMessage) -> Result<(), PubSubError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let value: T = serde_json::from_slice(&message.data).map_err(|e| {
            PubSubError::Deserialization {
                message_id: message.message_id.clone(),
                reason: e.to_string(),
            }
        })?;
        if self.queue.lock().supply(Some(value)).is_err() {
            debug!(
                subscription_id = %self.subscription_id,
                message_id = %message.message_id,
                "Dropped message for closed iterator"
            );
        }
        Ok(())
    }

    async fn on_close(&self) {
        match self.teardown().await {
            Ok(true) => {
                debug!(subscription_id = %self.subscription_id, "Subscription closed under iterator");
            }
            Ok(false) => {}
            Err(e) => warn!(
                subscription_id = %self.subscription_id,
                error = %e,
                "Unsubscribe after stream close failed"
            ),
        }
    }
}

impl<T> Drop for PubSubAsyncIterator<T> {
    fn drop(&mut self) {
        let inner = &self.inner;
        if !inner.close_queue() {
            return;
        }
        let Some(subscribe) = inner.subscribe.lock().clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                subscription_id = %inner.subscription_id,
                "Iterator dropped outside a runtime, subscription left open"
            );
            return;
        };
        let engine = inner.engine.clone();
        let subscription_id = inner.subscription_id.clone();
        runtime.spawn(async move {
            let Ok(handle) = subscribe.await else {
                return;
            };
            if let Err(e) = release(&engine, handle, &subscription_id).await {
                warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Unsubscribe of dropped iterator failed"
                );
            }
        });
    }
}
