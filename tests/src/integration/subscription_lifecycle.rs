//! # Subscription Lifecycle
//!
//! Bus-side subscription bookkeeping across engines and iterators:
//!
//! 1. **Conflict**: a name left on the bus by another engine is not taken over silently
//! 2. **Replacement**: opting in deletes the stale subscription and starts a fresh one
//! 3. **Accounting**: racing `next()` calls subscribe once; repeated cancels release once

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use shared_pubsub::{
        BusError, BusEventReceiver, InMemoryMessageBus, MessageBus, OutgoingMessage,
        PubSubEngine, PubSubError, PublishOptions, SubscribeOptions, SubscriptionConfig,
        SubscriptionFilter, TopicConfig,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const TOPIC: &str = "projects/game/topics/chat-messages";
    const SUBSCRIPTION_ID: &str = "chat-messages%chatId~X";
    const SUBSCRIPTION: &str = "projects/game/subscriptions/chat-messages%chatId~X";

    /// Forwards to an in-memory bus while counting lifecycle calls.
    struct CountingBus {
        inner: InMemoryMessageBus,
        creates: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl CountingBus {
        fn new() -> Arc<Self> {
            let inner = InMemoryMessageBus::new();
            inner.create_topic(TOPIC);
            Arc::new(Self {
                inner,
                creates: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageBus for CountingBus {
        async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
            self.inner.subscription_exists(subscription).await
        }

        async fn create_subscription(
            &self,
            topic: &str,
            subscription: &str,
            config: SubscriptionConfig,
        ) -> Result<(), BusError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_subscription(topic, subscription, config).await
        }

        async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_subscription(subscription).await
        }

        async fn open(&self, subscription: &str) -> Result<BusEventReceiver, BusError> {
            self.inner.open(subscription).await
        }

        async fn close(&self, subscription: &str) -> Result<(), BusError> {
            self.inner.close(subscription).await
        }

        async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError> {
            self.inner.ack(subscription, ack_id).await
        }

        async fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError> {
            self.inner.nack(subscription, ack_id).await
        }

        async fn publish(
            &self,
            topic: &str,
            message: OutgoingMessage,
        ) -> Result<String, BusError> {
            self.inner.publish(topic, message).await
        }
    }

    fn engine_on(bus: Arc<dyn MessageBus>) -> PubSubEngine {
        PubSubEngine::new(bus, TopicConfig::new("game", "chat-messages")).expect("engine")
    }

    fn x_filter() -> SubscribeOptions {
        SubscribeOptions::default().with_filter(SubscriptionFilter::key_equals("chatId", "X"))
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition never held");
    }

    // =============================================================================
    // INTEGRATION TESTS: CONFLICT AND REPLACEMENT
    // =============================================================================

    /// A second engine (another server instance) meets the first one's subscription.
    #[tokio::test]
    async fn test_existing_subscription_conflicts_then_is_replaced() {
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.create_topic(TOPIC);
        let first = engine_on(bus.clone());
        let second = engine_on(bus.clone());

        let stale = Arc::new(first.async_iterator_with_options::<Value>(SUBSCRIPTION_ID, x_filter()));
        let stale_reader = tokio::spawn({
            let stale = Arc::clone(&stale);
            async move { stale.next().await }
        });
        wait_until(|| bus.is_streaming(SUBSCRIPTION)).await;

        let refused = second.async_iterator_with_options::<Value>(SUBSCRIPTION_ID, x_filter());
        let error = refused.next().await.unwrap_err();
        assert_eq!(
            error,
            PubSubError::SubscriptionExists {
                name: SUBSCRIPTION.to_string()
            }
        );
        assert_eq!(refused.next().await.unwrap(), None);

        let fresh = Arc::new(
            second.async_iterator_with_options::<Value>(SUBSCRIPTION_ID, x_filter().delete_existing(true)),
        );
        let fresh_reader = tokio::spawn({
            let fresh = Arc::clone(&fresh);
            async move { fresh.next().await }
        });

        // The replaced subscription's listener is told it is over.
        let ended = timeout(Duration::from_secs(1), stale_reader).await.unwrap().unwrap();
        assert_eq!(ended.unwrap(), None);
        assert!(!stale.is_running());

        wait_until(|| bus.is_streaming(SUBSCRIPTION)).await;
        second
            .publish(PublishOptions::new(json!({"chatId": "X", "message": "fresh"})))
            .await
            .unwrap();
        let got = timeout(Duration::from_secs(1), fresh_reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(json!({"chatId": "X", "message": "fresh"})));

        fresh.cancel().await.unwrap();
        assert!(bus.subscription_names().is_empty());
        assert_eq!(first.stats().live_subscriptions, 0);
        assert_eq!(second.stats().live_subscriptions, 0);
    }

    // =============================================================================
    // INTEGRATION TESTS: ACCOUNTING
    // =============================================================================

    /// Racing readers share one bus subscription; cancelling twice deletes it once.
    #[tokio::test]
    async fn test_subscribe_once_release_once() {
        let bus = CountingBus::new();
        let engine = engine_on(bus.clone());
        let iterator = Arc::new(engine.async_iterator::<Value>(SUBSCRIPTION_ID));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let iterator = Arc::clone(&iterator);
                tokio::spawn(async move { iterator.next().await })
            })
            .collect();
        wait_until(|| bus.inner.is_streaming(SUBSCRIPTION)).await;
        assert_eq!(bus.creates.load(Ordering::SeqCst), 1);

        iterator.cancel().await.unwrap();
        iterator.cancel().await.unwrap();
        let thrown: Result<Option<Value>, &str> = iterator.throw("late").await;
        assert_eq!(thrown, Err("late"));

        for reader in readers {
            let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
            assert_eq!(result.unwrap(), None);
        }
        assert_eq!(bus.deletes.load(Ordering::SeqCst), 1);

        // Published after teardown: nowhere to go, nothing observable.
        engine
            .publish(PublishOptions::new(json!({"chatId": "X"})))
            .await
            .unwrap();
        assert_eq!(iterator.next().await.unwrap(), None);
        assert_eq!(bus.inner.stats().messages_delivered, 0);
    }

    /// Transport failures on subscribe surface to the first reader only.
    #[tokio::test]
    async fn test_missing_topic_surfaces_as_transport_error() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let engine = engine_on(bus.clone());
        let iterator = engine.async_iterator::<Value>(SUBSCRIPTION_ID);

        let error = iterator.next().await.unwrap_err();
        assert!(error.is_transport());
        assert_eq!(iterator.next().await.unwrap(), None);
        assert!(bus.subscription_names().is_empty());
    }
}
