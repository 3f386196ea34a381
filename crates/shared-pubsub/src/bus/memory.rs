//! # In-Memory Message Bus
//!
//! Single-process implementation of [`MessageBus`] with the delivery
//! semantics the bridge relies on: per-subscription attribute filters,
//! backlog retention while no stream is open, redelivery on nack and
//! dead-lettering after too many attempts.

use super::filter_expr::AttributeFilter;
use super::{
    BusError, BusEvent, BusEventReceiver, MessageBus, OutgoingMessage, ReceivedMessage,
    SubscriptionConfig,
};
use crate::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bus calls that can be made to fail with [`InMemoryMessageBus::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusOperation {
    SubscriptionExists,
    CreateSubscription,
    DeleteSubscription,
    Open,
    Close,
    Ack,
    Nack,
    Publish,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub subscriptions_created: u64,
    pub subscriptions_deleted: u64,
    pub streams_opened: u64,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub messages_dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    subscriptions_created: AtomicU64,
    subscriptions_deleted: AtomicU64,
    streams_opened: AtomicU64,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_acked: AtomicU64,
    messages_nacked: AtomicU64,
    messages_dead_lettered: AtomicU64,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    message_id: String,
    data: Vec<u8>,
    attributes: BTreeMap<String, String>,
    ordering_key: Option<String>,
    /// Deliveries made so far.
    attempts: u32,
}

impl PendingMessage {
    fn into_received(self, ack_id: String) -> ReceivedMessage {
        ReceivedMessage {
            ack_id,
            message_id: self.message_id,
            data: self.data,
            attributes: self.attributes,
            ordering_key: self.ordering_key,
            delivery_attempt: self.attempts,
        }
    }
}

struct SubscriptionState {
    topic: String,
    config: SubscriptionConfig,
    filter: Option<AttributeFilter>,
    backlog: VecDeque<PendingMessage>,
    /// Delivered but not yet acked, in delivery order.
    outstanding: VecDeque<(String, PendingMessage)>,
    stream: Option<mpsc::UnboundedSender<BusEvent>>,
}

#[derive(Default)]
struct BusState {
    /// Topic name → subscription names.
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    dead_letters: Vec<ReceivedMessage>,
    failures: HashMap<BusOperation, VecDeque<BusError>>,
}

/// In-memory message bus.
pub struct InMemoryMessageBus {
    state: Mutex<BusState>,
    counters: Counters,
    next_message_id: AtomicU64,
    max_delivery_attempts: u32,
}

impl InMemoryMessageBus {
    /// Create an empty bus with the default delivery-attempt limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_delivery_attempts(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }

    /// Create an empty bus that dead-letters after `max_delivery_attempts`.
    #[must_use]
    pub fn with_max_delivery_attempts(max_delivery_attempts: u32) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            counters: Counters::default(),
            next_message_id: AtomicU64::new(1),
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    /// Create `topic`. Creating an existing topic is a no-op.
    pub fn create_topic(&self, topic: impl Into<String>) {
        let topic = topic.into();
        debug!(topic = %topic, "Topic created");
        self.state.lock().topics.entry(topic).or_default();
    }

    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: BusOperation, error: BusError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Push a transport error into the open stream of `subscription`.
    ///
    /// # Errors
    ///
    /// `BusError::NotFound` if no stream is open for `subscription`.
    pub fn inject_stream_error(&self, subscription: &str, error: BusError) -> Result<(), BusError> {
        let state = self.state.lock();
        let stream = state
            .subscriptions
            .get(subscription)
            .and_then(|sub| sub.stream.as_ref())
            .ok_or_else(|| BusError::NotFound(format!("open stream for {subscription}")))?;
        stream
            .send(BusEvent::Error(error))
            .map_err(|_| BusError::Unavailable(format!("stream for {subscription} is gone")))
    }

    /// Names of all existing subscriptions, sorted.
    #[must_use]
    pub fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().subscriptions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Creation-time settings of `subscription`.
    #[must_use]
    pub fn subscription_config(&self, subscription: &str) -> Option<SubscriptionConfig> {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(|sub| sub.config.clone())
    }

    /// Whether a stream is currently open for `subscription`.
    #[must_use]
    pub fn is_streaming(&self, subscription: &str) -> bool {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .is_some_and(|sub| sub.stream.is_some())
    }

    /// Messages waiting for an open stream on `subscription`.
    #[must_use]
    pub fn backlog_len(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |sub| sub.backlog.len())
    }

    /// Messages given up on after too many delivery attempts.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<ReceivedMessage> {
        self.state.lock().dead_letters.clone()
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        let c = &self.counters;
        BusStats {
            subscriptions_created: c.subscriptions_created.load(Ordering::Relaxed),
            subscriptions_deleted: c.subscriptions_deleted.load(Ordering::Relaxed),
            streams_opened: c.streams_opened.load(Ordering::Relaxed),
            messages_published: c.messages_published.load(Ordering::Relaxed),
            messages_delivered: c.messages_delivered.load(Ordering::Relaxed),
            messages_acked: c.messages_acked.load(Ordering::Relaxed),
            messages_nacked: c.messages_nacked.load(Ordering::Relaxed),
            messages_dead_lettered: c.messages_dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn take_failure(state: &mut BusState, operation: BusOperation) -> Result<(), BusError> {
        match state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => {
                debug!(operation = ?operation, error = %error, "Injected bus failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Push as much of the backlog as possible into the open stream.
    fn drain_backlog(&self, name: &str, sub: &mut SubscriptionState) {
        let Some(stream) = sub.stream.clone() else {
            return;
        };
        while let Some(mut pending) = sub.backlog.pop_front() {
            pending.attempts += 1;
            let ack_id = Uuid::new_v4().to_string();
            let event = BusEvent::Message(pending.clone().into_received(ack_id.clone()));
            if stream.send(event).is_err() {
                // Receiver dropped without close: treat as closed.
                pending.attempts -= 1;
                sub.backlog.push_front(pending);
                sub.stream = None;
                debug!(subscription = %name, "Stream receiver dropped, delivery paused");
                return;
            }
            self.counters
                .messages_delivered
                .fetch_add(1, Ordering::Relaxed);
            sub.outstanding.push_back((ack_id, pending));
        }
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::SubscriptionExists)?;
        Ok(state.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        config: SubscriptionConfig,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::CreateSubscription)?;

        if !state.topics.contains_key(topic) {
            return Err(BusError::NotFound(format!("topic {topic}")));
        }
        if state.subscriptions.contains_key(subscription) {
            return Err(BusError::AlreadyExists(format!(
                "subscription {subscription}"
            )));
        }
        let filter = config
            .filter
            .as_deref()
            .map(AttributeFilter::parse)
            .transpose()?;

        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                config,
                filter,
                backlog: VecDeque::new(),
                outstanding: VecDeque::new(),
                stream: None,
            },
        );
        if let Some(names) = state.topics.get_mut(topic) {
            names.push(subscription.to_string());
        }
        self.counters
            .subscriptions_created
            .fetch_add(1, Ordering::Relaxed);
        debug!(topic = %topic, subscription = %subscription, "Subscription created");
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::DeleteSubscription)?;

        let removed = state
            .subscriptions
            .remove(subscription)
            .ok_or_else(|| BusError::NotFound(format!("subscription {subscription}")))?;
        if let Some(names) = state.topics.get_mut(&removed.topic) {
            names.retain(|name| name != subscription);
        }
        if let Some(stream) = removed.stream {
            let _ = stream.send(BusEvent::Closed);
        }
        self.counters
            .subscriptions_deleted
            .fetch_add(1, Ordering::Relaxed);
        debug!(subscription = %subscription, "Subscription deleted");
        Ok(())
    }

    async fn open(&self, subscription: &str) -> Result<BusEventReceiver, BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::Open)?;

        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BusError::NotFound(format!("subscription {subscription}")))?;
        if sub.stream.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(BusError::AlreadyExists(format!(
                "open stream for {subscription}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        sub.stream = Some(tx);
        self.counters.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.drain_backlog(subscription, sub);
        debug!(subscription = %subscription, "Stream opened");
        Ok(rx)
    }

    async fn close(&self, subscription: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::Close)?;

        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Ok(());
        };
        if let Some(stream) = sub.stream.take() {
            let _ = stream.send(BusEvent::Closed);
            debug!(subscription = %subscription, "Stream closed");
        }
        // Unacked deliveries go back to the front, oldest first.
        while let Some((_, pending)) = sub.outstanding.pop_back() {
            sub.backlog.push_front(pending);
        }
        Ok(())
    }

    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, BusOperation::Ack)?;

        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BusError::NotFound(format!("subscription {subscription}")))?;
        // Unknown ack ids are ignored, like expired ones on a real bus.
        if let Some(pos) = sub.outstanding.iter().position(|(id, _)| id == ack_id) {
            sub.outstanding.remove(pos);
            self.counters.messages_acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::take_failure(state, BusOperation::Nack)?;

        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BusError::NotFound(format!("subscription {subscription}")))?;
        let Some(pos) = sub.outstanding.iter().position(|(id, _)| id == ack_id) else {
            return Ok(());
        };
        let Some((_, pending)) = sub.outstanding.remove(pos) else {
            return Ok(());
        };
        self.counters.messages_nacked.fetch_add(1, Ordering::Relaxed);

        if pending.attempts >= self.max_delivery_attempts {
            warn!(
                subscription = %subscription,
                message_id = %pending.message_id,
                attempts = pending.attempts,
                "Message dead-lettered"
            );
            let ack_id = ack_id.to_string();
            state.dead_letters.push(pending.into_received(ack_id));
            self.counters
                .messages_dead_lettered
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        sub.backlog.push_front(pending);
        self.drain_backlog(subscription, sub);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::take_failure(state, BusOperation::Publish)?;

        if message.data.is_empty() && message.attributes.is_empty() {
            return Err(BusError::InvalidArgument(
                "a message needs data or attributes".to_string(),
            ));
        }
        let names = state
            .topics
            .get(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {topic}")))?;

        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let pending = PendingMessage {
            message_id: message_id.clone(),
            data: message.data,
            attributes: message.attributes,
            ordering_key: message.ordering_key,
            attempts: 0,
        };

        let mut receivers = 0usize;
        for name in names {
            let Some(sub) = state.subscriptions.get_mut(name) else {
                continue;
            };
            let accepted = sub
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(&pending.attributes));
            if !accepted {
                continue;
            }
            sub.backlog.push_back(pending.clone());
            self.drain_backlog(name, sub);
            receivers += 1;
        }

        self.counters
            .messages_published
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            topic = %topic,
            message_id = %message_id,
            receivers = receivers,
            "Message published"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "projects/p/topics/t";
    const SUB: &str = "projects/p/subscriptions/s";

    fn config(filter: Option<&str>) -> SubscriptionConfig {
        SubscriptionConfig {
            labels: BTreeMap::new(),
            enable_message_ordering: false,
            expiration_ttl: Duration::from_secs(86_400),
            filter: filter.map(str::to_string),
        }
    }

    fn message(pairs: &[(&str, &str)]) -> OutgoingMessage {
        OutgoingMessage {
            data: b"{}".to_vec(),
            attributes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ordering_key: None,
        }
    }

    fn expect_message(event: Option<BusEvent>) -> ReceivedMessage {
        match event {
            Some(BusEvent::Message(msg)) => msg,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_requires_topic() {
        let bus = InMemoryMessageBus::new();
        let result = bus.create_subscription(TOPIC, SUB, config(None)).await;
        assert!(matches!(result, Err(BusError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();

        assert!(bus.subscription_exists(SUB).await.unwrap());
        let result = bus.create_subscription(TOPIC, SUB, config(None)).await;
        assert!(matches!(result, Err(BusError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected_at_creation() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        let result = bus
            .create_subscription(TOPIC, SUB, config(Some("attributes")))
            .await;
        assert!(matches!(result, Err(BusError::InvalidArgument(_))));
        assert!(!bus.subscription_exists(SUB).await.unwrap());
    }

    #[tokio::test]
    async fn test_backlog_flushed_on_open() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();

        bus.publish(TOPIC, message(&[("n", "1")])).await.unwrap();
        bus.publish(TOPIC, message(&[("n", "2")])).await.unwrap();
        assert_eq!(bus.backlog_len(SUB), 2);

        let mut rx = bus.open(SUB).await.unwrap();
        assert_eq!(expect_message(rx.recv().await).attributes["n"], "1");
        assert_eq!(expect_message(rx.recv().await).attributes["n"], "2");
        assert_eq!(bus.backlog_len(SUB), 0);
    }

    #[tokio::test]
    async fn test_filter_applied_on_publish() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(Some(r#"attributes."chatId" = "X""#)))
            .await
            .unwrap();
        let mut rx = bus.open(SUB).await.unwrap();

        bus.publish(TOPIC, message(&[("chatId", "Y")])).await.unwrap();
        bus.publish(TOPIC, message(&[("chatId", "X")])).await.unwrap();

        let delivered = expect_message(rx.recv().await);
        assert_eq!(delivered.attributes["chatId"], "X");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let bus = InMemoryMessageBus::with_max_delivery_attempts(2);
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();
        let mut rx = bus.open(SUB).await.unwrap();
        bus.publish(TOPIC, message(&[("n", "1")])).await.unwrap();

        let first = expect_message(rx.recv().await);
        assert_eq!(first.delivery_attempt, 1);
        bus.nack(SUB, &first.ack_id).await.unwrap();

        let second = expect_message(rx.recv().await);
        assert_eq!(second.delivery_attempt, 2);
        assert_eq!(second.message_id, first.message_id);
        bus.nack(SUB, &second.ack_id).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(bus.dead_letters().len(), 1);
        assert_eq!(bus.stats().messages_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();
        let mut rx = bus.open(SUB).await.unwrap();
        bus.publish(TOPIC, message(&[("n", "1")])).await.unwrap();
        let delivered = expect_message(rx.recv().await);

        bus.close(SUB).await.unwrap();
        assert!(matches!(rx.recv().await, Some(BusEvent::Closed)));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.backlog_len(SUB), 1);

        // Late acks for a closed stream are ignored.
        bus.ack(SUB, &delivered.ack_id).await.unwrap();
        assert_eq!(bus.stats().messages_acked, 0);
    }

    #[tokio::test]
    async fn test_delete_closes_stream() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();
        let mut rx = bus.open(SUB).await.unwrap();

        bus.delete_subscription(SUB).await.unwrap();
        assert!(matches!(rx.recv().await, Some(BusEvent::Closed)));
        assert!(!bus.subscription_exists(SUB).await.unwrap());
        assert!(matches!(
            bus.delete_subscription(SUB).await,
            Err(BusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.fail_next(
            BusOperation::Publish,
            BusError::PermissionDenied("topic".into()),
        );

        let first = bus.publish(TOPIC, message(&[("n", "1")])).await;
        assert!(matches!(first, Err(BusError::PermissionDenied(_))));
        assert!(bus.publish(TOPIC, message(&[("n", "1")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_inject_stream_error() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic(TOPIC);
        bus.create_subscription(TOPIC, SUB, config(None)).await.unwrap();
        assert!(bus
            .inject_stream_error(SUB, BusError::Unavailable("x".into()))
            .is_err());

        let mut rx = bus.open(SUB).await.unwrap();
        bus.inject_stream_error(SUB, BusError::Unavailable("x".into()))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(BusEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic() {
        let bus = InMemoryMessageBus::new();
        let result = bus.publish(TOPIC, message(&[("n", "1")])).await;
        assert!(matches!(result, Err(BusError::NotFound(_))));
    }
}
