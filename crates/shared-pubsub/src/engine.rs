//! # Pub/Sub Engine
//!
//! Owns one topic on the message bus. Creates, reuses and destroys the
//! bus-side subscriptions that feed GraphQL subscribers, and publishes
//! mutation payloads to the topic.
//!
//! Use a separate engine per topic.
//!
//! ## Naming
//!
//! - `subscription_id`: short form chosen by the caller, e.g. `chat-messages%chatId~X`
//! - subscription name: `projects/{project}/subscriptions/{subscription_id}`
//! - topic name: `projects/{project}/topics/{topic_id}`
//! - handle: in-process alias minted by this engine instance only

use crate::bus::{BusError, BusEvent, BusEventReceiver, MessageBus, OutgoingMessage, ReceivedMessage, SubscriptionConfig};
use crate::error::PubSubError;
use crate::filter::SubscriptionFilter;
use crate::iterator::PubSubAsyncIterator;
use crate::tracker::{SubscriptionHandle, SubscriptionTracker};
use crate::DEFAULT_MESSAGE_EXPIRATION_SECS;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// The topic an engine is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub project_id: String,
    /// Short topic id, not the full `projects/{p}/topics/{t}` name.
    pub topic_id: String,
    /// GraphQL subscription field; when set, published data is `{field: payload}`.
    pub graphql_field: Option<String>,
    /// Ordering key attached to every published message.
    pub ordering_key: Option<String>,
}

impl TopicConfig {
    #[must_use]
    pub fn new(project_id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            topic_id: topic_id.into(),
            graphql_field: None,
            ordering_key: None,
        }
    }

    #[must_use]
    pub fn with_graphql_field(mut self, field: impl Into<String>) -> Self {
        self.graphql_field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn topic_name(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.topic_id)
    }

    #[must_use]
    pub fn subscription_name(&self, subscription_id: &str) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id, subscription_id
        )
    }
}

/// Options applied when a bus-side subscription has to be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub labels: BTreeMap<String, String>,
    pub filter: Option<SubscriptionFilter>,
    /// Defaults to 24 hours.
    pub message_expiration_seconds: Option<u64>,
    /// Delete and recreate a subscription that already exists on the bus.
    /// Any other consumer of the old subscription loses its stream.
    pub delete_existing_subscription: bool,
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_message_expiration_seconds(mut self, seconds: u64) -> Self {
        self.message_expiration_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn delete_existing(mut self, delete: bool) -> Self {
        self.delete_existing_subscription = delete;
        self
    }

    fn expiration_ttl(&self) -> Duration {
        Duration::from_secs(
            self.message_expiration_seconds
                .unwrap_or(DEFAULT_MESSAGE_EXPIRATION_SECS),
        )
    }
}

/// A payload to publish, optionally with explicit attributes.
#[derive(Debug, Clone)]
pub struct PublishOptions<P> {
    pub payload: P,
    /// When `None`, attributes are derived from the payload's fields.
    pub attributes: Option<BTreeMap<String, String>>,
}

impl<P> PublishOptions<P> {
    #[must_use]
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            attributes: None,
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// Receives what the bus pushes on a subscription.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    /// Handle one delivery. `Ok` acknowledges it, `Err` asks for redelivery.
    async fn on_message(&self, message: &ReceivedMessage) -> Result<(), PubSubError>;

    /// The subscription stream ended; nothing follows.
    async fn on_close(&self);
}

type HandlerList = Arc<Mutex<Vec<Arc<dyn SubscriptionHandler>>>>;

struct TrackedSubscription {
    /// Shared with the listener task so handlers can still be told about
    /// the close after the handle is released.
    handlers: HandlerList,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_nacked: u64,
    pub live_subscriptions: usize,
}

struct EngineShared {
    bus: Arc<dyn MessageBus>,
    config: TopicConfig,
    topic_name: String,
    subscriptions: Mutex<SubscriptionTracker<TrackedSubscription>>,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_nacked: AtomicU64,
}

/// Publish/subscribe engine bound to one topic.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct PubSubEngine {
    shared: Arc<EngineShared>,
}

impl PubSubEngine {
    /// Bind an engine to the topic described by `config`.
    ///
    /// # Errors
    ///
    /// `PubSubError::InvalidConfig` if the project or topic id is empty.
    pub fn new(bus: Arc<dyn MessageBus>, config: TopicConfig) -> Result<Self, PubSubError> {
        if config.project_id.trim().is_empty() {
            return Err(PubSubError::InvalidConfig(
                "project id must not be empty".to_string(),
            ));
        }
        if config.topic_id.trim().is_empty() {
            return Err(PubSubError::InvalidConfig(
                "topic id must not be empty".to_string(),
            ));
        }
        let topic_name = config.topic_name();
        Ok(Self {
            shared: Arc::new(EngineShared {
                bus,
                config,
                topic_name,
                subscriptions: Mutex::new(SubscriptionTracker::new()),
                messages_published: AtomicU64::new(0),
                messages_delivered: AtomicU64::new(0),
                messages_nacked: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TopicConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.shared.topic_name
    }

    /// Start (or join) the subscription `subscription_id`.
    ///
    /// A subscription already live on this engine is reused and `handler`
    /// joins it. Otherwise the bus is asked for one: a new subscription is
    /// created, or, if one exists and `options.delete_existing_subscription`
    /// is set, the old one is deleted first.
    ///
    /// # Errors
    ///
    /// - `InvalidSubscriptionId` / `InvalidFilter` before any bus call
    /// - `SubscriptionExists` if the bus already has the name and replacement
    ///   was not authorized
    /// - `Transport` for bus failures
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        handler: Arc<dyn SubscriptionHandler>,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle, PubSubError> {
        validate_subscription_id(subscription_id)?;
        let filter = options
            .filter
            .as_ref()
            .map(SubscriptionFilter::compile)
            .transpose()?;
        let name = self.shared.config.subscription_name(subscription_id);

        {
            let subscriptions = self.shared.subscriptions.lock();
            if let Some(handle) = subscriptions.get_handle(&name) {
                if let Some(tracked) = subscriptions.get(handle) {
                    tracked.handlers.lock().push(handler);
                    debug!(subscription = %name, handle = %handle, "Joined live subscription");
                    return Ok(handle);
                }
            }
        }

        let bus = &self.shared.bus;
        if bus.subscription_exists(&name).await? {
            if !options.delete_existing_subscription {
                return Err(PubSubError::SubscriptionExists { name });
            }
            warn!(subscription = %name, "Replacing existing subscription");
            bus.close(&name).await?;
            bus.delete_subscription(&name).await?;
        }

        let config = SubscriptionConfig {
            labels: options.labels.clone(),
            enable_message_ordering: self.shared.config.ordering_key.is_some(),
            expiration_ttl: options.expiration_ttl(),
            filter,
        };
        bus.create_subscription(&self.shared.topic_name, &name, config)
            .await?;

        let events = match bus.open(&name).await {
            Ok(events) => events,
            Err(open_error) => {
                if let Err(cleanup_error) = bus.delete_subscription(&name).await {
                    warn!(
                        subscription = %name,
                        error = %cleanup_error,
                        "Failed to delete subscription after open failure"
                    );
                }
                return Err(open_error.into());
            }
        };

        let handlers: HandlerList = Arc::new(Mutex::new(vec![handler]));
        let handle = self.shared.subscriptions.lock().add(
            name.clone(),
            TrackedSubscription {
                handlers: Arc::clone(&handlers),
            },
        );
        debug!(subscription = %name, handle = %handle, "Subscription started");

        tokio::spawn(listen(
            Arc::clone(&self.shared),
            handle,
            name,
            handlers,
            events,
        ));
        Ok(handle)
    }

    /// Close and delete the subscription behind `handle`, releasing the handle.
    ///
    /// # Errors
    ///
    /// - `UnknownHandle` if `handle` is not live on this engine
    /// - `Transport` if closing or deleting fails (the handle is released regardless)
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), PubSubError> {
        self.shared.end_subscription(handle).await
    }

    /// Publish a payload to the bound topic.
    ///
    /// Attributes default to the payload's top-level fields, strings verbatim
    /// and everything else as compact JSON. Returns once the bus accepted the
    /// message, with the bus-assigned message id.
    ///
    /// # Errors
    ///
    /// - `Serialization` if the payload cannot be encoded
    /// - `Transport` for bus failures
    pub async fn publish<P: Serialize>(
        &self,
        options: PublishOptions<P>,
    ) -> Result<String, PubSubError> {
        let payload = serde_json::to_value(&options.payload)
            .map_err(|e| PubSubError::Serialization(e.to_string()))?;
        let attributes = options
            .attributes
            .unwrap_or_else(|| derive_attributes(&payload));

        let body = match &self.shared.config.graphql_field {
            Some(field) => {
                let mut envelope = serde_json::Map::new();
                envelope.insert(field.clone(), payload);
                Value::Object(envelope)
            }
            None => payload,
        };
        let data =
            serde_json::to_vec(&body).map_err(|e| PubSubError::Serialization(e.to_string()))?;

        let message = OutgoingMessage {
            data,
            attributes,
            ordering_key: self.shared.config.ordering_key.clone(),
        };
        let message_id = self
            .shared
            .bus
            .publish(&self.shared.topic_name, message)
            .await?;

        self.shared
            .messages_published
            .fetch_add(1, Ordering::Relaxed);
        debug!(topic = %self.shared.topic_name, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    /// Adapter for `subscription_id` with default options.
    #[must_use]
    pub fn async_iterator<T>(&self, subscription_id: impl Into<String>) -> PubSubAsyncIterator<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.async_iterator_with_options(subscription_id, SubscribeOptions::default())
    }

    /// Adapter for `subscription_id` with labels, filter and replacement options.
    #[must_use]
    pub fn async_iterator_with_options<T>(
        &self,
        subscription_id: impl Into<String>,
        options: SubscribeOptions,
    ) -> PubSubAsyncIterator<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        PubSubAsyncIterator::new(self.clone(), subscription_id.into(), options)
    }

    /// Whether `handle` still refers to a live subscription.
    #[must_use]
    pub fn is_live(&self, handle: SubscriptionHandle) -> bool {
        self.shared.subscriptions.lock().get(handle).is_some()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        EngineStats {
            messages_published: shared.messages_published.load(Ordering::Relaxed),
            messages_delivered: shared.messages_delivered.load(Ordering::Relaxed),
            messages_nacked: shared.messages_nacked.load(Ordering::Relaxed),
            live_subscriptions: shared.subscriptions.lock().live_count(),
        }
    }
}

impl EngineShared {
    async fn end_subscription(&self, handle: SubscriptionHandle) -> Result<(), PubSubError> {
        let name = {
            let mut subscriptions = self.subscriptions.lock();
            let name = subscriptions
                .name_of(handle)
                .map(str::to_string)
                .ok_or(PubSubError::UnknownHandle(handle))?;
            subscriptions.release(handle);
            name
        };

        self.bus.close(&name).await?;
        match self.bus.delete_subscription(&name).await {
            Ok(()) => {}
            Err(BusError::NotFound(_)) => {
                debug!(subscription = %name, "Subscription already gone from the bus");
            }
            Err(e) => return Err(e.into()),
        }
        debug!(subscription = %name, handle = %handle, "Subscription ended");
        Ok(())
    }

    async fn dispatch(&self, name: &str, handlers: &HandlerList, message: ReceivedMessage) {
        let snapshot: Vec<Arc<dyn SubscriptionHandler>> = handlers.lock().clone();

        let mut accepted = true;
        for handler in snapshot {
            if let Err(e) = handler.on_message(&message).await {
                warn!(
                    subscription = %name,
                    message_id = %message.message_id,
                    delivery_attempt = message.delivery_attempt,
                    error = %e,
                    "Message rejected, requesting redelivery"
                );
                accepted = false;
            }
        }

        let outcome = if accepted {
            self.messages_delivered.fetch_add(1, Ordering::Relaxed);
            self.bus.ack(name, &message.ack_id).await
        } else {
            self.messages_nacked.fetch_add(1, Ordering::Relaxed);
            self.bus.nack(name, &message.ack_id).await
        };
        if let Err(e) = outcome {
            warn!(
                subscription = %name,
                message_id = %message.message_id,
                error = %e,
                "Failed to settle message"
            );
        }
    }
}

/// Drive one subscription stream until it closes or fails.
async fn listen(
    shared: Arc<EngineShared>,
    handle: SubscriptionHandle,
    name: String,
    handlers: HandlerList,
    mut events: BusEventReceiver,
) {
    while let Some(event) = events.recv().await {
        match event {
            BusEvent::Message(message) => shared.dispatch(&name, &handlers, message).await,
            BusEvent::Error(bus_error) => {
                error!(
                    subscription = %name,
                    handle = %handle,
                    error = %bus_error,
                    "Subscription stream failed, ending subscription"
                );
                match shared.end_subscription(handle).await {
                    Ok(()) | Err(PubSubError::UnknownHandle(_)) => {}
                    Err(e) => warn!(subscription = %name, error = %e, "Teardown after stream failure failed"),
                }
                break;
            }
            BusEvent::Closed => break,
        }
    }

    // The bus side is gone or belongs to someone else now; forget the
    // handle without touching the bus.
    shared.subscriptions.lock().release(handle);

    let snapshot: Vec<Arc<dyn SubscriptionHandler>> = handlers.lock().drain(..).collect();
    debug!(subscription = %name, handlers = snapshot.len(), "Subscription stream ended");
    for handler in snapshot {
        handler.on_close().await;
    }
}

/// Attributes for a payload: its top-level fields stringified.
fn derive_attributes(payload: &Value) -> BTreeMap<String, String> {
    let Value::Object(fields) = payload else {
        return BTreeMap::new();
    };
    fields
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

/// Check a caller-supplied id against the bus naming rules.
///
/// Starts with a letter; letters, digits, `-_.~+%` only; 3..=255 characters;
/// no `goog` prefix.
fn validate_subscription_id(id: &str) -> Result<(), PubSubError> {
    let reject = |reason| {
        Err(PubSubError::InvalidSubscriptionId {
            id: id.to_string(),
            reason,
        })
    };
    if !(3..=255).contains(&id.len()) {
        return reject("must be between 3 and 255 characters long");
    }
    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return reject("must start with a letter");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+' | '%'))
    {
        return reject("may only contain letters, digits and -_.~+%");
    }
    if id.starts_with("goog") {
        return reject("must not start with \"goog\"");
    }
    Ok(())
}
