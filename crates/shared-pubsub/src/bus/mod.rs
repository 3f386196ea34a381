//! # Message Bus Port
//!
//! The cloud message bus as seen by the engine. Production deployments
//! plug a cloud client in behind [`MessageBus`]; [`memory::InMemoryMessageBus`]
//! is the single-process implementation used by the runtime and tests.

pub mod filter_expr;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the bus transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Settings for a bus-side subscription at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub labels: BTreeMap<String, String>,
    /// Deliver messages sharing an ordering key in publish order.
    pub enable_message_ordering: bool,
    /// Idle time after which the bus may expire the subscription.
    pub expiration_ttl: Duration,
    /// Attribute filter in the bus filter language.
    pub filter: Option<String>,
}

/// A message on its way to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: Option<String>,
}

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Token for `ack`/`nack`, unique per delivery.
    pub ack_id: String,
    /// Bus-assigned id, stable across redeliveries.
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: Option<String>,
    /// 1 on first delivery.
    pub delivery_attempt: u32,
}

/// Events pushed on an open subscription stream.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Message(ReceivedMessage),
    Error(BusError),
    /// The stream was closed; no further events follow.
    Closed,
}

/// Receiving end of an open subscription stream.
pub type BusEventReceiver = mpsc::UnboundedReceiver<BusEvent>;

/// Operations the engine needs from the message bus.
///
/// Names are fully qualified (`projects/{p}/topics/{t}`,
/// `projects/{p}/subscriptions/{s}`).
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscription_exists(&self, subscription: &str) -> Result<bool, BusError>;

    /// Create a subscription on `topic`.
    ///
    /// Fails with `AlreadyExists` if the name is taken and `NotFound` if the
    /// topic does not exist.
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        config: SubscriptionConfig,
    ) -> Result<(), BusError>;

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError>;

    /// Start streaming delivery for `subscription`.
    async fn open(&self, subscription: &str) -> Result<BusEventReceiver, BusError>;

    /// Stop streaming delivery. Closing a stream that is not open is a no-op.
    async fn close(&self, subscription: &str) -> Result<(), BusError>;

    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError>;

    /// Negatively acknowledge, asking the bus to redeliver.
    async fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BusError>;

    /// Publish to `topic`, returning the bus-assigned message id.
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError>;
}
