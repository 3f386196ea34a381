//! # Shared PubSub - Real-Time Bridge for GraphQL Subscriptions
//!
//! Lets many concurrent GraphQL subscription clients receive ordered,
//! filtered, per-client message streams derived from a single topic on a
//! cloud message bus.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  publish()   ┌──────────────┐   push    ┌──────────────────┐
//! │   Mutation   │ ───────────→ │  MessageBus  │ ────────→ │  PubSubEngine    │
//! │   resolver   │              │   (topic)    │           │  (per-sub task)  │
//! └──────────────┘              └──────────────┘           └────────┬─────────┘
//!                                                                   │ supply()
//!                                                                   ▼
//! ┌──────────────┐   next()     ┌──────────────────┐        ┌──────────────────┐
//! │   GraphQL    │ ───────────→ │ PubSubAsync-     │ ─────→ │  DeliveryQueue   │
//! │   executor   │ ←─────────── │ Iterator         │consume │                  │
//! └──────────────┘   value      └──────────────────┘        └──────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`filter`]: compiles the structured filter DSL into the bus filter language
//! - [`tracker`]: handle ↔ subscription registry whose handles are never reused
//! - [`queue`]: matches arriving messages with arriving read requests
//! - [`engine`]: owns one topic, creates/reuses/destroys bus subscriptions
//! - [`iterator`]: pull-based adapter the GraphQL executor drives
//! - [`bus`]: the message-bus port and an in-memory implementation

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod engine;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod queue;
pub mod tracker;

// Re-export main types
pub use bus::memory::{BusOperation, BusStats, InMemoryMessageBus};
pub use bus::{
    BusError, BusEvent, BusEventReceiver, MessageBus, OutgoingMessage, ReceivedMessage,
    SubscriptionConfig,
};
pub use engine::{
    EngineStats, PubSubEngine, PublishOptions, SubscribeOptions, SubscriptionHandler, TopicConfig,
};
pub use error::PubSubError;
pub use filter::{FilterError, KeyValue, SubscriptionFilter};
pub use iterator::PubSubAsyncIterator;
pub use queue::{DeliveryQueue, QueueError};
pub use tracker::{SubscriptionHandle, SubscriptionKey, SubscriptionTracker};

/// Default retention window for a bus-side subscription (24 hours).
pub const DEFAULT_MESSAGE_EXPIRATION_SECS: u64 = 24 * 60 * 60;

/// Default number of deliveries before a nacked message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_expiration() {
        assert_eq!(DEFAULT_MESSAGE_EXPIRATION_SECS, 86_400);
    }
}
