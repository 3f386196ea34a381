//! # Game Runtime
//!
//! Wires the real-time features of the game backend onto the pub/sub bridge.
//!
//! ## Startup Sequence
//!
//! 1. Load and validate configuration (`RuntimeConfig::from_env`)
//! 2. Install logging (`game_telemetry::init_telemetry`)
//! 3. Create the message bus and the topics features publish to
//! 4. Bind one engine per topic (chat)
//! 5. Serve until shutdown, then release every live subscription
//!
//! ```text
//!   mutation ──publish_chat_message──→ Engine(chat-messages) ──→ Bus topic
//!                                                                  │ filter chatId
//!   subscription ←── PubSubAsyncIterator ←── Engine ←── bus subscription
//! ```

pub mod chat;
pub mod config;

pub use chat::{
    chat_subscription_id, ChatAccess, ChatAccessError, ChatDirectory, ChatError, ChatMessage,
    ChatMessagesEvent, ChatService,
};
pub use config::{ChatConfig, ConfigError, PubSubConfig, RuntimeConfig};

use shared_pubsub::{EngineStats, InMemoryMessageBus, MessageBus, PubSubError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

/// The running real-time layer.
pub struct GameRuntime {
    config: RuntimeConfig,
    bus: Arc<InMemoryMessageBus>,
    chat: ChatService,
}

impl GameRuntime {
    /// Create the bus, its topics and every feature service.
    pub fn new(config: RuntimeConfig, access: Arc<dyn ChatAccess>) -> Result<Self, RuntimeError> {
        config.validate()?;
        info!(project_id = %config.pubsub.project_id, "Creating game runtime");

        let bus = Arc::new(InMemoryMessageBus::with_max_delivery_attempts(
            config.pubsub.max_delivery_attempts,
        ));
        let chat_topic = format!(
            "projects/{}/topics/{}",
            config.pubsub.project_id, config.chat.topic_id
        );
        bus.create_topic(chat_topic);

        let shared_bus: Arc<dyn MessageBus> = bus.clone();
        let chat = ChatService::new(shared_bus, &config.pubsub, &config.chat, access)?;
        info!(topic = %chat.engine().topic_name(), "Chat feature ready");

        Ok(Self { config, bus, chat })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<InMemoryMessageBus> {
        &self.bus
    }

    #[must_use]
    pub fn chat_stats(&self) -> EngineStats {
        self.chat.engine().stats()
    }

    /// Log final counters. Subscriptions still held by listeners are
    /// released when their iterators are dropped.
    pub fn shutdown(self) {
        let chat = self.chat_stats();
        let bus = self.bus.stats();
        info!(
            chat_published = chat.messages_published,
            chat_delivered = chat.messages_delivered,
            chat_live_subscriptions = chat.live_subscriptions,
            bus_dead_lettered = bus.messages_dead_lettered,
            "Game runtime stopped"
        );
    }
}
