//! # Chat Messages
//!
//! Real-time chat between players of an active game.
//!
//! - Sending publishes a [`ChatMessage`] to the chat topic; attributes are
//!   derived from its fields, so `chatId` is filterable.
//! - Listening opens one bus subscription per (chat, player), filtered on
//!   `chatId`. A reconnecting player replaces their stale subscription.
//!
//! Who may send or listen is decided by a [`ChatAccess`] implementation.

use crate::config::{ChatConfig, PubSubConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_pubsub::{
    MessageBus, PubSubAsyncIterator, PubSubEngine, PubSubError, PublishOptions, SubscribeOptions,
    SubscriptionFilter, TopicConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// GraphQL subscription field chat messages are published under.
pub const CHAT_GRAPHQL_FIELD: &str = "chatMessages";

/// Ordering key shared by every chat message.
pub const CHAT_ORDERING_KEY: &str = "chat-messages";

/// A message sent to a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub chat_id: String,
    pub from_player_id: String,
    /// Milliseconds since the Unix epoch.
    pub sent_time: f64,
    pub message: String,
}

/// What a chat listener receives: the message under its GraphQL field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagesEvent {
    #[serde(rename = "chatMessages")]
    pub chat_messages: ChatMessage,
}

/// Bus subscription id for `player_id` listening to `chat_id`.
#[must_use]
pub fn chat_subscription_id(chat_id: &str, player_id: &str) -> String {
    format!("chat-messages%chatId~{chat_id}%toPlayer~{player_id}")
}

/// Authorization failures reported by [`ChatAccess`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatAccessError {
    #[error("There is no chat with id {0}")]
    NoSuchChat(String),

    #[error("The game for chat {0} is not active")]
    GameNotActive(String),

    #[error("You must be a player in chat {0} to use it")]
    NotAMember(String),
}

/// Chat errors.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Messages must be between 1 and {max} characters long (inclusive), got {len}")]
    InvalidMessageLength { len: usize, max: usize },

    #[error(transparent)]
    Access(#[from] ChatAccessError),

    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

/// Membership checks for chats.
///
/// Both methods resolve the account to the player it acts as in the chat.
#[async_trait]
pub trait ChatAccess: Send + Sync {
    /// Player id `account_id` listens as, if it may listen to `chat_id`.
    async fn listener_player(&self, chat_id: &str, account_id: &str)
        -> Result<String, ChatAccessError>;

    /// Player id `account_id` sends as, if it may send to `chat_id`.
    async fn sender_player(&self, chat_id: &str, account_id: &str)
        -> Result<String, ChatAccessError>;
}

#[derive(Debug, Default)]
struct ChatRecord {
    game_active: bool,
    /// account id -> player id
    members: HashMap<String, String>,
}

/// In-process chat membership table.
#[derive(Debug, Default)]
pub struct ChatDirectory {
    chats: RwLock<HashMap<String, ChatRecord>>,
}

impl ChatDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chat whose game is active.
    pub fn open_chat(&self, chat_id: impl Into<String>) {
        self.chats.write().entry(chat_id.into()).or_default().game_active = true;
    }

    /// Mark the chat's game as finished.
    pub fn close_chat(&self, chat_id: &str) {
        if let Some(chat) = self.chats.write().get_mut(chat_id) {
            chat.game_active = false;
        }
    }

    pub fn add_member(
        &self,
        chat_id: &str,
        account_id: impl Into<String>,
        player_id: impl Into<String>,
    ) {
        if let Some(chat) = self.chats.write().get_mut(chat_id) {
            chat.members.insert(account_id.into(), player_id.into());
        }
    }

    fn member(&self, chat_id: &str, account_id: &str) -> Result<String, ChatAccessError> {
        let chats = self.chats.read();
        let chat = chats
            .get(chat_id)
            .ok_or_else(|| ChatAccessError::NoSuchChat(chat_id.to_string()))?;
        if !chat.game_active {
            return Err(ChatAccessError::GameNotActive(chat_id.to_string()));
        }
        chat.members
            .get(account_id)
            .cloned()
            .ok_or_else(|| ChatAccessError::NotAMember(chat_id.to_string()))
    }
}

#[async_trait]
impl ChatAccess for ChatDirectory {
    async fn listener_player(
        &self,
        chat_id: &str,
        account_id: &str,
    ) -> Result<String, ChatAccessError> {
        self.member(chat_id, account_id)
    }

    async fn sender_player(
        &self,
        chat_id: &str,
        account_id: &str,
    ) -> Result<String, ChatAccessError> {
        self.member(chat_id, account_id)
    }
}

/// Chat send and listen operations over the chat topic.
#[derive(Clone)]
pub struct ChatService {
    engine: PubSubEngine,
    access: Arc<dyn ChatAccess>,
    message_expiration_secs: u64,
    max_message_chars: usize,
}

impl ChatService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        pubsub: &PubSubConfig,
        chat: &ChatConfig,
        access: Arc<dyn ChatAccess>,
    ) -> Result<Self, PubSubError> {
        let topic = TopicConfig::new(&pubsub.project_id, &chat.topic_id)
            .with_graphql_field(CHAT_GRAPHQL_FIELD)
            .with_ordering_key(CHAT_ORDERING_KEY);
        Ok(Self {
            engine: PubSubEngine::new(bus, topic)?,
            access,
            message_expiration_secs: pubsub.message_expiration_secs,
            max_message_chars: chat.max_message_chars,
        })
    }

    #[must_use]
    pub fn engine(&self) -> &PubSubEngine {
        &self.engine
    }

    /// Start listening to `chat_id` as `account_id`.
    ///
    /// The bus subscription is created on the first `next()`.
    pub async fn subscribe_chat_messages(
        &self,
        chat_id: &str,
        account_id: &str,
    ) -> Result<PubSubAsyncIterator<ChatMessagesEvent>, ChatError> {
        let player_id = self.access.listener_player(chat_id, account_id).await?;
        let subscription_id = chat_subscription_id(chat_id, &player_id);
        let options = SubscribeOptions::default()
            .with_filter(SubscriptionFilter::key_equals("chatId", chat_id))
            .with_message_expiration_seconds(self.message_expiration_secs)
            .delete_existing(true);

        debug!(chat_id = %chat_id, player_id = %player_id, "Chat listener created");
        Ok(self
            .engine
            .async_iterator_with_options(subscription_id, options))
    }

    /// Send `message` to `chat_id` as `account_id`, stamped with the current time.
    pub async fn publish_chat_message(
        &self,
        chat_id: &str,
        account_id: &str,
        message: &str,
    ) -> Result<ChatMessage, ChatError> {
        self.publish_chat_message_at(chat_id, account_id, message, now_millis())
            .await
    }

    /// Send `message` with an explicit `sent_time` in epoch milliseconds.
    pub async fn publish_chat_message_at(
        &self,
        chat_id: &str,
        account_id: &str,
        message: &str,
        sent_time: f64,
    ) -> Result<ChatMessage, ChatError> {
        let len = message.chars().count();
        if len == 0 || len > self.max_message_chars {
            return Err(ChatError::InvalidMessageLength {
                len,
                max: self.max_message_chars,
            });
        }
        let from_player_id = self.access.sender_player(chat_id, account_id).await?;

        let chat_message = ChatMessage {
            chat_id: chat_id.to_string(),
            from_player_id,
            sent_time,
            message: message.to_string(),
        };
        let message_id = self
            .engine
            .publish(PublishOptions::new(&chat_message))
            .await?;
        info!(
            chat_id = %chat_id,
            from_player_id = %chat_message.from_player_id,
            message_id = %message_id,
            "Chat message sent"
        );
        Ok(chat_message)
    }
}

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or_default()
}
