//! # Bridge Errors
//!
//! Every failure the bridge surfaces to its callers.
//!
//! | Class | Variants |
//! |-------|----------|
//! | Configuration | `InvalidFilter`, `InvalidSubscriptionId`, `InvalidConfig` |
//! | Conflict | `SubscriptionExists` |
//! | Transport | `Transport` |
//! | Message corruption | `Deserialization` |
//! | Protocol misuse | `UnknownHandle`, `Queue` |
//! | Runtime | `SubscribeAborted` |

use crate::bus::BusError;
use crate::filter::FilterError;
use crate::queue::QueueError;
use crate::tracker::SubscriptionHandle;
use thiserror::Error;

/// Errors from the publish/subscribe bridge.
///
/// `Clone` so a cached subscribe result can be replayed to every reader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// The filter tree could not be compiled.
    #[error("Invalid subscription filter: {0}")]
    InvalidFilter(#[from] FilterError),

    /// The caller-supplied subscription id breaks the bus naming rules.
    #[error("Invalid subscription id {id:?}: {reason}")]
    InvalidSubscriptionId { id: String, reason: &'static str },

    /// Missing or malformed engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A subscription with this name already exists on the bus and
    /// replacement was not authorized.
    #[error("A subscription already exists with the name {name}")]
    SubscriptionExists { name: String },

    /// No live subscription is registered under this handle.
    #[error("There is no subscription with handle {0}")]
    UnknownHandle(SubscriptionHandle),

    /// The message bus rejected or failed the call.
    #[error("Message bus error: {0}")]
    Transport(#[from] BusError),

    /// A payload could not be serialized for publishing.
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    /// A delivered message could not be decoded.
    #[error("Failed to deserialize message {message_id}: {reason}")]
    Deserialization { message_id: String, reason: String },

    /// The delivery queue was used after it closed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The background subscribe task panicked or was cancelled.
    #[error("Subscribe task aborted: {0}")]
    SubscribeAborted(String),
}

impl PubSubError {
    /// True for failures that came from the bus transport.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
