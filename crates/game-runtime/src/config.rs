//! # Runtime Configuration
//!
//! Plain structs with documented defaults, overridden from the environment.
//!
//! | Variable | Default | Field |
//! |----------|---------|-------|
//! | `GOOGLE_PROJECT_ID` | required | `pubsub.project_id` |
//! | `GAME_MESSAGE_EXPIRATION_SECS` | `86400` | `pubsub.message_expiration_secs` |
//! | `GAME_MAX_DELIVERY_ATTEMPTS` | `5` | `pubsub.max_delivery_attempts` |
//! | `GAME_CHAT_TOPIC` | `chat-messages` | `chat.topic_id` |

use shared_pubsub::{DEFAULT_MAX_DELIVERY_ATTEMPTS, DEFAULT_MESSAGE_EXPIRATION_SECS};
use std::env;
use thiserror::Error;

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Message bus configuration.
    pub pubsub: PubSubConfig,
    /// Chat feature configuration.
    pub chat: ChatConfig,
}

/// Message bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Cloud project owning every topic and subscription. No usable default.
    pub project_id: String,
    /// Idle time before the bus may expire a subscription.
    pub message_expiration_secs: u64,
    /// Deliveries before a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            message_expiration_secs: DEFAULT_MESSAGE_EXPIRATION_SECS,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

/// Chat feature configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub topic_id: String,
    /// Longest accepted chat message, in characters.
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            topic_id: "chat-messages".to_string(),
            max_message_chars: 500,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("GOOGLE_PROJECT_ID must be set to the cloud project id")]
    MissingProjectId,

    #[error("{variable} has an invalid value {value:?}")]
    InvalidValue { variable: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

impl RuntimeConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source and validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(project_id) = lookup("GOOGLE_PROJECT_ID") {
            config.pubsub.project_id = project_id.trim().to_string();
        }
        if let Some(topic_id) = lookup("GAME_CHAT_TOPIC") {
            config.chat.topic_id = topic_id.trim().to_string();
        }
        if let Some(secs) = parse_var(&lookup, "GAME_MESSAGE_EXPIRATION_SECS")? {
            config.pubsub.message_expiration_secs = secs;
        }
        if let Some(attempts) = parse_var(&lookup, "GAME_MAX_DELIVERY_ATTEMPTS")? {
            config.pubsub.max_delivery_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    ///
    /// # Returns
    ///
    /// Returns `Err` if:
    /// - the project id is empty
    /// - the chat topic id is empty
    /// - delivery attempts or the message length limit is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pubsub.project_id.is_empty() {
            return Err(ConfigError::MissingProjectId);
        }
        if self.chat.topic_id.is_empty() {
            return Err(ConfigError::Invalid("chat topic id must not be empty"));
        }
        if self.pubsub.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max delivery attempts must be at least 1",
            ));
        }
        if self.chat.max_message_chars == 0 {
            return Err(ConfigError::Invalid(
                "chat messages must allow at least one character",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(variable) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue { variable, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_project_id_required() {
        assert_eq!(
            RuntimeConfig::from_lookup(lookup_from(&[])),
            Err(ConfigError::MissingProjectId)
        );
        assert_eq!(
            RuntimeConfig::from_lookup(lookup_from(&[("GOOGLE_PROJECT_ID", "  ")])),
            Err(ConfigError::MissingProjectId)
        );
    }

    #[test]
    fn test_defaults_with_project() {
        let config =
            RuntimeConfig::from_lookup(lookup_from(&[("GOOGLE_PROJECT_ID", "game")])).unwrap();
        assert_eq!(config.pubsub.project_id, "game");
        assert_eq!(config.pubsub.message_expiration_secs, 86_400);
        assert_eq!(config.pubsub.max_delivery_attempts, 5);
        assert_eq!(config.chat.topic_id, "chat-messages");
        assert_eq!(config.chat.max_message_chars, 500);
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("GOOGLE_PROJECT_ID", "game"),
            ("GAME_CHAT_TOPIC", "chat-v2"),
            ("GAME_MESSAGE_EXPIRATION_SECS", "3600"),
            ("GAME_MAX_DELIVERY_ATTEMPTS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.chat.topic_id, "chat-v2");
        assert_eq!(config.pubsub.message_expiration_secs, 3600);
        assert_eq!(config.pubsub.max_delivery_attempts, 10);
    }

    #[test]
    fn test_malformed_number_rejected() {
        let result = RuntimeConfig::from_lookup(lookup_from(&[
            ("GOOGLE_PROJECT_ID", "game"),
            ("GAME_MAX_DELIVERY_ATTEMPTS", "lots"),
        ]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                variable: "GAME_MAX_DELIVERY_ATTEMPTS",
                value: "lots".to_string(),
            })
        );
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = RuntimeConfig::from_lookup(lookup_from(&[
            ("GOOGLE_PROJECT_ID", "game"),
            ("GAME_MAX_DELIVERY_ATTEMPTS", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
