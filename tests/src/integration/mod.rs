//! Cross-crate integration scenarios.

pub mod chat_flow;
pub mod subscription_lifecycle;
