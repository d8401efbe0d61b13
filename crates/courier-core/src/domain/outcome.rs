//! Outcome model: what a handler reports back for one delivery.
//!
//! A handler either succeeds (optionally producing messages for the outbound
//! channel) or fails with a classified `HandlerError`. The worker turns that
//! into an ack, a nack or a dead-letter.

use serde::{Deserialize, Serialize};

/// A message bound for the external channel (e.g. a chat id + text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: String,
    pub message: String,
}

impl OutboundMessage {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Successful result of a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Delivered through the dispatch gateway after the handler returns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<OutboundMessage>,
}

impl Outcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, target: impl Into<String>, message: impl Into<String>) -> Self {
        self.messages.push(OutboundMessage::new(target, message));
        self
    }
}

/// Classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (network blip, upstream 5xx, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Will never succeed; dead-letter immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_collects_messages() {
        let o = Outcome::success()
            .with_message("chat:1", "hello")
            .with_message("chat:2", "bye");

        assert_eq!(o.messages.len(), 2);
        assert_eq!(o.messages[0], OutboundMessage::new("chat:1", "hello"));
    }

    #[test]
    fn handler_error_classification() {
        assert!(HandlerError::permanent("bad target").is_permanent());
        assert!(!HandlerError::transient("timeout").is_permanent());
        assert_eq!(HandlerError::transient("timeout").reason(), "timeout");
        assert_eq!(
            HandlerError::permanent("x").to_string(),
            "permanent failure: x"
        );
    }
}
