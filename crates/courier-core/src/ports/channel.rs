//! OutboundChannel port - the external channel (chat bot, webhook, ...).
//!
//! The collaborator owns transport details (auth, wire format). The core only
//! needs to know whether a failed send is worth retrying.

use async_trait::async_trait;

use crate::domain::OutboundMessage;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Network error or 5xx-equivalent. Goes down the nack path.
    #[error("retriable channel error: {0}")]
    Retriable(String),

    /// Malformed target or permanent rejection. Dead-lettered.
    #[error("rejected by channel: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }
}

#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError>;
}
