//! LogChannel - 送信内容をログに出すだけの OutboundChannel
//!
//! Default channel for local runs and the CLI. Every message is accepted and
//! written to the `courier::outbound` tracing target.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::OutboundMessage;
use crate::ports::{ChannelError, OutboundChannel};

#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl OutboundChannel for LogChannel {
    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        tracing::info!(
            target: "courier::outbound",
            target_id = %message.target,
            message = %message.message,
            "outbound message"
        );
        Ok(())
    }
}

/// Records everything it is asked to send. For tests.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<Vec<ChannelError>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors to return from the next sends, in order.
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = ChannelError>) {
        let mut failures = self.failures.lock().await;
        failures.extend(errors);
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        {
            let mut failures = self.failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}
