//! DispatchGateway - 外部チャネルへの送信口
//!
//! Every send takes a token from the shared `RateGovernor` first, from the
//! global bucket and the message target's bucket. When no token arrives
//! within `dispatch_wait`, the send is not retried in place: it is queued as
//! a low-priority `courier.dispatch` task, hidden for the governor's wait
//! estimate, and the worker moves on. A send that takes longer than
//! `send_timeout` counts as a retriable channel failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::producer::Producer;
use crate::domain::{
    CourierError, HandlerError, NewTask, OutboundMessage, Outcome, Priority, TaskId,
};
use crate::governor::RateGovernor;
use crate::ports::{ChannelError, OutboundChannel};
use crate::typed::{Handler, Task, TaskContext};

/// Kind of the deferred-send tasks the gateway queues for itself.
pub const DISPATCH_KIND: &str = "courier.dispatch";

impl Task for OutboundMessage {
    const KIND: &'static str = DISPATCH_KIND;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No token in time; queued as this dispatch task.
    Deferred(TaskId),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Courier(#[from] CourierError),
}

pub struct DispatchGateway {
    governor: RateGovernor,
    channel: Arc<dyn OutboundChannel>,
    producer: Producer,
    wait: Duration,
    send_timeout: Duration,
}

impl DispatchGateway {
    pub fn new(
        governor: RateGovernor,
        channel: Arc<dyn OutboundChannel>,
        producer: Producer,
        wait: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            governor,
            channel,
            producer,
            wait,
            send_timeout,
        }
    }

    /// Rate-governed send; defers to the queue when the governor says no.
    pub async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, DispatchError> {
        self.send_keyed(message, None).await
    }

    /// `send` on behalf of a task. The deferral is keyed by the source task
    /// and message index so a redelivered source task queues each message
    /// once.
    pub async fn send_for(
        &self,
        source: TaskId,
        index: usize,
        message: &OutboundMessage,
    ) -> Result<SendOutcome, DispatchError> {
        self.send_keyed(message, Some(format!("{DISPATCH_KIND}:{source}:{index}")))
            .await
    }

    async fn send_keyed(
        &self,
        message: &OutboundMessage,
        key: Option<String>,
    ) -> Result<SendOutcome, DispatchError> {
        if !self.take_token(message).await {
            let id = self.defer(message, key).await?;
            return Ok(SendOutcome::Deferred(id));
        }
        self.deliver(message).await?;
        tracing::debug!(target_id = %message.target, "message sent");
        Ok(SendOutcome::Sent)
    }

    /// Send without the deferral fallback: a denied token is
    /// `CapacityExceeded`.
    pub async fn send_now(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        if !self.take_token(message).await {
            return Err(CourierError::CapacityExceeded.into());
        }
        self.deliver(message).await?;
        Ok(())
    }

    async fn take_token(&self, message: &OutboundMessage) -> bool {
        self.governor
            .acquire_for(&message.target, 1, self.wait)
            .await
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        match tokio::time::timeout(self.send_timeout, self.channel.send(message)).await {
            Ok(sent) => sent,
            Err(_) => {
                tracing::warn!(
                    target_id = %message.target,
                    send_timeout = ?self.send_timeout,
                    "channel send timed out"
                );
                Err(ChannelError::Retriable(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                )))
            }
        }
    }

    async fn defer(
        &self,
        message: &OutboundMessage,
        key: Option<String>,
    ) -> Result<TaskId, CourierError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| CourierError::InvalidPayload(e.to_string()))?;
        // no estimate means the bucket never refills; the dispatch task
        // backs off through its own retries instead
        let delay = self
            .governor
            .wait_time(Some(&message.target), 1)
            .await
            .unwrap_or(Duration::ZERO);
        let mut task = NewTask::new(DISPATCH_KIND, payload)
            .with_priority(Priority::Low)
            .with_delay(delay);
        if let Some(key) = key {
            task = task.with_idempotency_key(key);
        }
        let id = self.producer.submit_task(task).await?;
        tracing::info!(
            task_id = %id,
            target_id = %message.target,
            ?delay,
            "send deferred, rate capacity exceeded"
        );
        Ok(id)
    }
}

/// Built-in handler for deferred sends. A denied token is a transient
/// failure, so the task backs off through the normal retry path instead of
/// queueing yet another dispatch task.
pub struct DispatchHandler {
    gateway: Arc<DispatchGateway>,
}

impl DispatchHandler {
    pub fn new(gateway: Arc<DispatchGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Handler<OutboundMessage> for DispatchHandler {
    async fn handle(
        &self,
        _ctx: TaskContext,
        message: OutboundMessage,
    ) -> Result<Outcome, HandlerError> {
        match self.gateway.send_now(&message).await {
            Ok(()) => Ok(Outcome::success()),
            Err(err) => Err(classify(err)),
        }
    }
}

/// Channel rejections are permanent; everything else is worth a retry.
pub(crate) fn classify(err: DispatchError) -> HandlerError {
    match err {
        DispatchError::Channel(ChannelError::Rejected(reason)) => HandlerError::Permanent(reason),
        DispatchError::Channel(ChannelError::Retriable(reason)) => HandlerError::Transient(reason),
        DispatchError::Courier(err) => HandlerError::transient(err.to_string()),
    }
}
