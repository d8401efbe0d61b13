//! Admin - 点検・手動操作
//!
//! Inspection and manual replay. Task outcomes are otherwise only visible
//! through the outbound channel.

use std::sync::Arc;

use crate::app::status::Status;
use crate::domain::{CourierError, QueueCounts, TaskId, TaskKind, TaskRecord, TaskState};
use crate::ports::ListFilter;
use crate::queue::Broker;

#[derive(Clone)]
pub struct Admin {
    broker: Arc<Broker>,
}

impl Admin {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub async fn get_task(&self, id: TaskId) -> Result<TaskRecord, CourierError> {
        self.broker.get(id).await
    }

    /// Dead-lettered tasks, oldest first, optionally of one kind.
    pub async fn list_dead_lettered(
        &self,
        kind: Option<&TaskKind>,
    ) -> Result<Vec<TaskRecord>, CourierError> {
        let filter = ListFilter::state(TaskState::DeadLettered).with_kind(kind.cloned());
        self.broker.list(&filter).await
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<TaskRecord>, CourierError> {
        self.broker.list(filter).await
    }

    /// Send a dead-lettered task back to Pending with a fresh attempt budget.
    pub async fn replay(&self, id: TaskId) -> Result<(), CourierError> {
        self.broker.replay(id).await?;
        tracing::info!(task_id = %id, "task replayed");
        Ok(())
    }

    /// Give up on a dead-lettered task for good (DeadLettered -> Failed).
    pub async fn discard(&self, id: TaskId) -> Result<(), CourierError> {
        self.broker.discard(id).await?;
        tracing::info!(task_id = %id, "task discarded");
        Ok(())
    }

    pub async fn counts(&self) -> Result<QueueCounts, CourierError> {
        self.broker.counts().await
    }

    pub async fn status(&self) -> Result<Status, CourierError> {
        let rows = self.broker.list(&ListFilter::default()).await?;
        Ok(Status::from_records(&rows))
    }
}
