//! Producer - タスク投入口
//!
//! Validates submissions before they reach the store. A rejected submission
//! never enters the queue; an idempotency-key collision is not an error and
//! returns the id of the existing task.

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{CourierError, NewTask, StoreError, TaskId, TaskKind};
use crate::queue::Broker;
use crate::typed::Task;

#[derive(Clone)]
pub struct Producer {
    broker: Arc<Broker>,
    max_payload_bytes: usize,
    /// When set, only these kinds are accepted.
    known_kinds: Option<Arc<HashSet<TaskKind>>>,
}

impl Producer {
    pub fn new(broker: Arc<Broker>, max_payload_bytes: usize) -> Self {
        Self {
            broker,
            max_payload_bytes,
            known_kinds: None,
        }
    }

    /// Reject kinds nobody handles.
    pub fn with_known_kinds(mut self, kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        self.known_kinds = Some(Arc::new(kinds.into_iter().collect()));
        self
    }

    pub async fn submit(
        &self,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
    ) -> Result<TaskId, CourierError> {
        self.submit_task(NewTask::new(kind, payload)).await
    }

    pub async fn submit_with_key(
        &self,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Result<TaskId, CourierError> {
        self.submit_task(NewTask::new(kind, payload).with_idempotency_key(idempotency_key))
            .await
    }

    pub async fn submit_typed<T: Task>(&self, task: &T) -> Result<TaskId, CourierError> {
        self.submit_task(typed_task(task)?).await
    }

    pub async fn submit_typed_with_key<T: Task>(
        &self,
        task: &T,
        idempotency_key: impl Into<String>,
    ) -> Result<TaskId, CourierError> {
        self.submit_task(typed_task(task)?.with_idempotency_key(idempotency_key))
            .await
    }

    /// Full-control submit (priority, delay, key).
    pub async fn submit_task(&self, task: NewTask) -> Result<TaskId, CourierError> {
        self.validate(&task)?;

        let kind = task.kind.clone();
        match self.broker.submit(task).await {
            Ok(id) => {
                tracing::info!(task_id = %id, %kind, "task submitted");
                Ok(id)
            }
            Err(CourierError::Store(StoreError::DuplicateSubmission(existing))) => {
                tracing::debug!(
                    task_id = %existing,
                    %kind,
                    "duplicate submission, returning existing task"
                );
                Ok(existing)
            }
            Err(err) => Err(err),
        }
    }

    fn validate(&self, task: &NewTask) -> Result<(), CourierError> {
        if !task.kind.is_valid() {
            return Err(CourierError::InvalidPayload(format!(
                "invalid kind '{}'",
                task.kind
            )));
        }
        if let Some(known) = &self.known_kinds
            && !known.contains(&task.kind)
        {
            return Err(CourierError::UnknownKind(task.kind.to_string()));
        }
        if task.idempotency_key.as_deref().is_some_and(str::is_empty) {
            return Err(CourierError::InvalidPayload(
                "idempotency key must not be empty".into(),
            ));
        }

        let size = serde_json::to_vec(&task.payload)
            .map_err(|e| CourierError::InvalidPayload(e.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(CourierError::InvalidPayload(format!(
                "payload is {size} bytes, limit is {}",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

fn typed_task<T: Task>(task: &T) -> Result<NewTask, CourierError> {
    let payload = serde_json::to_value(task)
        .map_err(|e| CourierError::InvalidPayload(format!("{}: {e}", T::KIND)))?;
    Ok(NewTask::new(T::KIND, payload))
}
