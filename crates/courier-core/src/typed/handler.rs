//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (`Handler<T>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure (`TypedHandler<T, H>` → `DynHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{HandlerError, Outcome, TaskId, TaskKind};

/// Per-delivery facts a handler may need, e.g. to make its side effect
/// idempotent across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// 1 on the first delivery.
    pub attempt: u32,
}

/// Handler は Task を実行して Outcome を返す
///
/// Delivery is at-least-once: the same task may be handled more than once
/// (lease expiry, lost ack), so side effects must be idempotent.
///
/// ```ignore
/// struct NotifyHandler;
///
/// #[async_trait]
/// impl Handler<Notify> for NotifyHandler {
///     async fn handle(&self, ctx: TaskContext, task: Notify) -> Result<Outcome, HandlerError> {
///         Ok(Outcome::success().with_message(task.chat_id, task.text))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: T) -> Result<Outcome, HandlerError>;
}

/// Object-safe form stored in the registry, keyed by kind.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<Outcome, HandlerError>;

    fn kind(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<Outcome, HandlerError> {
        // a payload that doesn't decode now never will
        let task: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::permanent(format!("payload decode for {}: {e}", T::KIND)))?;
        self.handler.handle(ctx, task).await
    }

    fn kind(&self) -> &str {
        T::KIND
    }
}
