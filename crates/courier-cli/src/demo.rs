//! Demo handlers wired into `courier run`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::domain::{HandlerError, Outcome};
use courier_core::typed::{Handler, Task, TaskContext};

/// `{"target": "...", "message": "...", "fail_until": 0}`
///
/// Fails transiently until the delivery number exceeds `fail_until`, which
/// makes the retry path easy to watch from the command line.
#[derive(Debug, Serialize, Deserialize)]
pub struct Notify {
    pub target: String,
    pub message: String,
    #[serde(default)]
    pub fail_until: u32,
}

impl Task for Notify {
    const KIND: &'static str = "notify";
}

pub struct NotifyHandler;

#[async_trait]
impl Handler<Notify> for NotifyHandler {
    async fn handle(&self, ctx: TaskContext, task: Notify) -> Result<Outcome, HandlerError> {
        if ctx.attempt <= task.fail_until {
            return Err(HandlerError::transient(format!(
                "simulated failure on attempt {}",
                ctx.attempt
            )));
        }
        if task.target.is_empty() {
            return Err(HandlerError::permanent("empty target"));
        }
        Ok(Outcome::success().with_message(task.target, task.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::domain::TaskId;

    fn ctx(attempt: u32) -> TaskContext {
        TaskContext {
            task_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<TaskId>().unwrap(),
            kind: Notify::kind(),
            attempt,
        }
    }

    #[tokio::test]
    async fn fails_until_threshold_then_sends() {
        let task = || Notify {
            target: "chat-1".into(),
            message: "hi".into(),
            fail_until: 2,
        };
        assert!(NotifyHandler.handle(ctx(2), task()).await.is_err());
        let outcome = NotifyHandler.handle(ctx(3), task()).await.unwrap();
        assert_eq!(outcome.messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_target_is_permanent() {
        let err = NotifyHandler
            .handle(
                ctx(1),
                Notify {
                    target: String::new(),
                    message: "hi".into(),
                    fail_until: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
