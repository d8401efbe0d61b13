//! Decision model: what happens to a task after a failed delivery.
//!
//! Deciders are pure functions of (task row, failure). The worker applies the
//! result through the broker.

use std::time::Duration;

use super::outcome::HandlerError;
use super::task::TaskRecord;
use crate::queue::RetryPolicy;

/// The next action for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// nack: back to Pending, visible again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Terminal. Kept for inspection and replay.
    DeadLetter { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, failure: &HandlerError) -> Decision;
}

/// Attempt-based retry with exponential backoff:
/// - permanent failures dead-letter immediately
/// - `attempt_count >= max_attempts` dead-letters
/// - anything else retries after `RetryPolicy::next_delay`
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, failure: &HandlerError) -> Decision {
        if failure.is_permanent() {
            return Decision::DeadLetter {
                reason: failure.to_string(),
            };
        }

        if self.retry_policy.should_deadletter(task.attempt_count) {
            Decision::DeadLetter {
                reason: format!(
                    "max attempts reached ({}/{}): {}",
                    task.attempt_count,
                    self.retry_policy.max_attempts,
                    failure.reason()
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.attempt_count);
            Decision::Retry {
                delay,
                reason: failure.reason().to_string(),
            }
        }
    }
}
