//! Task rows: kind, state machine, and the record the store keeps per task.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LeaseToken, TaskId};

/// Identifies which handler processes a task (e.g. `notify`, `bot.send.v1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kinds are non-empty and limited to `[A-Za-z0-9._-]`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a task. Exactly one at a time.
///
/// State transitions:
/// - Pending -> InFlight (lease)
/// - InFlight -> Succeeded (ack)
/// - InFlight -> Pending (nack with delay, release, lease expiry)
/// - InFlight -> DeadLettered (permanent failure / attempts exhausted)
/// - DeadLettered -> Pending (admin replay)
/// - DeadLettered -> Failed (admin discard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for `visible_at`, then eligible for lease.
    Pending,

    /// Leased by exactly one worker.
    InFlight,

    /// Acked.
    Succeeded,

    /// Dead-lettered and then discarded by an operator.
    Failed,

    /// Retained for inspection and manual replay.
    DeadLettered,
}

impl TaskState {
    /// Is this a terminal state (no automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::DeadLettered
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::InFlight => "in_flight",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// Lease ordering among eligible rows. Higher wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// The active claim on an InFlight row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// One row of the task envelope store.
///
/// This is the single source of truth for a task. All state transitions go
/// through the methods below, which the store calls under its lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub state: TaskState,

    /// Number of deliveries so far (incremented on every lease).
    pub attempt_count: u32,

    /// The row is not leased before this instant.
    pub visible_at: DateTime<Utc>,

    /// Present iff `state == InFlight`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            payload: new.payload,
            priority: new.priority,
            idempotency_key: new.idempotency_key,
            state: TaskState::Pending,
            attempt_count: 0,
            visible_at: after(now, new.delay),
            lease: None,
            last_error: None,
            dead_letter_reason: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Pending and visible, or InFlight with a lapsed lease.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Pending => self.visible_at <= now,
            TaskState::InFlight => self.lease.is_some_and(|l| l.expires_at <= now),
            _ => false,
        }
    }

    /// InFlight with an expired lease.
    pub fn lease_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::InFlight && self.lease.is_some_and(|l| l.expires_at <= now)
    }

    /// True if `token` is the current, unexpired lease.
    pub fn holds_lease(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.state == TaskState::InFlight
            && self
                .lease
                .is_some_and(|l| l.token == token && l.expires_at > now)
    }

    /// Pending -> InFlight (or re-lease of a lapsed InFlight row).
    pub fn start_lease(
        &mut self,
        token: LeaseToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = TaskState::InFlight;
        self.attempt_count += 1;
        self.lease = Some(LeaseInfo { token, expires_at });
        self.last_updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Succeeded;
        self.lease = None;
        self.last_updated_at = now;
    }

    /// InFlight -> Pending with backoff.
    pub fn schedule_retry(
        &mut self,
        visible_at: DateTime<Utc>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.state = TaskState::Pending;
        self.lease = None;
        self.visible_at = visible_at;
        if error.is_some() {
            self.last_error = error;
        }
        self.last_updated_at = now;
    }

    /// InFlight -> Pending immediately, keeping `attempt_count`.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.schedule_retry(now, None, now);
    }

    pub fn mark_dead_lettered(&mut self, reason: String, now: DateTime<Utc>) {
        self.state = TaskState::DeadLettered;
        self.lease = None;
        self.dead_letter_reason = Some(reason);
        self.last_updated_at = now;
    }

    /// DeadLettered -> Pending with a fresh attempt budget.
    pub fn replay(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.attempt_count = 0;
        self.visible_at = now;
        self.lease = None;
        self.dead_letter_reason = None;
        self.last_updated_at = now;
    }

    /// DeadLettered -> Failed.
    pub fn discard(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Failed;
        self.last_updated_at = now;
    }
}

/// Input to `TaskStore::submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    /// Initial invisibility window (zero for normal submissions).
    pub delay: std::time::Duration,
}

impl NewTask {
    pub fn new(kind: impl Into<TaskKind>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: Priority::Normal,
            idempotency_key: None,
            delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What a worker holds after a successful lease: a snapshot of the row plus
/// the token needed for every follow-up transition.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task: TaskRecord,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl LeasedTask {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.task.kind
    }

    pub fn attempt_count(&self) -> u32 {
        self.task.attempt_count
    }
}

/// Row counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: TaskState) {
        self.add(state, 1);
    }

    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::InFlight => self.in_flight += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Failed => self.failed += n,
            TaskState::DeadLettered => self.dead_lettered += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.succeeded + self.failed + self.dead_lettered
    }
}

/// `now + d`, saturating at the far future instead of panicking.
pub fn after(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
