//! TaskStore port - the task envelope store, source of truth for task state.
//!
//! Every transition is atomic with respect to concurrent leases: when two
//! callers race to lease the same row, exactly one of them gets it.
//! ack / nack / deadletter / release require the caller's lease token and fail
//! with `StoreError::LeaseExpired` once that lease has lapsed or been reclaimed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::{
    LeaseToken, LeasedTask, NewTask, QueueCounts, StoreError, TaskId, TaskKind, TaskRecord,
    TaskState,
};

/// Which kinds a lease (or poll) may pick up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    Any,
    Only(Vec<TaskKind>),
}

impl KindFilter {
    pub fn only(kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        Self::Only(kinds.into_iter().collect())
    }

    pub fn matches(&self, kind: &TaskKind) -> bool {
        match self {
            KindFilter::Any => true,
            KindFilter::Only(kinds) => kinds.contains(kind),
        }
    }
}

/// Filter for inspection queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub state: Option<TaskState>,
    pub kind: Option<TaskKind>,
}

impl ListFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: Option<TaskKind>) -> Self {
        self.kind = kind;
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.state.is_none_or(|s| s == record.state)
            && self.kind.as_ref().is_none_or(|k| *k == record.kind)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Durable write of a new Pending row.
    ///
    /// Fails with `DuplicateSubmission(existing_id)` when the idempotency key
    /// is already taken.
    async fn submit(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Atomically move one eligible row to InFlight and return it.
    ///
    /// Eligible: Pending with `visible_at <= now`, or InFlight with a lapsed
    /// lease. Highest priority first, then earliest `visible_at`.
    async fn lease(
        &self,
        kinds: &KindFilter,
        lease_duration: Duration,
    ) -> Result<Option<LeasedTask>, StoreError>;

    /// InFlight -> Succeeded.
    async fn ack(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError>;

    /// InFlight -> Pending with `visible_at = now + delay`.
    async fn nack(
        &self,
        id: TaskId,
        token: LeaseToken,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// InFlight -> DeadLettered.
    async fn deadletter(
        &self,
        id: TaskId,
        token: LeaseToken,
        reason: String,
    ) -> Result<(), StoreError>;

    /// InFlight -> Pending right away; `attempt_count` is kept.
    async fn release(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError>;

    /// Return every InFlight row with a lapsed lease to Pending.
    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// DeadLettered -> Pending with `attempt_count = 0`.
    async fn replay(&self, id: TaskId) -> Result<(), StoreError>;

    /// DeadLettered -> Failed.
    async fn discard(&self, id: TaskId) -> Result<(), StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Signalled whenever a row may have become leasable.
    ///
    /// Backends without change notification return `None` and pollers fall
    /// back to interval polling.
    fn changes(&self) -> Option<Arc<Notify>> {
        None
    }
}
