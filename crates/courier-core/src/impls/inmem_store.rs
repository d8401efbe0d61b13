//! In-memory task envelope store.
//!
//! `StoreState` holds the rows and applies every transition synchronously;
//! `InMemoryTaskStore` wraps it in a tokio `Mutex`, which makes each
//! transition atomic (the lock is the compare-and-swap). Lease selection is a
//! linear scan, which is fine for the row counts this store is meant for.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::task::after;
use crate::domain::{
    LeaseToken, LeasedTask, NewTask, QueueCounts, StoreError, TaskId, TaskRecord, TaskState,
};
use crate::ports::{
    Clock, IdGenerator, KindFilter, ListFilter, SystemClock, TaskStore, UlidGenerator,
};

/// Rows plus the idempotency index.
#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<TaskId, TaskRecord>,
    idempotency: HashMap<String, TaskId>,
}

impl StoreState {
    fn submit(
        &mut self,
        id: TaskId,
        task: NewTask,
        now: DateTime<Utc>,
    ) -> Result<TaskId, StoreError> {
        if let Some(key) = &task.idempotency_key {
            if let Some(existing) = self.idempotency.get(key) {
                return Err(StoreError::DuplicateSubmission(*existing));
            }
            self.idempotency.insert(key.clone(), id);
        }
        self.records.insert(id, TaskRecord::new(id, task, now));
        Ok(id)
    }

    fn lease(
        &mut self,
        token: LeaseToken,
        kinds: &KindFilter,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<LeasedTask> {
        let id = self
            .records
            .values()
            .filter(|r| r.is_leasable(now) && kinds.matches(&r.kind))
            .max_by_key(|r| (r.priority, Reverse(available_since(r)), Reverse(r.id)))
            .map(|r| r.id)?;

        let record = self.records.get_mut(&id)?;
        if record.lease_lapsed(now) {
            tracing::debug!(task_id = %id, "reclaiming task with expired lease");
        }
        let expires_at = after(now, lease_duration);
        record.start_lease(token, expires_at, now);

        Some(LeasedTask {
            task: record.clone(),
            token,
            expires_at,
        })
    }

    /// The row, if `token` is still its live lease.
    fn leased_mut(
        &mut self,
        id: TaskId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<&mut TaskRecord, StoreError> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !record.holds_lease(token, now) {
            return Err(StoreError::LeaseExpired(id));
        }
        Ok(record)
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn ack(
        &mut self,
        id: TaskId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.leased_mut(id, token, now)?.mark_succeeded(now);
        Ok(())
    }

    fn nack(
        &mut self,
        id: TaskId,
        token: LeaseToken,
        delay: Duration,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.leased_mut(id, token, now)?
            .schedule_retry(after(now, delay), error, now);
        Ok(())
    }

    fn deadletter(
        &mut self,
        id: TaskId,
        token: LeaseToken,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.leased_mut(id, token, now)?.mark_dead_lettered(reason, now);
        Ok(())
    }

    fn release(
        &mut self,
        id: TaskId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.leased_mut(id, token, now)?.release(now);
        Ok(())
    }

    fn reap_expired(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut reaped = Vec::new();
        for record in self.records.values_mut() {
            if record.lease_lapsed(now) {
                record.release(now);
                reaped.push(record.id);
            }
        }
        reaped
    }

    fn replay(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let record = self.get_mut(id)?;
        match record.state {
            TaskState::DeadLettered | TaskState::Failed => {
                record.replay(now);
                Ok(())
            }
            from => Err(StoreError::InvalidTransition {
                task_id: id,
                from,
                to: TaskState::Pending,
            }),
        }
    }

    fn discard(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let record = self.get_mut(id)?;
        match record.state {
            TaskState::DeadLettered => {
                record.discard(now);
                Ok(())
            }
            from => Err(StoreError::InvalidTransition {
                task_id: id,
                from,
                to: TaskState::Failed,
            }),
        }
    }

    fn list(&self, filter: &ListFilter) -> Vec<TaskRecord> {
        let mut rows: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            counts.record(record.state);
        }
        counts
    }
}

/// When a leasable row became available: `visible_at` for Pending rows, the
/// lease expiry for lapsed InFlight rows.
fn available_since(record: &TaskRecord) -> DateTime<Utc> {
    match (record.state, record.lease) {
        (TaskState::InFlight, Some(lease)) => lease.expires_at,
        _ => record.visible_at,
    }
}

/// Process-local store. Rows are lost when the process exits.
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    notify: Arc<Notify>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            ids,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Apply `f` under the lock.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        f(&mut state, now)
    }

    fn wake_pollers(&self) {
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let id = self.ids.task_id();
        let id = self.mutate(|s, now| s.submit(id, task, now)).await?;
        self.wake_pollers();
        Ok(id)
    }

    async fn lease(
        &self,
        kinds: &KindFilter,
        lease_duration: Duration,
    ) -> Result<Option<LeasedTask>, StoreError> {
        let token = self.ids.lease_token();
        self.mutate(|s, now| Ok(s.lease(token, kinds, lease_duration, now)))
            .await
    }

    async fn ack(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError> {
        self.mutate(|s, now| s.ack(id, token, now)).await
    }

    async fn nack(
        &self,
        id: TaskId,
        token: LeaseToken,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(|s, now| s.nack(id, token, delay, error, now))
            .await?;
        self.wake_pollers();
        Ok(())
    }

    async fn deadletter(
        &self,
        id: TaskId,
        token: LeaseToken,
        reason: String,
    ) -> Result<(), StoreError> {
        self.mutate(|s, now| s.deadletter(id, token, reason, now))
            .await
    }

    async fn release(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError> {
        self.mutate(|s, now| s.release(id, token, now)).await?;
        self.wake_pollers();
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError> {
        let reaped = self.mutate(|s, now| Ok(s.reap_expired(now))).await?;
        if !reaped.is_empty() {
            self.wake_pollers();
        }
        Ok(reaped)
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let state = self.state.lock().await;
        state.records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.list(filter))
    }

    async fn replay(&self, id: TaskId) -> Result<(), StoreError> {
        self.mutate(|s, now| s.replay(id, now)).await?;
        self.wake_pollers();
        Ok(())
    }

    async fn discard(&self, id: TaskId) -> Result<(), StoreError> {
        self.mutate(|s, now| s.discard(id, now)).await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.state.lock().await.counts())
    }

    fn changes(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.notify))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, TaskKind};
    use crate::ports::ManualClock;
    use chrono::TimeZone;

    const LEASE: Duration = Duration::from_secs(30);

    fn store() -> (Arc<InMemoryTaskStore>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (Arc::new(InMemoryTaskStore::new(clock.clone())), clock)
    }

    fn notify(payload: serde_json::Value) -> NewTask {
        NewTask::new("notify", payload)
    }

    #[tokio::test]
    async fn submit_and_counts() {
        let (store, _) = store();
        store.submit(notify(serde_json::json!({}))).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 0);
    }

    #[tokio::test]
    async fn lease_transitions_to_in_flight() {
        let (store, _) = store();
        let id = store.submit(notify(serde_json::json!({"to": "a"}))).await.unwrap();

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id(), id);
        assert_eq!(leased.attempt_count(), 1);
        assert_eq!(leased.task.state, TaskState::InFlight);

        // nothing else to lease
        assert!(store.lease(&KindFilter::Any, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_marks_succeeded() {
        let (store, _) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        store.ack(id, leased.token).await.unwrap();

        let row = store.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::Succeeded);
        assert!(row.lease.is_none());
    }

    #[tokio::test]
    async fn idempotent_submit_returns_existing_id() {
        let (store, _) = store();
        let first = store
            .submit(notify(serde_json::json!({})).with_idempotency_key("k1"))
            .await
            .unwrap();
        let second = store
            .submit(notify(serde_json::json!({})).with_idempotency_key("k1"))
            .await;

        assert!(matches!(second, Err(StoreError::DuplicateSubmission(id)) if id == first));
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn nacked_task_is_invisible_until_delay_passes() {
        let (store, clock) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        store
            .nack(id, leased.token, Duration::from_secs(10), Some("flaky".into()))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(9));
        assert!(store.lease(&KindFilter::Any, LEASE).await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let again = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.attempt_count(), 2);
        assert_eq!(again.task.last_error.as_deref(), Some("flaky"));
    }

    #[tokio::test]
    async fn stale_token_cannot_ack_after_reclaim() {
        let (store, clock) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let first = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        clock.advance(LEASE);
        let second = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(second.id(), id);
        assert_ne!(second.token, first.token);

        let err = store.ack(id, first.token).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseExpired(x) if x == id));
        store.ack(id, second.token).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_cannot_ack_even_before_reclaim() {
        let (store, clock) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        clock.advance(LEASE + Duration::from_secs(1));
        assert!(matches!(
            store.nack(id, leased.token, Duration::ZERO, None).await,
            Err(StoreError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_leases_have_exactly_one_winner() {
        let (store, _) = store();
        store.submit(notify(serde_json::json!({}))).await.unwrap();

        let mut joins = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store.lease(&KindFilter::Any, LEASE).await.unwrap()
            }));
        }

        let mut winners = 0;
        for join in joins {
            if join.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn lease_prefers_higher_priority() {
        let (store, _) = store();
        store
            .submit(notify(serde_json::json!({"n": 1})).with_priority(Priority::Low))
            .await
            .unwrap();
        let high = store
            .submit(notify(serde_json::json!({"n": 2})).with_priority(Priority::High))
            .await
            .unwrap();

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id(), high);
    }

    #[tokio::test]
    async fn lease_respects_kind_filter() {
        let (store, _) = store();
        store.submit(notify(serde_json::json!({}))).await.unwrap();
        let other = store
            .submit(NewTask::new("resize", serde_json::json!({})))
            .await
            .unwrap();

        let filter = KindFilter::only([TaskKind::new("resize")]);
        let leased = store.lease(&filter, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id(), other);
        assert!(store.lease(&filter, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reap_returns_lapsed_rows_to_pending() {
        let (store, clock) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        assert!(store.reap_expired().await.unwrap().is_empty());
        clock.advance(LEASE);
        assert_eq!(store.reap_expired().await.unwrap(), vec![id]);

        let row = store.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn deadletter_replay_and_discard() {
        let (store, _) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        store.deadletter(id, leased.token, "bad".into()).await.unwrap();

        let dead = store
            .list(&ListFilter::state(TaskState::DeadLettered))
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("bad"));

        store.replay(id).await.unwrap();
        let row = store.get(id).await.unwrap();
        assert_eq!((row.state, row.attempt_count), (TaskState::Pending, 0));

        // replaying a pending row is not allowed
        assert!(matches!(
            store.replay(id).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        store.deadletter(id, leased.token, "bad again".into()).await.unwrap();
        store.discard(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn release_keeps_attempt_count() {
        let (store, _) = store();
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        store.release(id, leased.token).await.unwrap();

        let row = store.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.attempt_count, 1);
        assert!(store.lease(&KindFilter::Any, LEASE).await.unwrap().is_some());
    }
}
