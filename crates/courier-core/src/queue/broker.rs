//! Broker - ストアの前に立つ配送口
//!
//! Workers never talk to the store directly. The broker
//! - turns `lease` into a bounded-wait `poll`, woken by the store's change
//!   signal and falling back to `poll_interval`,
//! - caps concurrent store calls at `pool_size` (the connection pool),
//! - retries connectivity failures up to `store_retry_budget` times, after
//!   which it reports `CourierError::StoreUnavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::Instant;

use crate::domain::{
    CourierError, LeaseToken, LeasedTask, NewTask, QueueCounts, StoreError, TaskId, TaskRecord,
};
use crate::ports::{KindFilter, ListFilter, TaskStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub lease_duration: Duration,
    /// Re-check interval while waiting, for stores without change signals
    /// and for delayed rows becoming visible.
    pub poll_interval: Duration,
    pub pool_size: usize,
    pub store_retry_budget: u32,
    pub store_retry_delay: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            pool_size: 8,
            store_retry_budget: 3,
            store_retry_delay: Duration::from_millis(200),
        }
    }
}

pub struct Broker {
    store: Arc<dyn TaskStore>,
    pool: Semaphore,
    changes: Arc<Notify>,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(store: Arc<dyn TaskStore>, settings: BrokerSettings) -> Self {
        // never signalled when the store has no change feed; pollers then
        // just sleep for poll_interval
        let changes = store.changes().unwrap_or_else(|| Arc::new(Notify::new()));
        Self {
            pool: Semaphore::new(settings.pool_size.max(1)),
            store,
            changes,
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Lease one task of the given kinds, waiting up to `max_wait` for one
    /// to become available.
    pub async fn poll(
        &self,
        kinds: &KindFilter,
        max_wait: Duration,
    ) -> Result<Option<LeasedTask>, CourierError> {
        self.poll_inner(kinds, max_wait, None).await
    }

    /// Like `poll`, but gives up early (with `None`) once `shutdown` changes.
    pub async fn poll_until(
        &self,
        kinds: &KindFilter,
        max_wait: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<LeasedTask>, CourierError> {
        self.poll_inner(kinds, max_wait, Some(shutdown)).await
    }

    async fn poll_inner(
        &self,
        kinds: &KindFilter,
        max_wait: Duration,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Option<LeasedTask>, CourierError> {
        let deadline = Instant::now() + max_wait;
        let lease_duration = self.settings.lease_duration;

        loop {
            if shutdown.as_deref().is_some_and(|rx| *rx.borrow()) {
                return Ok(None);
            }

            // register interest before looking, so a submit between the
            // lease attempt and the wait is not missed
            let notified = self.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self
                .call("lease", || self.store.lease(kinds, lease_duration))
                .await?
            {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(self.settings.poll_interval);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
                _ = stop_signal(shutdown.as_deref_mut()) => return Ok(None),
            }
        }
    }

    pub async fn submit(&self, task: NewTask) -> Result<TaskId, CourierError> {
        self.call("submit", || self.store.submit(task.clone())).await
    }

    pub async fn ack(&self, id: TaskId, token: LeaseToken) -> Result<(), CourierError> {
        self.call("ack", || self.store.ack(id, token)).await
    }

    pub async fn nack(
        &self,
        id: TaskId,
        token: LeaseToken,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), CourierError> {
        self.call("nack", || self.store.nack(id, token, delay, error.clone()))
            .await
    }

    pub async fn deadletter(
        &self,
        id: TaskId,
        token: LeaseToken,
        reason: String,
    ) -> Result<(), CourierError> {
        self.call("deadletter", || self.store.deadletter(id, token, reason.clone()))
            .await
    }

    pub async fn release(&self, id: TaskId, token: LeaseToken) -> Result<(), CourierError> {
        self.call("release", || self.store.release(id, token)).await
    }

    pub async fn reap_expired(&self) -> Result<Vec<TaskId>, CourierError> {
        self.call("reap_expired", || self.store.reap_expired()).await
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, CourierError> {
        self.call("get", || self.store.get(id)).await
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<TaskRecord>, CourierError> {
        self.call("list", || self.store.list(filter)).await
    }

    pub async fn replay(&self, id: TaskId) -> Result<(), CourierError> {
        self.call("replay", || self.store.replay(id)).await
    }

    pub async fn discard(&self, id: TaskId) -> Result<(), CourierError> {
        self.call("discard", || self.store.discard(id)).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, CourierError> {
        self.call("counts", || self.store.counts()).await
    }

    /// One store operation: holds a pool permit per try and retries
    /// connectivity failures within the budget.
    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, CourierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut failures = 0u32;
        loop {
            let result = {
                let _permit = self.pool.acquire().await.map_err(|_| {
                    CourierError::Store(StoreError::Unavailable("connection pool closed".into()))
                })?;
                f().await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if failures > self.settings.store_retry_budget {
                        tracing::error!(
                            op,
                            attempts = failures,
                            error = %err,
                            "store retry budget exhausted"
                        );
                        return Err(CourierError::StoreUnavailable {
                            attempts: failures,
                            source: err,
                        });
                    }
                    tracing::warn!(
                        op,
                        attempt = failures,
                        error = %err,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(self.settings.store_retry_delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Resolves when the shutdown flag changes or its sender goes away. Never
/// resolves without a receiver.
async fn stop_signal(shutdown: Option<&mut watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.changed().await;
        }
        None => std::future::pending().await,
    }
}
