//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. Broker::poll_until() で lease 取得（bounded wait、shutdown で中断）
//! 2. handler を別 task で実行（timeout 付き、panic は transient 扱い）
//! 3. 成功: Outcome のメッセージを DispatchGateway へ → ack
//! 4. 失敗: Decider → nack / deadletter
//!
//! Handlers run in their own tokio task. A panic surfaces as a `JoinError`
//! and becomes a transient failure; a handler that overruns
//! `handler_timeout` is abandoned (not killed) and its lease left to expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::app::gateway::{DispatchError, DispatchGateway};
use crate::domain::{
    CourierError, Decider, Decision, HandlerError, LeaseToken, LeasedTask, Outcome, TaskId,
};
use crate::queue::Broker;
use crate::typed::{TaskContext, TypedRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub handler_timeout: Duration,
    pub poll_wait: Duration,
    /// Deliveries allowed before a task that keeps losing its lease is
    /// dead-lettered without running the handler.
    pub max_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(20),
            poll_wait: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Leases currently held by this process's workers.
///
/// Shutdown releases whatever is still in here after the drain timeout.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    leases: Arc<Mutex<HashMap<TaskId, LeaseToken>>>,
}

impl InFlight {
    async fn insert(&self, id: TaskId, token: LeaseToken) {
        self.leases.lock().await.insert(id, token);
    }

    async fn remove(&self, id: TaskId) {
        self.leases.lock().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn take_all(&self) -> Vec<(TaskId, LeaseToken)> {
        self.leases.lock().await.drain().collect()
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub broker: Arc<Broker>,
    pub registry: Arc<TypedRegistry>,
    pub decider: Arc<dyn Decider>,
    pub gateway: Arc<DispatchGateway>,
    pub settings: WorkerSettings,
    /// Fatal errors go here; the orchestrator halts on the first one.
    pub fatal_tx: mpsc::UnboundedSender<CourierError>,
}

/// What graceful shutdown had to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that finished within the drain timeout.
    pub drained: usize,
    /// Workers still busy at the deadline, abandoned.
    pub abandoned: usize,
    /// Leases handed back to the store.
    pub released: Vec<TaskId>,
}

/// Worker group handle.
/// - `request_shutdown()` で新規 poll を止める
/// - `shutdown()` で drain → abandon → lease 解放
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    in_flight: InFlight,
    broker: Arc<Broker>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, ctx: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = InFlight::default();

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctx = Arc::clone(&ctx);
            let in_flight = in_flight.clone();
            let rx = shutdown_rx.clone();

            let span = tracing::info_span!("worker", worker_id);
            joins.push(tokio::spawn(worker_loop(ctx, in_flight, rx).instrument(span)));
        }
        tracing::info!(workers = n, "worker pool started");

        Self {
            shutdown_tx,
            joins,
            in_flight,
            broker: Arc::clone(&ctx.broker),
        }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Stop taking new leases. Handlers already running carry on.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop polling, give in-flight work up to `drain_timeout` to finish,
    /// abandon what is left and release its leases so another process can
    /// pick the tasks up right away.
    pub async fn shutdown(self, drain_timeout: Duration) -> ShutdownReport {
        self.request_shutdown();
        let deadline = Instant::now() + drain_timeout;

        let mut report = ShutdownReport::default();
        for mut join in self.joins {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(_) => report.drained += 1,
                Err(_) => {
                    join.abort();
                    report.abandoned += 1;
                }
            }
        }

        for (id, token) in self.in_flight.take_all().await {
            match self.broker.release(id, token).await {
                Ok(()) => report.released.push(id),
                // finished (or lost the lease) after all
                Err(CourierError::LeaseExpired(_)) => {}
                Err(err) => tracing::error!(task_id = %id, error = %err, "failed to release lease"),
            }
        }

        tracing::info!(
            drained = report.drained,
            abandoned = report.abandoned,
            released = report.released.len(),
            "worker pool stopped"
        );
        report
    }
}

async fn worker_loop(
    ctx: Arc<WorkerContext>,
    in_flight: InFlight,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let kinds = ctx.registry.kind_filter();

    loop {
        // shutdown が来ていたら抜ける（sender が drop されても同じ）
        if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
            break;
        }

        let leased = match ctx
            .broker
            .poll_until(&kinds, ctx.settings.poll_wait, &mut shutdown_rx)
            .await
        {
            Ok(Some(leased)) => leased,
            Ok(None) => continue,
            Err(err) if err.is_fatal() => {
                let _ = ctx.fatal_tx.send(err);
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "poll failed");
                tokio::time::sleep(ctx.settings.poll_wait).await;
                continue;
            }
        };

        let id = leased.id();
        in_flight.insert(id, leased.token).await;
        let span = tracing::info_span!(
            "task",
            task_id = %id,
            kind = %leased.kind(),
            attempt = leased.attempt_count()
        );
        let result = process(&ctx, leased).instrument(span).await;
        in_flight.remove(id).await;

        if let Err(err) = result {
            let _ = ctx.fatal_tx.send(err);
            break;
        }
    }
}

/// Run one leased task to a store transition. Only fatal errors escape.
async fn process(ctx: &WorkerContext, leased: LeasedTask) -> Result<(), CourierError> {
    let attempt = leased.attempt_count();

    // only reachable by repeatedly losing the lease (crash, timeout)
    if attempt > ctx.settings.max_attempts {
        let reason = format!(
            "lease lost on every attempt ({}/{})",
            attempt - 1,
            ctx.settings.max_attempts
        );
        tracing::error!(%reason, "dead-lettering without running handler");
        let result = ctx
            .broker
            .deadletter(leased.id(), leased.token, reason)
            .await;
        return settle(result, "deadletter");
    }

    let Some(handler) = ctx.registry.get(leased.kind()) else {
        let reason = format!("no handler registered for kind '{}'", leased.kind());
        tracing::error!(%reason, "dead-lettering");
        let result = ctx
            .broker
            .deadletter(leased.id(), leased.token, reason)
            .await;
        return settle(result, "deadletter");
    };

    let task_ctx = TaskContext {
        task_id: leased.id(),
        kind: leased.kind().clone(),
        attempt,
    };
    let payload = leased.task.payload.clone();
    let run = tokio::spawn(async move { handler.handle_dyn(task_ctx, payload).await });

    let result = match tokio::time::timeout(ctx.settings.handler_timeout, run).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(HandlerError::transient(format!("handler panicked: {}", panic_message(join_err))))
        }
        Ok(Err(join_err)) => Err(HandlerError::transient(format!("handler cancelled: {join_err}"))),
        Err(_) => {
            // the handler keeps running detached; the lease expires on its own
            tracing::warn!(
                timeout = ?ctx.settings.handler_timeout,
                "handler timed out, abandoning it and letting the lease expire"
            );
            return Ok(());
        }
    };

    match result {
        Ok(outcome) => complete(ctx, &leased, outcome).await,
        Err(failure) => fail(ctx, &leased, failure).await,
    }
}

/// Deliver the handler's messages, then ack. Messages go out before the ack:
/// a crash in between means a redelivery (and a duplicate send), never a
/// lost message.
async fn complete(
    ctx: &WorkerContext,
    leased: &LeasedTask,
    outcome: Outcome,
) -> Result<(), CourierError> {
    for (index, message) in outcome.messages.iter().enumerate() {
        if let Err(err) = ctx.gateway.send_for(leased.id(), index, message).await {
            let failure = match err {
                DispatchError::Courier(err) if err.is_fatal() => return Err(err),
                err => crate::app::gateway::classify(err),
            };
            tracing::warn!(error = %failure, index, "outbound send failed");
            return fail(ctx, leased, failure).await;
        }
    }

    let result = ctx.broker.ack(leased.id(), leased.token).await;
    if result.is_ok() {
        tracing::info!(messages = outcome.messages.len(), "task succeeded");
    }
    settle(result, "ack")
}

async fn fail(
    ctx: &WorkerContext,
    leased: &LeasedTask,
    failure: HandlerError,
) -> Result<(), CourierError> {
    match ctx.decider.decide(&leased.task, &failure) {
        Decision::Retry { delay, reason } => {
            tracing::warn!(error = %failure, ?delay, "task failed, retrying");
            let result = ctx
                .broker
                .nack(leased.id(), leased.token, delay, Some(reason))
                .await;
            settle(result, "nack")
        }
        Decision::DeadLetter { reason } => {
            tracing::error!(%reason, "task dead-lettered");
            let result = ctx
                .broker
                .deadletter(leased.id(), leased.token, reason)
                .await;
            settle(result, "deadletter")
        }
    }
}

/// A lost lease is expected under at-least-once delivery: someone else owns
/// the task now and this worker's result is not authoritative.
fn settle(result: Result<(), CourierError>, op: &'static str) -> Result<(), CourierError> {
    match result {
        Ok(()) => Ok(()),
        Err(CourierError::LeaseExpired(_)) => {
            tracing::warn!(op, "lease lost before the result was recorded");
            Ok(())
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(op, error = %err, "could not record task result");
            Ok(())
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
