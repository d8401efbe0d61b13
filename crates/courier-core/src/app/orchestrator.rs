//! Orchestrator - 実行中のワーカー群と reaper の持ち主
//!
//! Runs until a shutdown signal or the first fatal error (store unreachable
//! beyond the retry budget), then shuts down gracefully either way: stop
//! polling, drain up to `drain_timeout`, release the leases still held.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::app::reaper_loop::ReaperLoop;
use crate::app::worker_loop::{InFlight, ShutdownReport, WorkerPool};
use crate::domain::CourierError;

pub struct Orchestrator {
    pool: WorkerPool,
    reaper: ReaperLoop,
    fatal_rx: mpsc::UnboundedReceiver<CourierError>,
    drain_timeout: Duration,
}

impl Orchestrator {
    pub(crate) fn new(
        pool: WorkerPool,
        reaper: ReaperLoop,
        fatal_rx: mpsc::UnboundedReceiver<CourierError>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            reaper,
            fatal_rx,
            drain_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    pub fn in_flight(&self) -> &InFlight {
        self.pool.in_flight()
    }

    /// Block until `signal` resolves (e.g. Ctrl-C) or a fatal error is
    /// reported, then shut down. A fatal error is returned after the
    /// shutdown so the process can exit non-zero.
    pub async fn run_until<F>(mut self, signal: F) -> Result<ShutdownReport, CourierError>
    where
        F: Future<Output = ()>,
    {
        let fatal = tokio::select! {
            _ = signal => None,
            Some(err) = self.fatal_rx.recv() => Some(err),
        };

        match &fatal {
            None => tracing::info!("shutdown requested"),
            Some(err) => tracing::error!(error = %err, "fatal error, halting"),
        }

        let report = self.shutdown().await;
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!(drain_timeout = ?self.drain_timeout, "draining workers");
        self.reaper.stop().await;
        self.pool.shutdown(self.drain_timeout).await
    }
}
