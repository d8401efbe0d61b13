//! ReaperLoop - Lease 期限切れの回収
//!
//! `lease()` already reclaims lapsed rows it comes across, but only for the
//! kinds being polled. The reaper sweeps every kind on a fixed interval so
//! `Status` and the dead-letter view never show stale InFlight rows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::CourierError;
use crate::queue::Broker;

pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(
        broker: Arc<Broker>,
        interval: Duration,
        fatal_tx: mpsc::UnboundedSender<CourierError>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(reaper_loop(broker, interval, fatal_tx, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

async fn reaper_loop(
    broker: Arc<Broker>,
    interval: Duration,
    fatal_tx: mpsc::UnboundedSender<CourierError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        match broker.reap_expired().await {
            Ok(reaped) if reaped.is_empty() => {}
            Ok(reaped) => {
                tracing::info!(count = reaped.len(), "reclaimed expired leases");
                for id in &reaped {
                    tracing::debug!(task_id = %id, "lease expired, task back to pending");
                }
            }
            Err(err) if err.is_fatal() => {
                let _ = fatal_tx.send(err);
                break;
            }
            Err(err) => tracing::warn!(error = %err, "reap failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskState};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{KindFilter, ManualClock};
    use crate::queue::BrokerSettings;
    use chrono::{TimeZone, Utc};

    #[tokio::test(start_paused = true)]
    async fn returns_expired_leases_to_pending() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let broker = Arc::new(Broker::new(
            store,
            BrokerSettings {
                lease_duration: Duration::from_secs(10),
                ..BrokerSettings::default()
            },
        ));
        let id = broker
            .submit(NewTask::new("notify", serde_json::json!({})))
            .await
            .unwrap();
        broker
            .poll(&KindFilter::Any, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let reaper = ReaperLoop::spawn(Arc::clone(&broker), Duration::from_secs(1), fatal_tx);

        clock.advance(Duration::from_secs(11));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(broker.get(id).await.unwrap().state, TaskState::Pending);
        reaper.stop().await;
    }
}
