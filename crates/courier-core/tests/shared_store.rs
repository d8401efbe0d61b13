//! Two apps on one SQLite file, the way `courier submit` and `courier run`
//! share a database. Runs on the real clock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::domain::{HandlerError, Outcome, TaskId, TaskRecord, TaskState};
use courier_core::impls::{RecordingChannel, SqliteTaskStore};
use courier_core::ports::SystemClock;
use courier_core::typed::{Handler, Task, TaskContext};
use courier_core::{App, AppBuilder, CourierConfig};

#[derive(Debug, Serialize, Deserialize)]
struct Notify {
    target: String,
    text: String,
}

impl Task for Notify {
    const KIND: &'static str = "notify";
}

struct NotifyHandler;

#[async_trait]
impl Handler<Notify> for NotifyHandler {
    async fn handle(&self, _ctx: TaskContext, task: Notify) -> Result<Outcome, HandlerError> {
        if task.target.is_empty() {
            return Err(HandlerError::permanent("empty target"));
        }
        Ok(Outcome::success().with_message(task.target, task.text))
    }
}

fn config() -> CourierConfig {
    CourierConfig {
        worker_concurrency: 2,
        poll_wait: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        reap_interval: Duration::from_secs(1),
        ..CourierConfig::default()
    }
}

async fn app_on(path: &Path, channel: Arc<RecordingChannel>) -> App {
    let store = SqliteTaskStore::open(path, Arc::new(SystemClock))
        .await
        .unwrap();
    AppBuilder::new(config())
        .with_store(Arc::new(store))
        .with_channel(channel)
        .register::<Notify, _>(NotifyHandler)
        .unwrap()
        .build()
        .unwrap()
}

async fn wait_for_state(app: &App, id: TaskId, state: TaskState) -> TaskRecord {
    for _ in 0..500 {
        let row = app.admin().get_task(id).await.unwrap();
        if row.state == state {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached {state:?}");
}

fn notify(target: &str, text: &str) -> Notify {
    Notify {
        target: target.into(),
        text: text.into(),
    }
}

#[tokio::test]
async fn tasks_submitted_by_one_app_are_run_by_another() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("courier.db");
    let channel = Arc::new(RecordingChannel::new());
    let submitter = app_on(&path, Arc::new(RecordingChannel::new())).await;
    let runner = app_on(&path, channel.clone()).await;

    let orchestrator = runner.start();

    let first = submitter.producer().submit_typed(&notify("chat-1", "one")).await.unwrap();
    wait_for_state(&submitter, first, TaskState::Succeeded).await;

    // submitted while the runner is writing; nothing it writes may drop this
    let second = submitter.producer().submit_typed(&notify("chat-2", "two")).await.unwrap();
    let doomed = submitter.producer().submit_typed(&notify("", "nowhere")).await.unwrap();
    wait_for_state(&submitter, second, TaskState::Succeeded).await;
    let dead = wait_for_state(&submitter, doomed, TaskState::DeadLettered).await;
    assert_eq!(dead.dead_letter_reason.as_deref(), Some("empty target"));

    orchestrator.shutdown().await;

    let mut sent: Vec<String> = channel.sent().await.into_iter().map(|m| m.message).collect();
    sent.sort();
    assert_eq!(sent, vec!["one", "two"]);

    let counts = submitter.admin().counts().await.unwrap();
    assert_eq!((counts.succeeded, counts.dead_lettered), (2, 1));
}

#[tokio::test]
async fn idempotency_and_replay_cross_apps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("courier.db");
    let a = app_on(&path, Arc::new(RecordingChannel::new())).await;
    let b = app_on(&path, Arc::new(RecordingChannel::new())).await;

    let first = a
        .producer()
        .submit_typed_with_key(&notify("", "x"), "order-42")
        .await
        .unwrap();
    let again = b
        .producer()
        .submit_typed_with_key(&notify("", "x"), "order-42")
        .await
        .unwrap();
    assert_eq!(first, again);

    let orchestrator = b.start();
    wait_for_state(&a, first, TaskState::DeadLettered).await;
    orchestrator.shutdown().await;

    a.admin().replay(first).await.unwrap();
    let row = b.admin().get_task(first).await.unwrap();
    assert_eq!((row.state, row.attempt_count), (TaskState::Pending, 0));
}
