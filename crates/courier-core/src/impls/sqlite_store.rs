//! SqliteTaskStore - SQLite に永続化するストア
//!
//! Every transition is a single conditional `UPDATE`, so the database is the
//! compare-and-swap: a lease only succeeds if the row is still leasable when
//! the statement runs, and ack/nack/deadletter/release only succeed while the
//! caller's token is the live lease. Several processes can share one database
//! file (WAL mode); the idempotency key is a UNIQUE column.
//!
//! Timestamps are stored as microseconds since the epoch so that ordering and
//! visibility checks are plain integer comparisons.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::Notify;

use crate::domain::ids::ParseIdError;
use crate::domain::task::after;
use crate::domain::{
    LeaseInfo, LeaseToken, LeasedTask, NewTask, Priority, QueueCounts, StoreError, TaskId,
    TaskKind, TaskRecord, TaskState,
};
use crate::ports::{Clock, IdGenerator, KindFilter, ListFilter, TaskStore, UlidGenerator};

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "SELECT id, kind, payload, priority, idempotency_key, state, \
     attempt_count, visible_at, lease_token, lease_expires_at, last_error, \
     dead_letter_reason, created_at, last_updated_at FROM tasks";

/// Store backed by a SQLite database file.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    notify: Arc<Notify>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = %path.display(), "sqlite task store opened");
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Self {
            pool,
            clock,
            ids,
            notify: Arc::new(Notify::new()),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Wakes pollers in this process. Other processes notice on their next
    /// poll interval.
    fn wake_pollers(&self) {
        self.notify.notify_waiters();
    }

    /// Why a lease-holding update matched nothing.
    async fn lease_miss(&self, id: TaskId) -> StoreError {
        match self.state_of(id).await {
            Ok(Some(_)) => StoreError::LeaseExpired(id),
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err,
        }
    }

    /// Why a state-guarded admin update matched nothing.
    async fn transition_miss(&self, id: TaskId, to: TaskState) -> StoreError {
        match self.state_of(id).await {
            Ok(Some(from)) => StoreError::InvalidTransition {
                task_id: id,
                from,
                to,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err,
        }
    }

    async fn state_of(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        state.as_deref().map(parse_state).transpose()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn submit(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let id = self.ids.task_id();
        let now = self.now();
        let payload = serde_json::to_string(&task.payload)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, kind, payload, priority, idempotency_key, state, attempt_count,
                visible_at, created_at, last_updated_at
            )
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(task.kind.as_str())
        .bind(payload)
        .bind(priority_rank(task.priority))
        .bind(task.idempotency_key.as_deref())
        .bind(micros(after(now, task.delay)))
        .bind(micros(now))
        .bind(micros(now))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            let existing: String =
                sqlx::query_scalar("SELECT id FROM tasks WHERE idempotency_key = ?")
                    .bind(task.idempotency_key.as_deref())
                    .fetch_one(&self.pool)
                    .await?;
            return Err(StoreError::DuplicateSubmission(parse_id(&existing)?));
        }

        self.wake_pollers();
        Ok(id)
    }

    async fn lease(
        &self,
        kinds: &KindFilter,
        lease_duration: Duration,
    ) -> Result<Option<LeasedTask>, StoreError> {
        let kind_list = match kinds {
            KindFilter::Any => None,
            KindFilter::Only(kinds) if kinds.is_empty() => return Ok(None),
            KindFilter::Only(kinds) => Some(kinds),
        };

        let mut sql = String::from(
            "UPDATE tasks SET state = 'in_flight', attempt_count = attempt_count + 1, \
             lease_token = ?, lease_expires_at = ?, last_updated_at = ? \
             WHERE id = (SELECT id FROM tasks \
             WHERE ((state = 'pending' AND visible_at <= ?) \
             OR (state = 'in_flight' AND lease_expires_at <= ?))",
        );
        if let Some(kinds) = kind_list {
            sql.push_str(" AND kind IN (");
            sql.push_str(&vec!["?"; kinds.len()].join(", "));
            sql.push(')');
        }
        sql.push_str(
            " ORDER BY priority DESC, \
             CASE state WHEN 'in_flight' THEN lease_expires_at ELSE visible_at END ASC, \
             id ASC LIMIT 1) \
             RETURNING id, kind, payload, priority, idempotency_key, state, attempt_count, \
             visible_at, lease_token, lease_expires_at, last_error, dead_letter_reason, \
             created_at, last_updated_at",
        );

        let token = self.ids.lease_token();
        let now = self.now();
        let expires_at = after(now, lease_duration);

        let mut query = sqlx::query(&sql)
            .bind(token.to_string())
            .bind(micros(expires_at))
            .bind(micros(now))
            .bind(micros(now))
            .bind(micros(now));
        for kind in kind_list.into_iter().flatten() {
            query = query.bind(kind.as_str());
        }

        let Some(row) = query.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let task = record_from_row(&row)?;
        if task.attempt_count > 1 {
            tracing::debug!(task_id = %task.id, attempt = task.attempt_count, "task leased again");
        }
        Ok(Some(LeasedTask {
            task,
            token,
            expires_at,
        }))
    }

    async fn ack(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError> {
        let now = micros(self.now());
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'succeeded', lease_token = NULL, lease_expires_at = NULL,
                last_updated_at = ?
            WHERE id = ? AND state = 'in_flight' AND lease_token = ? AND lease_expires_at > ?
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .bind(token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(id).await);
        }
        Ok(())
    }

    async fn nack(
        &self,
        id: TaskId,
        token: LeaseToken,
        delay: Duration,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let now = self.now();
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'pending', lease_token = NULL, lease_expires_at = NULL,
                visible_at = ?, last_error = COALESCE(?, last_error), last_updated_at = ?
            WHERE id = ? AND state = 'in_flight' AND lease_token = ? AND lease_expires_at > ?
            "#,
        )
        .bind(micros(after(now, delay)))
        .bind(error)
        .bind(micros(now))
        .bind(id.to_string())
        .bind(token.to_string())
        .bind(micros(now))
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(id).await);
        }
        self.wake_pollers();
        Ok(())
    }

    async fn deadletter(
        &self,
        id: TaskId,
        token: LeaseToken,
        reason: String,
    ) -> Result<(), StoreError> {
        let now = micros(self.now());
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'dead_lettered', lease_token = NULL, lease_expires_at = NULL,
                dead_letter_reason = ?, last_updated_at = ?
            WHERE id = ? AND state = 'in_flight' AND lease_token = ? AND lease_expires_at > ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id.to_string())
        .bind(token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(id).await);
        }
        Ok(())
    }

    async fn release(&self, id: TaskId, token: LeaseToken) -> Result<(), StoreError> {
        let now = micros(self.now());
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'pending', lease_token = NULL, lease_expires_at = NULL,
                visible_at = ?, last_updated_at = ?
            WHERE id = ? AND state = 'in_flight' AND lease_token = ? AND lease_expires_at > ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .bind(token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(id).await);
        }
        self.wake_pollers();
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError> {
        let now = micros(self.now());
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET state = 'pending', lease_token = NULL, lease_expires_at = NULL,
                visible_at = ?, last_updated_at = ?
            WHERE state = 'in_flight' AND lease_expires_at <= ?
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let reaped = ids
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        if !reaped.is_empty() {
            self.wake_pollers();
        }
        Ok(reaped)
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        record_from_row(&row)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let state = filter.state.map(|s| s.to_string());
        let kind = filter.kind.as_ref().map(TaskKind::as_str);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR kind = ?2) \
             ORDER BY id"
        ))
        .bind(state)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn replay(&self, id: TaskId) -> Result<(), StoreError> {
        let now = micros(self.now());
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'pending', attempt_count = 0, visible_at = ?, lease_token = NULL,
                lease_expires_at = NULL, dead_letter_reason = NULL, last_updated_at = ?
            WHERE id = ? AND state IN ('dead_lettered', 'failed')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.transition_miss(id, TaskState::Pending).await);
        }
        self.wake_pollers();
        Ok(())
    }

    async fn discard(&self, id: TaskId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE tasks SET state = 'failed', last_updated_at = ? \
             WHERE id = ? AND state = 'dead_lettered'",
        )
        .bind(micros(self.now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.transition_miss(id, TaskState::Failed).await);
        }
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            let n = usize::try_from(n).map_err(|_| StoreError::Corrupt(format!("count {n}")))?;
            counts.add(parse_state(&state)?, n);
        }
        Ok(counts)
    }

    fn changes(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.notify))
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(column: &str, value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn priority_rank(priority: Priority) -> i64 {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
    }
}

fn parse_priority(rank: i64) -> Result<Priority, StoreError> {
    match rank {
        0 => Ok(Priority::Low),
        1 => Ok(Priority::Normal),
        2 => Ok(Priority::High),
        other => Err(StoreError::Corrupt(format!("unknown priority {other}"))),
    }
}

fn parse_state(s: &str) -> Result<TaskState, StoreError> {
    match s {
        "pending" => Ok(TaskState::Pending),
        "in_flight" => Ok(TaskState::InFlight),
        "succeeded" => Ok(TaskState::Succeeded),
        "failed" => Ok(TaskState::Failed),
        "dead_lettered" => Ok(TaskState::DeadLettered),
        other => Err(StoreError::Corrupt(format!("unknown state '{other}'"))),
    }
}

fn parse_id<T: FromStr<Err = ParseIdError>>(s: &str) -> Result<T, StoreError> {
    s.parse().map_err(|e: ParseIdError| StoreError::Corrupt(e.to_string()))
}

fn record_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let lease = match (
        row.try_get::<Option<String>, _>("lease_token")?,
        row.try_get::<Option<i64>, _>("lease_expires_at")?,
    ) {
        (Some(token), Some(expires_at)) => Some(LeaseInfo {
            token: parse_id(&token)?,
            expires_at: from_micros("lease_expires_at", expires_at)?,
        }),
        _ => None,
    };
    let attempt_count = row.try_get::<i64, _>("attempt_count")?;

    Ok(TaskRecord {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        kind: TaskKind::new(row.try_get::<String, _>("kind")?),
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
        priority: parse_priority(row.try_get("priority")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        state: parse_state(&row.try_get::<String, _>("state")?)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("attempt_count {attempt_count}")))?,
        visible_at: from_micros("visible_at", row.try_get("visible_at")?)?,
        lease,
        last_error: row.try_get("last_error")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
        created_at: from_micros("created_at", row.try_get("created_at")?)?,
        last_updated_at: from_micros("last_updated_at", row.try_get("last_updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::TimeZone;
    use std::path::PathBuf;

    const LEASE: Duration = Duration::from_secs(30);

    fn notify(payload: serde_json::Value) -> NewTask {
        NewTask::new("notify", payload)
    }

    fn db_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("courier.db")
    }

    async fn manual_store(dir: &tempfile::TempDir) -> (SqliteTaskStore, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = SqliteTaskStore::open(db_path(dir), clock.clone()).await.unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn submit_lease_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = manual_store(&dir).await;
        let id = store
            .submit(notify(serde_json::json!({"to": "a"})).with_priority(Priority::High))
            .await
            .unwrap();

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id(), id);
        assert_eq!(leased.attempt_count(), 1);
        assert_eq!(leased.task.payload, serde_json::json!({"to": "a"}));
        assert_eq!(leased.task.priority, Priority::High);
        assert_eq!(leased.task.lease.map(|l| l.token), Some(leased.token));
        assert!(store.lease(&KindFilter::Any, LEASE).await.unwrap().is_none());

        store.ack(id, leased.token).await.unwrap();
        let row = store.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::Succeeded);
        assert!(row.lease.is_none());
    }

    #[tokio::test]
    async fn rows_written_by_one_handle_survive_another_handles_writes() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
            .await
            .unwrap();
        let runner = SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
            .await
            .unwrap();

        let first = submitter.submit(notify(serde_json::json!({"n": 1}))).await.unwrap();
        let leased = runner.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id(), first);

        // submitted after the runner's write; must not be overwritten by it
        let second = submitter.submit(notify(serde_json::json!({"n": 2}))).await.unwrap();
        runner.ack(first, leased.token).await.unwrap();

        let again = runner.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id(), second);

        let counts = submitter.counts().await.unwrap();
        assert_eq!((counts.succeeded, counts.in_flight), (1, 1));
        assert_eq!(
            submitter.get(second).await.unwrap().state,
            TaskState::InFlight
        );
    }

    #[tokio::test]
    async fn idempotency_key_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
            .await
            .unwrap();
        let b = SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
            .await
            .unwrap();

        let first = a
            .submit(notify(serde_json::json!({})).with_idempotency_key("order-42"))
            .await
            .unwrap();
        let second = b
            .submit(notify(serde_json::json!({})).with_idempotency_key("order-42"))
            .await;

        assert!(matches!(second, Err(StoreError::DuplicateSubmission(id)) if id == first));
        assert_eq!(a.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn leases_racing_across_handles_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(
            SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
                .await
                .unwrap(),
        );
        let b = Arc::new(
            SqliteTaskStore::open(db_path(&dir), Arc::new(SystemClock))
                .await
                .unwrap(),
        );
        a.submit(notify(serde_json::json!({}))).await.unwrap();

        let mut joins = Vec::new();
        for i in 0..16 {
            let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
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
    async fn rows_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (store, _) = manual_store(&dir).await;
            let id = store.submit(notify(serde_json::json!({"k": 1}))).await.unwrap();
            let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
            store.deadletter(id, leased.token, "bad".into()).await.unwrap();
            id
        };

        let (reopened, _) = manual_store(&dir).await;
        let row = reopened.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::DeadLettered);
        assert_eq!(row.dead_letter_reason.as_deref(), Some("bad"));
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(dir.path().join("nested/tasks.db"), Arc::new(SystemClock))
            .await
            .unwrap();
        store.submit(notify(serde_json::json!({}))).await.unwrap();
        assert!(dir.path().join("nested/tasks.db").exists());
    }

    #[tokio::test]
    async fn nack_hides_the_row_and_keeps_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = manual_store(&dir).await;
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
        assert_eq!(again.attempt_count(), 2);
        assert_eq!(again.task.last_error.as_deref(), Some("flaky"));

        // a nack without an error keeps the previous one
        store.nack(id, again.token, Duration::ZERO, None).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().last_error.as_deref(), Some("flaky"));
    }

    #[tokio::test]
    async fn stale_and_expired_tokens_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = manual_store(&dir).await;
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();
        let first = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();

        clock.advance(LEASE);
        assert!(matches!(
            store.nack(id, first.token, Duration::ZERO, None).await,
            Err(StoreError::LeaseExpired(x)) if x == id
        ));

        let second = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.attempt_count(), 2);
        assert!(matches!(
            store.ack(id, first.token).await,
            Err(StoreError::LeaseExpired(_))
        ));
        store.ack(id, second.token).await.unwrap();

        let missing = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            store.release(missing, second.token).await,
            Err(StoreError::NotFound(x)) if x == missing
        ));
    }

    #[tokio::test]
    async fn lease_order_and_kind_filter() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = manual_store(&dir).await;
        store
            .submit(notify(serde_json::json!({})).with_priority(Priority::Low))
            .await
            .unwrap();
        let high = store
            .submit(notify(serde_json::json!({})).with_priority(Priority::High))
            .await
            .unwrap();
        let resize = store
            .submit(NewTask::new("resize", serde_json::json!({})))
            .await
            .unwrap();

        let filter = KindFilter::only([TaskKind::new("resize")]);
        assert_eq!(store.lease(&filter, LEASE).await.unwrap().unwrap().id(), resize);
        assert!(store.lease(&filter, LEASE).await.unwrap().is_none());
        assert!(store.lease(&KindFilter::only([]), LEASE).await.unwrap().is_none());

        assert_eq!(store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap().id(), high);
    }

    #[tokio::test]
    async fn reap_release_and_admin_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = manual_store(&dir).await;
        let id = store.submit(notify(serde_json::json!({}))).await.unwrap();

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        store.release(id, leased.token).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().attempt_count, 1);

        store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        assert!(store.reap_expired().await.unwrap().is_empty());
        clock.advance(LEASE);
        assert_eq!(store.reap_expired().await.unwrap(), vec![id]);
        assert_eq!(store.get(id).await.unwrap().state, TaskState::Pending);

        assert!(matches!(
            store.replay(id).await,
            Err(StoreError::InvalidTransition { from: TaskState::Pending, .. })
        ));

        let leased = store.lease(&KindFilter::Any, LEASE).await.unwrap().unwrap();
        store.deadletter(id, leased.token, "bad".into()).await.unwrap();
        let dead = store
            .list(&ListFilter::state(TaskState::DeadLettered).with_kind(Some("notify".into())))
            .await
            .unwrap();
        assert_eq!(dead.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id]);

        store.discard(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().state, TaskState::Failed);
        assert_eq!(store.counts().await.unwrap().failed, 1);

        store.replay(id).await.unwrap();
        let row = store.get(id).await.unwrap();
        assert_eq!((row.state, row.attempt_count), (TaskState::Pending, 0));
        assert!(row.dead_letter_reason.is_none());
    }
}
