use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::task::{LogEntry, Task, TaskLogRow};

use super::{Result, StoreError};

/// SQLite-backed store for tasks and their attempt log.
///
/// All scheduling queries compare RFC 3339 TEXT timestamps; a single writer
/// produces them in a fixed-width format, so string order is time order.
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = database_url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5000));

        // An in-memory SQLite database exists per connection, so the pool
        // must pin one connection and never retire it.
        let memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool, for application tables that live next to the
    /// task tables.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                status        TEXT,
                queue         TEXT NOT NULL,
                created       TEXT NOT NULL,
                modified      TEXT NOT NULL,
                execute_after TEXT NOT NULL,
                failing_since TEXT,
                in_progress   INTEGER NOT NULL DEFAULT 0,
                version       INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_queue_ready
            ON tasks(queue, in_progress, execute_after)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_logs (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id           INTEGER NOT NULL REFERENCES tasks(id),
                created           TEXT NOT NULL,
                status_before     TEXT,
                status_after      TEXT,
                exception_type    TEXT,
                exception_message TEXT,
                extra_json        TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_logs_task
            ON task_logs(task_id, created)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a new task in the given status, due immediately.
    pub async fn insert(&self, status: &str) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        self.insert_in(&mut conn, status).await
    }

    /// Like [`insert`](Self::insert), but on a caller-owned connection or
    /// transaction, so a task and the row it tracks become visible together.
    pub async fn insert_in(&self, conn: &mut SqliteConnection, status: &str) -> Result<Task> {
        if status.is_empty() {
            return Err(StoreError::EmptyStatus);
        }
        let now = now_micros();
        let now_str = fmt_ts(now);

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (status, queue, created, modified, execute_after, failing_since, in_progress, version)
            VALUES (?, ?, ?, ?, ?, NULL, 0, 0)
            RETURNING id
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(&now_str)
        .bind(&now_str)
        .bind(&now_str)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Task {
            id: row.try_get("id")?,
            status: Some(status.to_string()),
            queue: status.to_string(),
            created: now,
            modified: now,
            execute_after: now,
            failing_since: None,
            in_progress: false,
            version: 0,
        })
    }

    /// Claims the oldest due task in `queue`, if any.
    pub async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        // Single-statement claim: the inner SELECT and the flag flip are
        // atomic, so two workers can never receive the same task.
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET in_progress = 1
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = ? AND status IS NOT NULL AND in_progress = 0 AND execute_after <= ?
                ORDER BY execute_after ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(fmt_ts(now))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_task(row)?)),
            None => Ok(None),
        }
    }

    /// Writes back every mutable field, bumps the version and releases the
    /// claim. The caller's copy is updated to match what was persisted.
    pub async fn save(&self, conn: &mut SqliteConnection, task: &mut Task) -> Result<()> {
        let queue = task.status.clone().unwrap_or_default();
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, queue = ?, modified = ?, execute_after = ?, failing_since = ?,
                in_progress = 0, version = version + 1
            WHERE id = ?
            RETURNING version
            "#,
        )
        .bind(&task.status)
        .bind(&queue)
        .bind(fmt_ts(task.modified))
        .bind(fmt_ts(task.execute_after))
        .bind(task.failing_since.map(fmt_ts))
        .bind(task.id)
        .fetch_one(&mut *conn)
        .await?;

        task.queue = queue;
        task.in_progress = false;
        task.version = row.try_get("version")?;
        Ok(())
    }

    /// Releases the claim without touching anything else. Used when a task
    /// cannot be dispatched (no handler for its status).
    pub async fn release(&self, task: &mut Task) -> Result<()> {
        sqlx::query("UPDATE tasks SET in_progress = 0 WHERE id = ?")
            .bind(task.id)
            .execute(&self.pool)
            .await?;
        task.in_progress = false;
        Ok(())
    }

    /// Releases a claim that outlived its advance (store error after the
    /// claim) and pushes the task out to `execute_after` so the next poll
    /// does not spin on the same error. A claim already released by a
    /// committed save is left alone.
    pub(crate) async fn release_delayed(
        &self,
        id: i64,
        execute_after: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET in_progress = 0, execute_after = ? WHERE id = ? AND in_progress = 1",
        )
        .bind(fmt_ts(execute_after))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_task(row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn append_log(
        &self,
        conn: &mut SqliteConnection,
        entry: &LogEntry,
    ) -> Result<()> {
        let extra_json = entry
            .extra_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO task_logs (task_id, created, status_before, status_after, exception_type, exception_message, extra_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.task_id)
        .bind(fmt_ts(now_micros()))
        .bind(&entry.status_before)
        .bind(&entry.status_after)
        .bind(&entry.exception_type)
        .bind(&entry.exception_message)
        .bind(extra_json)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Queues that still hold at least one unfinished task. Claimed tasks
    /// count: their queue stays live until they finish or move on.
    pub async fn distinct_queues(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT queue FROM tasks WHERE status IS NOT NULL ORDER BY queue")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| row.try_get("queue").map_err(StoreError::from))
            .collect()
    }

    /// The `extra_json` of the most recent failing attempt, if any.
    pub async fn last_failure_extra_json(&self, task_id: i64) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT extra_json FROM task_logs
            WHERE exception_type IS NOT NULL AND task_id = ?
            ORDER BY created DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.try_get("extra_json")?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Full attempt history of a task, oldest first.
    pub async fn logs(&self, task_id: i64) -> Result<Vec<TaskLogRow>> {
        let rows =
            sqlx::query("SELECT * FROM task_logs WHERE task_id = ? ORDER BY created ASC, id ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|row| self.row_to_log(row)).collect()
    }

    /// Clears leftover claims from a previous run. The engine is a
    /// single-process runtime, so at startup any set flag is a crash
    /// leftover, never a live claim.
    pub async fn recover_in_progress(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE tasks SET in_progress = 0 WHERE in_progress = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Opens a transaction on the pool. The dispatcher brackets every
    /// completion in one (attachment unload, task save, log append);
    /// applications can use it to insert a task alongside their own rows.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    fn row_to_task(&self, row: SqliteRow) -> Result<Task> {
        let status: Option<String> = row.try_get("status")?;
        let queue: String = row.try_get("queue")?;
        let created: String = row.try_get("created")?;
        let modified: String = row.try_get("modified")?;
        let execute_after: String = row.try_get("execute_after")?;
        let failing_since: Option<String> = row.try_get("failing_since")?;

        Ok(Task {
            id: row.try_get("id")?,
            status,
            queue,
            created: parse_ts("created", &created)?,
            modified: parse_ts("modified", &modified)?,
            execute_after: parse_ts("execute_after", &execute_after)?,
            failing_since: failing_since
                .as_deref()
                .map(|value| parse_ts("failing_since", value))
                .transpose()?,
            in_progress: row.try_get("in_progress")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_log(&self, row: SqliteRow) -> Result<TaskLogRow> {
        let created: String = row.try_get("created")?;
        let extra_json: Option<String> = row.try_get("extra_json")?;

        Ok(TaskLogRow {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            created: parse_ts("created", &created)?,
            status_before: row.try_get("status_before")?,
            status_after: row.try_get("status_after")?,
            exception_type: row.try_get("exception_type")?,
            exception_message: row.try_get("exception_message")?,
            extra_json: extra_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

/// Current time truncated to the microsecond precision of the timestamp
/// columns, so values survive a round trip unchanged.
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

// Fixed width keeps string comparison in SQL consistent with time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_ts(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp {
            column,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn store() -> TaskStore {
        TaskStore::connect("sqlite::memory:").await.unwrap()
    }

    fn failure_entry(task_id: i64, extra_json: serde_json::Value) -> LogEntry {
        LogEntry {
            task_id,
            status_before: Some("A".to_string()),
            status_after: Some("A".to_string()),
            exception_type: Some("HandlerError".to_string()),
            exception_message: Some("boom".to_string()),
            extra_json: Some(extra_json),
        }
    }

    #[tokio::test]
    async fn insert_round_trips_through_load() {
        let store = store().await;
        let task = store.insert("New order created").await.unwrap();
        assert!(task.id >= 1);
        assert_eq!(task.queue, "New order created");
        assert_eq!(task.version, 0);
        assert!(!task.in_progress);
        assert_eq!(task.created, task.modified);
        assert_eq!(task.created, task.execute_after);

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(store.load(task.id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_an_empty_status() {
        let store = store().await;
        assert!(matches!(
            store.insert("").await,
            Err(StoreError::EmptyStatus)
        ));
    }

    #[tokio::test]
    async fn claim_takes_the_oldest_due_task_and_marks_it() {
        let store = store().await;
        let first = store.insert("A").await.unwrap();
        let second = store.insert("A").await.unwrap();

        let now = now_micros();
        let claimed = store.claim_next("A", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(claimed.in_progress);

        let claimed = store.claim_next("A", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next("A", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_terminal_future_held_and_foreign_tasks() {
        let store = store().await;
        let now = now_micros();

        // status nulled out-of-band, queue column left stale
        let hollow = store.insert("T").await.unwrap();
        sqlx::query("UPDATE tasks SET status = NULL WHERE id = ?")
            .bind(hollow.id)
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.claim_next("T", now).await.unwrap().is_none());

        let parked = store.insert("F").await.unwrap();
        sqlx::query("UPDATE tasks SET execute_after = ? WHERE id = ?")
            .bind(fmt_ts(now + chrono::Duration::seconds(60)))
            .bind(parked.id)
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.claim_next("F", now).await.unwrap().is_none());
        assert!(store
            .claim_next("F", now + chrono::Duration::seconds(61))
            .await
            .unwrap()
            .is_some());

        store.insert("H").await.unwrap();
        assert!(store.claim_next("H", now).await.unwrap().is_some());
        assert!(store.claim_next("H", now).await.unwrap().is_none());

        store.insert("A").await.unwrap();
        assert!(store.claim_next("Z", now).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_a_task_once() {
        let store = Arc::new(store().await);
        store.insert("A").await.unwrap();
        let now = now_micros();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_next("A", now).await.unwrap()
            }));
        }

        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn save_persists_fields_bumps_version_and_releases() {
        let store = store().await;
        store.insert("A").await.unwrap();
        let mut task = store.claim_next("A", now_micros()).await.unwrap().unwrap();

        task.set_status("B");
        task.modified = now_micros();
        task.execute_after = task.modified + chrono::Duration::seconds(5);
        task.failing_since = Some(task.modified);

        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &mut task).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(task.version, 1);
        assert_eq!(task.queue, "B");
        assert!(!task.in_progress);

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn finishing_a_task_clears_status_and_queue() {
        let store = store().await;
        store.insert("A").await.unwrap();
        let mut task = store.claim_next("A", now_micros()).await.unwrap().unwrap();

        task.finish();
        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &mut task).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), None);
        assert_eq!(loaded.queue, "");
        assert!(store.distinct_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_save_rolls_back_but_the_claim_stays() {
        let store = store().await;
        store.insert("A").await.unwrap();
        let mut task = store.claim_next("A", now_micros()).await.unwrap().unwrap();

        task.set_status("B");
        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &mut task).await.unwrap();
        tx.rollback().await.unwrap();

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), Some("A"));
        assert_eq!(loaded.version, 0);
        assert!(loaded.in_progress);
    }

    #[tokio::test]
    async fn release_clears_the_claim_without_a_version_bump() {
        let store = store().await;
        store.insert("A").await.unwrap();
        let mut task = store.claim_next("A", now_micros()).await.unwrap().unwrap();

        store.release(&mut task).await.unwrap();
        assert!(!task.in_progress);

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert!(!loaded.in_progress);
        assert_eq!(loaded.version, 0);
        assert!(store.claim_next("A", now_micros()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_delayed_pushes_a_held_task_back() {
        let store = store().await;
        store.insert("A").await.unwrap();
        let task = store.claim_next("A", now_micros()).await.unwrap().unwrap();

        let due = now_micros() + chrono::Duration::seconds(1);
        store.release_delayed(task.id, due).await.unwrap();

        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert!(!loaded.in_progress);
        assert_eq!(loaded.execute_after, due);
        assert_eq!(loaded.version, 0);

        // a row whose claim is already gone is left untouched
        store
            .release_delayed(task.id, due + chrono::Duration::seconds(60))
            .await
            .unwrap();
        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.execute_after, due);
    }

    #[tokio::test]
    async fn log_rows_append_and_read_back_in_order() {
        let store = store().await;
        let task = store.insert("A").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .append_log(
                &mut tx,
                &LogEntry {
                    task_id: task.id,
                    status_before: Some("A".to_string()),
                    status_after: Some("B".to_string()),
                    exception_type: None,
                    exception_message: None,
                    extra_json: None,
                },
            )
            .await
            .unwrap();
        store
            .append_log(&mut tx, &failure_entry(task.id, serde_json::json!({"attempt": 1})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let logs = store.logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(!logs[0].is_failure());
        assert_eq!(logs[0].status_after.as_deref(), Some("B"));
        assert!(logs[1].is_failure());
        assert_eq!(logs[1].exception_message.as_deref(), Some("boom"));
        assert_eq!(logs[1].extra_json, Some(serde_json::json!({"attempt": 1})));
        assert!(store.logs(task.id + 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_failure_extra_json_finds_the_latest_failing_row() {
        let store = store().await;
        let task = store.insert("A").await.unwrap();
        assert!(store
            .last_failure_extra_json(task.id)
            .await
            .unwrap()
            .is_none());

        let mut tx = store.begin().await.unwrap();
        store
            .append_log(&mut tx, &failure_entry(task.id, serde_json::json!({"n": 1})))
            .await
            .unwrap();
        store
            .append_log(&mut tx, &failure_entry(task.id, serde_json::json!({"n": 2})))
            .await
            .unwrap();
        // a later success row must not shadow the failure
        store
            .append_log(
                &mut tx,
                &LogEntry {
                    task_id: task.id,
                    status_before: Some("A".to_string()),
                    status_after: Some("B".to_string()),
                    exception_type: None,
                    exception_message: None,
                    extra_json: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let extra = store.last_failure_extra_json(task.id).await.unwrap();
        assert_eq!(extra, Some(serde_json::json!({"n": 2})));
    }

    #[tokio::test]
    async fn distinct_queues_lists_live_queues_once() {
        let store = store().await;
        store.insert("A").await.unwrap();
        store.insert("A").await.unwrap();
        store.insert("B").await.unwrap();
        let mut done = store.insert("C").await.unwrap();
        done.finish();
        let mut tx = store.begin().await.unwrap();
        store.save(&mut tx, &mut done).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.distinct_queues().await.unwrap(), vec!["A", "B"]);

        // a claimed task keeps its queue live
        store.claim_next("B", now_micros()).await.unwrap().unwrap();
        assert_eq!(store.distinct_queues().await.unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn recover_in_progress_clears_leftover_claims() {
        let store = store().await;
        store.insert("A").await.unwrap();
        store.insert("B").await.unwrap();
        store.claim_next("A", now_micros()).await.unwrap().unwrap();
        store.claim_next("B", now_micros()).await.unwrap().unwrap();

        assert_eq!(store.recover_in_progress().await.unwrap(), 2);
        assert_eq!(store.recover_in_progress().await.unwrap(), 0);
        assert!(store.claim_next("A", now_micros()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_timestamps_surface_as_errors() {
        let store = store().await;
        let task = store.insert("A").await.unwrap();
        sqlx::query("UPDATE tasks SET modified = 'yesterday-ish' WHERE id = ?")
            .bind(task.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            store.load(task.id).await,
            Err(StoreError::BadTimestamp {
                column: "modified",
                ..
            })
        ));
    }
}
