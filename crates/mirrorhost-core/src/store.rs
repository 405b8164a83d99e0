//! Persisted task store (SQLite).
//!
//! One row per source host in `replication_tasks`; history, mapping and
//! cursor live in JSON text columns. Scheduler registrations live in
//! `replay_jobs` so a restarted service can resume its tick streams.
//!
//! Every call opens its own WAL connection on a blocking thread and runs
//! through [`with_contention_retry`], because the request path and the
//! replay ticks write the same database concurrently.
//!
//! ```text
//! TaskStore::modify(id, f)
//!   └── with_contention_retry
//!         └── spawn_blocking
//!               └── BEGIN IMMEDIATE → SELECT → f(&mut task) → UPDATE → COMMIT
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};
use crate::model::{ReplicationTask, TaskStatus, TaskSummary};
use crate::retry::{RetryPolicy, with_contention_retry};

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS replication_tasks (
    source_host_id           TEXT PRIMARY KEY,
    dest_host_id             TEXT,
    dest_host_name           TEXT,
    status                   TEXT NOT NULL,
    message                  TEXT NOT NULL DEFAULT '',
    start_time               REAL NOT NULL,
    first_history_timestamp  INTEGER,
    history_json             TEXT NOT NULL DEFAULT '{}',
    item_mapping_json        TEXT NOT NULL DEFAULT '{}',
    last_sent_index_json     TEXT NOT NULL DEFAULT '{}',
    cycle_offset             INTEGER NOT NULL DEFAULT 0,
    progress                 REAL NOT NULL DEFAULT 0,
    updated_at               INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS replay_jobs (
    job_id          TEXT PRIMARY KEY,
    source_host_id  TEXT NOT NULL,
    interval_secs   INTEGER NOT NULL,
    registered_at   INTEGER NOT NULL
);
";

const TASK_COLUMNS: &str = "source_host_id, dest_host_id, dest_host_name, status, message, \
     start_time, first_history_timestamp, history_json, item_mapping_json, \
     last_sent_index_json, cycle_offset, progress";

/// A persisted scheduler registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub source_host_id: String,
    pub interval_secs: u64,
    pub registered_at: i64,
}

/// SQLite-backed task store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db_path: Arc<PathBuf>,
    busy_timeout_ms: u64,
    policy: RetryPolicy,
}

impl TaskStore {
    /// Open (or create) the store and apply the schema.
    pub fn open(db_path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let _span = info_span!("task_store_open", path = %db_path.display()).entered();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_conn(&db_path, config.busy_timeout_ms)?;
        init_schema(&conn)?;

        Ok(Self {
            db_path: Arc::new(db_path),
            busy_timeout_ms: config.busy_timeout_ms,
            policy: config.commit_policy(),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Load one task.
    pub async fn get(&self, source_host_id: &str) -> Result<Option<ReplicationTask>> {
        let id = source_host_id.to_string();
        with_contention_retry(&self.policy, || {
            let id = id.clone();
            self.blocking(move |conn| get_sync(conn, &id))
        })
        .await
    }

    /// Insert or fully replace a task.
    pub async fn upsert(&self, task: &ReplicationTask) -> Result<()> {
        with_contention_retry(&self.policy, || {
            let task = task.clone();
            self.blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                upsert_sync(&tx, &task)?;
                tx.commit()?;
                Ok(())
            })
        })
        .await?;
        debug!(source_host_id = %task.source_host_id, status = %task.status, "Task upserted");
        Ok(())
    }

    /// Atomic read-modify-commit of one task.
    ///
    /// `f` runs inside a `BEGIN IMMEDIATE` transaction, so concurrent writers
    /// never lose each other's updates. It may run more than once when the
    /// commit is retried. Returns `None` when the task does not exist.
    pub async fn modify<F, R>(&self, source_host_id: &str, f: F) -> Result<Option<R>>
    where
        F: Fn(&mut ReplicationTask) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let id = source_host_id.to_string();
        let f = Arc::new(f);
        with_contention_retry(&self.policy, || {
            let id = id.clone();
            let f = Arc::clone(&f);
            self.blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut task) = get_sync(&tx, &id)? else {
                    return Ok(None);
                };
                let out = f(&mut task);
                upsert_sync(&tx, &task)?;
                tx.commit()?;
                Ok(Some(out))
            })
        })
        .await
    }

    /// Atomic read-decide-write over a task that may not exist yet.
    ///
    /// `f` sees the current row (or `None`) inside a `BEGIN IMMEDIATE`
    /// transaction and returns the row to write, if any, plus its answer.
    /// Two callers racing on the same id are serialized: the second sees
    /// whatever the first wrote.
    pub async fn upsert_with<F, R>(&self, source_host_id: &str, f: F) -> Result<R>
    where
        F: Fn(Option<ReplicationTask>) -> (Option<ReplicationTask>, R) + Send + Sync + 'static,
        R: Send + 'static,
    {
        let id = source_host_id.to_string();
        let f = Arc::new(f);
        with_contention_retry(&self.policy, || {
            let id = id.clone();
            let f = Arc::clone(&f);
            self.blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = get_sync(&tx, &id)?;
                let (write, out) = f(current);
                if let Some(task) = write {
                    upsert_sync(&tx, &task)?;
                }
                tx.commit()?;
                Ok(out)
            })
        })
        .await
    }

    /// Set status and message of an existing task. Returns false if missing.
    pub async fn set_status(
        &self,
        source_host_id: &str,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> Result<bool> {
        let message = message.into();
        let updated = self
            .modify(source_host_id, move |task| {
                task.set_status(status, message.clone());
            })
            .await?;
        Ok(updated.is_some())
    }

    /// All tasks ordered by source host id.
    pub async fn list_all(&self) -> Result<Vec<ReplicationTask>> {
        with_contention_retry(&self.policy, || self.blocking(list_all_sync)).await
    }

    /// Status view of every task (history bodies dropped).
    pub async fn summaries(&self) -> Result<Vec<TaskSummary>> {
        Ok(self
            .list_all()
            .await?
            .iter()
            .map(TaskSummary::from)
            .collect())
    }

    /// Persist a scheduler registration, replacing any previous one.
    pub async fn save_job(&self, job: &JobRecord) -> Result<()> {
        with_contention_retry(&self.policy, || {
            let job = job.clone();
            self.blocking(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO replay_jobs \
                     (job_id, source_host_id, interval_secs, registered_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        job.job_id,
                        job.source_host_id,
                        job.interval_secs as i64,
                        job.registered_at,
                    ],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// Remove a scheduler registration. Returns true if one existed.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        with_contention_retry(&self.policy, || {
            let job_id = job_id.clone();
            self.blocking(move |conn| {
                let n = conn.execute("DELETE FROM replay_jobs WHERE job_id = ?1", [&job_id])?;
                Ok(n > 0)
            })
        })
        .await
    }

    /// All scheduler registrations ordered by job id.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        with_contention_retry(&self.policy, || {
            self.blocking(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, source_host_id, interval_secs, registered_at \
                     FROM replay_jobs ORDER BY job_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(JobRecord {
                        job_id: row.get(0)?,
                        source_host_id: row.get(1)?,
                        interval_secs: row.get::<_, i64>(2)? as u64,
                        registered_at: row.get(3)?,
                    })
                })?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row?);
                }
                Ok(jobs)
            })
        })
        .await
    }

    /// Run `op` with a fresh connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        let busy_timeout_ms = self.busy_timeout_ms;
        tokio::task::spawn_blocking(move || {
            let mut conn = open_conn(&db_path, busy_timeout_ms)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| Error::Runtime(format!("task join: {e}")))?
    }
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

fn open_conn(db_path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={busy_timeout_ms};"
    ))?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}

fn get_sync(conn: &Connection, source_host_id: &str) -> Result<Option<ReplicationTask>> {
    let raw = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM replication_tasks WHERE source_host_id = ?1"),
            [source_host_id],
            RawTaskRow::from_row,
        )
        .optional()?;
    raw.map(RawTaskRow::decode).transpose()
}

fn list_all_sync(conn: &mut Connection) -> Result<Vec<ReplicationTask>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM replication_tasks ORDER BY source_host_id"
    ))?;
    let rows = stmt.query_map([], RawTaskRow::from_row)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?.decode()?);
    }
    Ok(tasks)
}

fn upsert_sync(conn: &Connection, task: &ReplicationTask) -> Result<()> {
    let history_json = serde_json::to_string(&task.history)?;
    let mapping_json = serde_json::to_string(&task.item_mapping)?;
    let cursor_json = serde_json::to_string(&task.last_sent_index)?;

    conn.execute(
        "INSERT INTO replication_tasks \
         (source_host_id, dest_host_id, dest_host_name, status, message, start_time, \
          first_history_timestamp, history_json, item_mapping_json, last_sent_index_json, \
          cycle_offset, progress, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
         ON CONFLICT(source_host_id) DO UPDATE SET \
           dest_host_id = excluded.dest_host_id, \
           dest_host_name = excluded.dest_host_name, \
           status = excluded.status, \
           message = excluded.message, \
           start_time = excluded.start_time, \
           first_history_timestamp = excluded.first_history_timestamp, \
           history_json = excluded.history_json, \
           item_mapping_json = excluded.item_mapping_json, \
           last_sent_index_json = excluded.last_sent_index_json, \
           cycle_offset = excluded.cycle_offset, \
           progress = excluded.progress, \
           updated_at = excluded.updated_at",
        rusqlite::params![
            task.source_host_id,
            task.dest_host_id,
            task.dest_host_name,
            task.status.as_str(),
            task.message,
            task.start_time,
            task.first_history_timestamp,
            history_json,
            mapping_json,
            cursor_json,
            task.cycle_offset,
            task.progress,
            chrono::Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

/// Column values before JSON decoding.
struct RawTaskRow {
    source_host_id: String,
    dest_host_id: Option<String>,
    dest_host_name: Option<String>,
    status: String,
    message: String,
    start_time: f64,
    first_history_timestamp: Option<i64>,
    history_json: String,
    item_mapping_json: String,
    last_sent_index_json: String,
    cycle_offset: i64,
    progress: f64,
}

impl RawTaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source_host_id: row.get(0)?,
            dest_host_id: row.get(1)?,
            dest_host_name: row.get(2)?,
            status: row.get(3)?,
            message: row.get(4)?,
            start_time: row.get(5)?,
            first_history_timestamp: row.get(6)?,
            history_json: row.get(7)?,
            item_mapping_json: row.get(8)?,
            last_sent_index_json: row.get(9)?,
            cycle_offset: row.get(10)?,
            progress: row.get(11)?,
        })
    }

    fn decode(self) -> Result<ReplicationTask> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| StorageError::Corruption {
            details: format!("task {}: bad {what}: {e}", self.source_host_id),
        };
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| corrupt("status", &e))?;
        let history =
            serde_json::from_str(&self.history_json).map_err(|e| corrupt("history", &e))?;
        let item_mapping = serde_json::from_str(&self.item_mapping_json)
            .map_err(|e| corrupt("item_mapping", &e))?;
        let last_sent_index = serde_json::from_str(&self.last_sent_index_json)
            .map_err(|e| corrupt("last_sent_index", &e))?;

        Ok(ReplicationTask {
            source_host_id: self.source_host_id,
            dest_host_id: self.dest_host_id,
            dest_host_name: self.dest_host_name,
            status,
            message: self.message,
            start_time: self.start_time,
            first_history_timestamp: self.first_history_timestamp,
            history,
            item_mapping,
            last_sent_index,
            cycle_offset: self.cycle_offset,
            progress: self.progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HistoryPoint, ItemId};

    fn open_temp() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db"), &StorageConfig::default()).unwrap();
        (dir, store)
    }

    fn sample_task(id: &str) -> ReplicationTask {
        let mut task = ReplicationTask::new(id, 1_700_000_000.5);
        task.dest_host_id = Some("20001".into());
        task.dest_host_name = Some("clone-of-web01".into());
        task.history.insert(
            ItemId::from("101"),
            vec![HistoryPoint::new(1000, 5_i64), HistoryPoint::new(1001, 7.25)],
        );
        task.item_mapping
            .insert(ItemId::from("101"), "trapper.cpu".to_string());
        task.last_sent_index.advance(ItemId::from("101"), 0);
        task.progress = 50.0;
        task
    }

    #[tokio::test]
    async fn upsert_then_get_returns_same_task() {
        let (_dir, store) = open_temp();
        let task = sample_task("10084");
        store.upsert(&task).await.unwrap();

        let loaded = store.get("10084").await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let (_dir, store) = open_temp();
        let mut task = sample_task("1");
        store.upsert(&task).await.unwrap();

        task.set_status(TaskStatus::Replaying, "looping");
        task.last_sent_index.clear();
        store.upsert(&task).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TaskStatus::Replaying);
        assert!(all[0].last_sent_index.is_empty());
    }

    #[tokio::test]
    async fn modify_updates_only_what_the_closure_touches() {
        let (_dir, store) = open_temp();
        store.upsert(&sample_task("1")).await.unwrap();

        let out = store
            .modify("1", |task| {
                task.progress = 75.0;
                task.history.len()
            })
            .await
            .unwrap();
        assert_eq!(out, Some(1));

        let loaded = store.get("1").await.unwrap().unwrap();
        assert!((loaded.progress - 75.0).abs() < f64::EPSILON);
        assert_eq!(loaded.item_mapping.len(), 1);
    }

    #[tokio::test]
    async fn modify_missing_task_returns_none() {
        let (_dir, store) = open_temp();
        let out = store.modify("nope", |task| task.progress = 1.0).await.unwrap();
        assert!(out.is_none());
        assert!(!store.set_status("nope", TaskStatus::Failed, "x").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_with_inserts_missing_and_skips_when_declined() {
        let (_dir, store) = open_temp();
        let claim = |current: Option<ReplicationTask>| match current {
            Some(_) => (None, false),
            None => (Some(ReplicationTask::new("7", 1.0)), true),
        };

        assert!(store.upsert_with("7", claim).await.unwrap());
        assert!(!store.upsert_with("7", claim).await.unwrap());
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upsert_with_claims_once() {
        let (_dir, store) = open_temp();
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            set.spawn(async move {
                store
                    .upsert_with("42", |current| match current {
                        Some(_) => (None, false),
                        None => (Some(ReplicationTask::new("42", 1.0)), true),
                    })
                    .await
                    .unwrap()
            });
        }

        let mut winners = 0;
        while let Some(claimed) = set.join_next().await {
            if claimed.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn list_all_orders_by_source_host_id() {
        let (_dir, store) = open_temp();
        for id in ["30", "10", "20"] {
            store.upsert(&sample_task(id)).await.unwrap();
        }
        let ids: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.source_host_id)
            .collect();
        assert_eq!(ids, vec!["10", "20", "30"]);

        let summaries = store.summaries().await.unwrap();
        assert_eq!(summaries[0].history_points, 2);
    }

    #[tokio::test]
    async fn job_registry_round_trip() {
        let (_dir, store) = open_temp();
        let job = JobRecord {
            job_id: "replay_10".into(),
            source_host_id: "10".into(),
            interval_secs: 60,
            registered_at: 1,
        };
        store.save_job(&job).await.unwrap();
        store
            .save_job(&JobRecord {
                interval_secs: 30,
                ..job.clone()
            })
            .await
            .unwrap();

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_secs, 30);

        assert!(store.delete_job("replay_10").await.unwrap());
        assert!(!store.delete_job("replay_10").await.unwrap());
        assert!(store.list_jobs().await.unwrap().is_empty());
    }

    #[test]
    fn refuses_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        let err = TaskStore::open(&path, &StorageConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::SchemaTooNew {
                current: 99,
                supported: SCHEMA_VERSION
            })
        ));
    }

    #[tokio::test]
    async fn corrupt_status_is_reported() {
        let (_dir, store) = open_temp();
        store.upsert(&sample_task("1")).await.unwrap();
        {
            let conn = Connection::open(store.db_path()).unwrap();
            conn.execute(
                "UPDATE replication_tasks SET status = 'paused' WHERE source_host_id = '1'",
                [],
            )
            .unwrap();
        }
        let err = store.get("1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::Corruption { .. })
        ));
    }
}
