//! Task store behavior under write contention from other connections and
//! concurrent writers.

use std::time::Duration;

use mirrorhost_core::config::StorageConfig;
use mirrorhost_core::model::{ReplicationTask, TaskStatus};
use mirrorhost_core::store::TaskStore;
use rusqlite::Connection;
use tokio::task::JoinSet;

fn open(dir: &tempfile::TempDir, attempts: u32, base_delay_ms: u64) -> TaskStore {
    let config = StorageConfig {
        busy_timeout_ms: 0,
        commit_max_attempts: attempts,
        commit_base_delay_ms: base_delay_ms,
        ..StorageConfig::default()
    };
    TaskStore::open(dir.path().join("tasks.db"), &config).unwrap()
}

/// Hold the write lock from a separate connection for `hold`.
fn lock_for(store: &TaskStore, hold: Duration) -> std::thread::JoinHandle<()> {
    let blocker = Connection::open(store.db_path()).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();
    std::thread::spawn(move || {
        std::thread::sleep(hold);
        blocker.execute_batch("COMMIT;").unwrap();
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modify_waits_out_a_short_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 8, 50);
    store.upsert(&ReplicationTask::new("1", 1.0)).await.unwrap();

    let blocker = lock_for(&store, Duration::from_millis(150));
    let updated = store
        .modify("1", |task| task.set_status(TaskStatus::Replaying, "after lock"))
        .await
        .unwrap();
    blocker.join().unwrap();

    assert!(updated.is_some());
    let task = store.get("1").await.unwrap().unwrap();
    assert_eq!(task.message, "after lock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_lock_surfaces_contention() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 2, 10);
    store.upsert(&ReplicationTask::new("1", 1.0)).await.unwrap();

    let blocker = lock_for(&store, Duration::from_millis(800));
    let err = store
        .set_status("1", TaskStatus::Failed, "never")
        .await
        .unwrap_err();
    blocker.join().unwrap();

    assert!(err.is_contention(), "{err}");
    assert!(err.remediation().is_some());
    let task = store.get("1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Starting);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_modifies_do_not_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, 50, 5);
    store.upsert(&ReplicationTask::new("1", 1.0)).await.unwrap();

    let mut writers = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        writers.spawn(async move {
            store
                .modify("1", |task| task.cycle_offset += 1)
                .await
                .unwrap()
        });
    }
    while let Some(result) = writers.join_next().await {
        assert!(result.unwrap().is_some());
    }

    let task = store.get("1").await.unwrap().unwrap();
    assert_eq!(task.cycle_offset, 16);
}
