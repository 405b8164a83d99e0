//! Recurring replay ticks, one tokio task per source host.
//!
//! Registrations are persisted in the task store (`replay_jobs`), so a
//! restarted service calls [`ReplayScheduler::resume`] to pick every tick
//! stream back up. Ticks of one host are serialized: the job loop awaits
//! each tick before waiting for the next, and missed ticks are skipped.
//! Different hosts tick concurrently.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::replay::ReplayEngine;
use crate::store::{JobRecord, TaskStore};

/// Job id for a source host's replay stream.
#[must_use]
pub fn job_id(source_host_id: &str) -> String {
    format!("replay_{source_host_id}")
}

struct RunningJob {
    source_host_id: String,
    interval: Duration,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ReplayScheduler {
    engine: ReplayEngine,
    jobs: Mutex<HashMap<String, RunningJob>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ReplayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayScheduler")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl ReplayScheduler {
    #[must_use]
    pub fn new(engine: ReplayEngine) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            jobs: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn store(&self) -> &TaskStore {
        self.engine.store()
    }

    /// Register (or replace) the tick stream for a source host and persist it.
    pub async fn register(&self, source_host_id: &str, interval: Duration) -> Result<String> {
        let id = job_id(source_host_id);
        self.store()
            .save_job(&JobRecord {
                job_id: id.clone(),
                source_host_id: source_host_id.to_string(),
                interval_secs: interval.as_secs().max(1),
                registered_at: chrono::Utc::now().timestamp(),
            })
            .await?;
        self.start(source_host_id, interval).await;
        info!(job_id = %id, interval_secs = interval.as_secs(), "Replay job registered");
        Ok(id)
    }

    /// Stop and forget a source host's tick stream. Returns true if it existed.
    pub async fn unregister(&self, source_host_id: &str) -> Result<bool> {
        let id = job_id(source_host_id);
        let running = self.jobs.lock().await.remove(&id);
        let was_running = running.is_some();
        if let Some(job) = running {
            stop_job(job).await;
        }
        let was_persisted = self.store().delete_job(&id).await?;
        if was_running || was_persisted {
            info!(job_id = %id, "Replay job unregistered");
        }
        Ok(was_running || was_persisted)
    }

    pub async fn is_registered(&self, source_host_id: &str) -> bool {
        self.jobs.lock().await.contains_key(&job_id(source_host_id))
    }

    /// Running job ids with their source host, ordered by job id.
    pub async fn registered_jobs(&self) -> Vec<(String, String, Duration)> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<_> = jobs
            .iter()
            .map(|(id, job)| (id.clone(), job.source_host_id.clone(), job.interval))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Start every persisted registration. Returns how many were started.
    pub async fn resume(&self) -> Result<usize> {
        let records = self.store().list_jobs().await?;
        let count = records.len();
        for record in records {
            let interval = Duration::from_secs(record.interval_secs.max(1));
            self.start(&record.source_host_id, interval).await;
        }
        info!(jobs = count, "Replay jobs resumed");
        Ok(count)
    }

    /// Stop every job and wait for in-flight ticks. Registrations stay persisted.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let jobs: Vec<RunningJob> = self.jobs.lock().await.drain().map(|(_, job)| job).collect();
        for job in jobs {
            if let Err(e) = job.handle.await {
                warn!(source_host_id = %job.source_host_id, error = %e, "Replay job ended abnormally");
            }
        }
        info!("Replay scheduler stopped");
    }

    async fn start(&self, source_host_id: &str, interval: Duration) {
        let id = job_id(source_host_id);
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_job(
            self.engine.clone(),
            source_host_id.to_string(),
            interval,
            stop_rx,
            self.shutdown.subscribe(),
        ));
        let job = RunningJob {
            source_host_id: source_host_id.to_string(),
            interval,
            stop,
            handle,
        };
        let previous = self.jobs.lock().await.insert(id.clone(), job);
        if let Some(previous) = previous {
            debug!(job_id = %id, "Replacing existing replay job");
            stop_job(previous).await;
        }
    }
}

async fn stop_job(job: RunningJob) {
    let _ = job.stop.send(true);
    if let Err(e) = job.handle.await {
        warn!(source_host_id = %job.source_host_id, error = %e, "Replay job ended abnormally");
    }
}

async fn run_job(
    engine: ReplayEngine,
    source_host_id: String,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick one period after registration.
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.tick(&source_host_id).await;
                debug!(source_host_id = %source_host_id, ?report.outcome, "Replay tick finished");
            }
            _ = stop.changed() => {
                debug!(source_host_id = %source_host_id, "Replay job stopped");
                break;
            }
            _ = shutdown.changed() => {
                debug!(source_host_id = %source_host_id, "Replay job shutting down");
                break;
            }
        }
    }
}
