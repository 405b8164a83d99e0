//! Replication task lifecycle.
//!
//! ```text
//! replicate:  starting → fetching_source_config → mapping_ids → modifying_items
//!             → creating_dest_host → comparing_items → fetching_history
//!             → storing_data → scheduling_replay → replicating
//!
//! relink:     relinking → rebuilding_mapping → fetching_history
//!             → scheduling_replay → replicating
//! ```
//!
//! Every status change is persisted before the step runs, so the status
//! surface always shows where a pipeline is. A hard error moves the task to
//! `failed` with the error text and stops the pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, warn};

use crate::config::ReplayConfig;
use crate::error::{LifecycleError, RemoteError, Result};
use crate::filter::ItemFilter;
use crate::history::HistoryCollector;
use crate::mapping::{MappingRebuilder, RebuildOutcome};
use crate::model::{ReplicationTask, TaskStatus, TaskSummary, unix_now};
use crate::remote::{
    CLONE_GROUP, ClonedHost, DestinationHostSpec, FALLBACK_GROUP, HostMacro, MonitoringApi,
    SOURCE_HOST_MACRO, compare_items, trapper_blueprints,
};
use crate::scheduler::ReplayScheduler;
use crate::store::TaskStore;

/// Answer to a replicate request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplicateOutcome {
    /// The pipeline ran to `replicating`.
    Started { task: TaskSummary },
    /// A non-failed task already exists; nothing changed.
    AlreadyActive { status: TaskStatus },
}

/// Answer to a relink request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RelinkOutcome {
    Linked { task: TaskSummary },
    /// Already linked to the requested destination; the tick was re-registered.
    AlreadyLinked { job_id: String },
}

/// What the relink claim transaction found.
enum RelinkClaim {
    Claimed,
    AlreadyLinked,
    Conflict(Option<String>),
}

/// Drives replication tasks from request to scheduled replay.
pub struct LifecycleController {
    store: TaskStore,
    source: Arc<dyn MonitoringApi>,
    dest: Arc<dyn MonitoringApi>,
    scheduler: Arc<ReplayScheduler>,
    rebuilder: MappingRebuilder,
    collector: HistoryCollector,
    filter: ItemFilter,
    window: Duration,
    tick_interval: Duration,
    initial_history: Duration,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("source", &self.source.name())
            .field("dest", &self.dest.name())
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new(
        store: TaskStore,
        source: Arc<dyn MonitoringApi>,
        dest: Arc<dyn MonitoringApi>,
        scheduler: Arc<ReplayScheduler>,
        filter: ItemFilter,
        replay: &ReplayConfig,
    ) -> Self {
        let rebuilder =
            MappingRebuilder::new(store.clone(), Arc::clone(&source), Arc::clone(&dest));
        Self {
            store,
            source,
            dest,
            scheduler,
            rebuilder,
            collector: HistoryCollector::new(filter.clone()),
            filter,
            window: replay.window(),
            tick_interval: replay.tick_interval(),
            initial_history: Duration::from_secs(replay.initial_history_hours * 3600),
        }
    }

    // =========================================================================
    // Replicate
    // =========================================================================

    /// Clone a source host to the destination and schedule its replay.
    ///
    /// A task that exists and is not `failed` is left alone.
    pub async fn replicate(&self, source_host_id: &str) -> Result<ReplicateOutcome> {
        let span = crate::task_span!("replicate", source_host_id);
        async {
            let now = unix_now();
            let id = source_host_id.to_string();
            // Check and claim in one transaction; a concurrent request sees `starting`.
            let claim = self
                .store
                .upsert_with(source_host_id, move |current| {
                    let mut task = match current {
                        Some(existing) if existing.status != TaskStatus::Failed => {
                            return (None, Err(existing.status));
                        }
                        Some(mut existing) => {
                            existing.reset_replay(now);
                            existing
                        }
                        None => ReplicationTask::new(id.as_str(), now),
                    };
                    task.set_status(TaskStatus::Starting, "Initiating replication...");
                    (Some(task), Ok(()))
                })
                .await?;
            if let Err(status) = claim {
                info!(%status, "Replication already in progress");
                return Ok(ReplicateOutcome::AlreadyActive { status });
            }

            match self.run_replication(source_host_id, now).await {
                Ok(task) => Ok(ReplicateOutcome::Started { task }),
                Err(e) => {
                    self.fail(source_host_id, format!("Replication Error: {e}")).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_replication(&self, source_host_id: &str, now: f64) -> Result<TaskSummary> {
        self.step(
            source_host_id,
            TaskStatus::FetchingSourceConfig,
            "Fetching source host configuration...",
        )
        .await?;
        let config = self.source.get_host_config(source_host_id).await?;
        let all_items = config.all_items();
        info!(
            host = %config.host.name,
            host_items = config.host_items.len(),
            total_items = all_items.len(),
            macros = config.macros.len(),
            "Fetched source host configuration"
        );

        self.step(
            source_host_id,
            TaskStatus::MappingIds,
            "Mapping source groups/templates to destination...",
        )
        .await?;
        let mut group_names = config.groups.clone();
        if !group_names.iter().any(|g| g == CLONE_GROUP) {
            group_names.push(CLONE_GROUP.to_string());
        }
        let mut group_ids = self.dest.resolve_groups(&group_names).await?;
        if group_ids.is_empty() {
            warn!(host = %config.host.name, "No destination groups resolved; using fallback group");
            group_ids = self
                .dest
                .resolve_groups(&[FALLBACK_GROUP.to_string()])
                .await?;
        }
        let template_ids = self.dest.resolve_templates(&config.templates).await?;

        self.step(
            source_host_id,
            TaskStatus::ModifyingItems,
            "Modifying direct host items to trapper type...",
        )
        .await?;
        let blueprints = trapper_blueprints(&config.host_items, &self.filter);
        if blueprints.is_empty() {
            warn!(host = %config.host.name, "No direct host items usable as trappers");
        }

        self.step(
            source_host_id,
            TaskStatus::CreatingDestHost,
            "Creating host on destination...",
        )
        .await?;
        let mut macros: Vec<HostMacro> = config
            .macros
            .iter()
            .filter(|m| m.name != SOURCE_HOST_MACRO)
            .cloned()
            .collect();
        macros.push(HostMacro {
            name: SOURCE_HOST_MACRO.to_string(),
            value: source_host_id.to_string(),
        });
        let spec = DestinationHostSpec {
            source_host_id: source_host_id.to_string(),
            source_host_name: config.host.name.clone(),
            group_ids,
            template_ids,
            items: blueprints,
            macros,
            source_items: all_items.clone(),
        };
        let created = self.dest.create_host(&spec).await?;
        if created.host_id.is_empty() {
            return Err(RemoteError::InvalidResponse {
                server: self.dest.name().to_string(),
                message: "host creation returned no host id".to_string(),
            }
            .into());
        }
        {
            let created = created.clone();
            self.store
                .modify(source_host_id, move |t| {
                    t.dest_host_id = Some(created.host_id.clone());
                    t.dest_host_name = Some(created.host_name.clone());
                    t.item_mapping = created.item_mapping.clone();
                })
                .await?;
        }
        info!(
            dest_host_id = %created.host_id,
            mapped = created.item_mapping.len(),
            "Destination host created"
        );

        let rebuild = self.rebuilder.rebuild(source_host_id, &created.host_id).await;
        if rebuild.success {
            info!(mapped = rebuild.mapped, "Automatic mapping rebuild succeeded");
        } else {
            warn!(message = %rebuild.message, "Automatic mapping rebuild failed; keeping initial mapping");
        }

        self.step(
            source_host_id,
            TaskStatus::ComparingItems,
            "Comparing source and destination items...",
        )
        .await?;
        self.log_item_comparison(source_host_id, &created.host_id).await;

        let hours = self.initial_history.as_secs() / 3600;
        self.step(
            source_host_id,
            TaskStatus::FetchingHistory,
            format!("Fetching source item history (last {hours}h)..."),
        )
        .await?;
        let time_till = now.floor() as i64;
        let time_from = time_till - self.initial_history.as_secs() as i64;
        let collected = self
            .collector
            .collect(self.source.as_ref(), &all_items, time_from, time_till)
            .await;

        self.step(source_host_id, TaskStatus::StoringData, "Storing history data...")
            .await?;
        let first_ts = collected.earliest.unwrap_or(time_till);
        let history = collected.history;
        let mapped = self
            .store
            .modify(source_host_id, move |t| {
                t.history = history.clone();
                t.first_history_timestamp = Some(first_ts);
                t.item_mapping.len()
            })
            .await?
            .ok_or_else(|| LifecycleError::TaskNotFound(source_host_id.to_string()))?;
        if mapped == 0 {
            return Err(
                LifecycleError::MissingData(source_host_id.to_string(), "item mapping".into())
                    .into(),
            );
        }

        self.schedule(source_host_id).await?;
        self.step(
            source_host_id,
            TaskStatus::Replicating,
            "Replication setup complete. Replay task scheduled.",
        )
        .await?;
        info!("Replication setup complete");
        self.status(source_host_id).await
    }

    async fn log_item_comparison(&self, source_host_id: &str, dest_host_id: &str) {
        let items = tokio::try_join!(
            self.source.list_items(source_host_id),
            self.dest.list_items(dest_host_id)
        );
        match items {
            Ok((source_items, dest_items)) => {
                let comparison = compare_items(&source_items, &dest_items);
                if comparison.is_clean() {
                    info!("All source items found on destination by key");
                    return;
                }
                for key in &comparison.missing_on_destination {
                    warn!(item_key = %key, "Source item not found on destination");
                }
                for mismatch in &comparison.name_mismatches {
                    warn!(
                        item_key = %mismatch.key,
                        source_name = %mismatch.source_name,
                        dest_name = %mismatch.dest_name,
                        "Item names differ"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Item comparison skipped"),
        }
    }

    // =========================================================================
    // Relink
    // =========================================================================

    /// Attach a source host to an existing destination host (for example one
    /// found by [`Self::orphaned_hosts`]) and schedule its replay.
    pub async fn relink(&self, source_host_id: &str, dest_host_id: &str) -> Result<RelinkOutcome> {
        let span = crate::task_span!("relink", source_host_id, dest_host_id = dest_host_id);
        async {
            let source_host = self
                .source
                .get_host(source_host_id)
                .await?
                .ok_or_else(|| RemoteError::HostNotFound {
                    server: self.source.name().to_string(),
                    host_id: source_host_id.to_string(),
                })?;
            let dest_host = self
                .dest
                .get_host(dest_host_id)
                .await?
                .ok_or_else(|| RemoteError::HostNotFound {
                    server: self.dest.name().to_string(),
                    host_id: dest_host_id.to_string(),
                })?;

            let now = unix_now();
            let id = source_host_id.to_string();
            let requested = dest_host_id.to_string();
            let message = format!("Re-linking to source host {}...", source_host.name);
            let claim = self
                .store
                .upsert_with(source_host_id, move |current| {
                    if let Some(existing) = current {
                        return if existing.dest_host_id.as_deref() == Some(requested.as_str()) {
                            (None, RelinkClaim::AlreadyLinked)
                        } else {
                            (None, RelinkClaim::Conflict(existing.dest_host_id))
                        };
                    }
                    let mut task = ReplicationTask::new(id.as_str(), now);
                    task.dest_host_id = Some(dest_host.host_id.clone());
                    task.dest_host_name = Some(dest_host.name.clone());
                    task.set_status(TaskStatus::Relinking, message.clone());
                    (Some(task), RelinkClaim::Claimed)
                })
                .await?;

            match claim {
                RelinkClaim::Claimed => {}
                RelinkClaim::AlreadyLinked => {
                    let job_id = self.scheduler.register(source_host_id, self.tick_interval).await?;
                    info!("Already linked; replay re-registered");
                    return Ok(RelinkOutcome::AlreadyLinked { job_id });
                }
                RelinkClaim::Conflict(linked) => {
                    return Err(LifecycleError::Conflict {
                        source_host_id: source_host_id.to_string(),
                        linked_dest: linked.unwrap_or_else(|| "<none>".to_string()),
                        requested_dest: dest_host_id.to_string(),
                    }
                    .into());
                }
            }

            match self.run_relink(source_host_id, dest_host_id, now).await {
                Ok(task) => Ok(RelinkOutcome::Linked { task }),
                Err(e) => {
                    self.fail(source_host_id, format!("Re-linking failed: {e}")).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_relink(
        &self,
        source_host_id: &str,
        dest_host_id: &str,
        now: f64,
    ) -> Result<TaskSummary> {
        self.step(
            source_host_id,
            TaskStatus::RebuildingMapping,
            "Rebuilding item mapping...",
        )
        .await?;
        let rebuild = self.rebuilder.rebuild(source_host_id, dest_host_id).await;
        if !rebuild.success {
            return Err(LifecycleError::RebuildFailed(rebuild.message).into());
        }

        self.step(
            source_host_id,
            TaskStatus::FetchingHistory,
            "Fetching recent history...",
        )
        .await?;
        let items = self.source.list_items(source_host_id).await?;
        let time_till = now.floor() as i64;
        let window_start = time_till - self.window.as_secs() as i64;
        let collected = self
            .collector
            .collect(self.source.as_ref(), &items, window_start, time_till)
            .await;
        let history = collected.history;
        self.store
            .modify(source_host_id, move |t| {
                t.history = history.clone();
                t.first_history_timestamp = Some(window_start);
            })
            .await?;

        self.schedule(source_host_id).await?;
        self.step(
            source_host_id,
            TaskStatus::Replicating,
            "Re-linking complete. Replay task scheduled.",
        )
        .await?;
        info!("Re-linking complete");
        self.status(source_host_id).await
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Manually rebuild a task's mapping against its linked destination.
    pub async fn rebuild_mapping(&self, source_host_id: &str) -> Result<RebuildOutcome> {
        let task = self
            .store
            .get(source_host_id)
            .await?
            .ok_or_else(|| LifecycleError::TaskNotFound(source_host_id.to_string()))?;
        let dest_host_id = task.dest_host_id.ok_or_else(|| {
            LifecycleError::MissingData(source_host_id.to_string(), "destination host id".into())
        })?;
        Ok(self.rebuilder.rebuild(source_host_id, &dest_host_id).await)
    }

    pub async fn status(&self, source_host_id: &str) -> Result<TaskSummary> {
        self.store
            .get(source_host_id)
            .await?
            .map(|task| task.summary())
            .ok_or_else(|| LifecycleError::TaskNotFound(source_host_id.to_string()).into())
    }

    pub async fn status_all(&self) -> Result<Vec<TaskSummary>> {
        self.store.summaries().await
    }

    /// Clone-group hosts on the destination that no task refers to.
    pub async fn orphaned_hosts(&self) -> Result<Vec<ClonedHost>> {
        let hosts = self.dest.list_cloned_hosts().await?;
        let tasks = self.store.list_all().await?;
        let orphans: Vec<ClonedHost> = hosts
            .into_iter()
            .filter(|host| {
                !tasks.iter().any(|task| {
                    task.dest_host_id.as_deref() == Some(host.host_id.as_str())
                        || host.source_host_hint.as_deref() == Some(task.source_host_id.as_str())
                })
            })
            .collect();
        info!(orphans = orphans.len(), "Orphaned host scan complete");
        Ok(orphans)
    }

    /// Unregister a task's tick and drive it to `failed`.
    pub async fn stop_replay(&self, source_host_id: &str) -> Result<TaskSummary> {
        if self.store.get(source_host_id).await?.is_none() {
            return Err(LifecycleError::TaskNotFound(source_host_id.to_string()).into());
        }
        let unregistered = self.scheduler.unregister(source_host_id).await?;
        self.store
            .set_status(source_host_id, TaskStatus::Failed, "Replay stopped by operator")
            .await?;
        info!(source_host_id, unregistered, "Replay stopped");
        self.status(source_host_id).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn step(
        &self,
        source_host_id: &str,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        info!(%status, %message, "Replication step");
        if self.store.set_status(source_host_id, status, message).await? {
            Ok(())
        } else {
            Err(LifecycleError::TaskNotFound(source_host_id.to_string()).into())
        }
    }

    async fn schedule(&self, source_host_id: &str) -> Result<()> {
        self.step(
            source_host_id,
            TaskStatus::SchedulingReplay,
            "Scheduling data replay task...",
        )
        .await?;
        let id = self
            .scheduler
            .register(source_host_id, self.tick_interval)
            .await?;
        info!(job_id = %id, "Replay job scheduled");
        Ok(())
    }

    /// Best-effort `failed` write; a secondary error is only logged.
    async fn fail(&self, source_host_id: &str, message: String) {
        warn!(source_host_id, %message, "Pipeline failed");
        if let Err(e) = self
            .store
            .set_status(source_host_id, TaskStatus::Failed, message)
            .await
        {
            warn!(source_host_id, error = %e, "Could not record failed status");
        }
    }
}
