//! Historical replay engine.
//!
//! Each tick emits at most one stored sample per replayable item, stamped
//! with the current time, and advances the per-item cursor. When every
//! replayable item has reached its end the cursor resets and the loop
//! starts over; when the replay window elapses the cursor and window start
//! reset before anything is sent.
//!
//! ```text
//! tick_at(id, now)
//!   ├── load task            (missing / completed / failed → Skipped)
//!   ├── window restart?      persist cursor={} start_time=now progress=0
//!   ├── plan_tick            pure: staged values + next cursor + progress
//!   ├── fault injection      per (host, key)
//!   ├── persist cursor       before any network I/O
//!   ├── validate + send      one batch
//!   └── persist status, message, progress (and cycle reset)
//! ```
//!
//! Engine writes go through [`TaskStore::modify`] and only touch replay
//! bookkeeping fields, so lifecycle updates made concurrently survive.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result, SinkError};
use crate::faults::FaultInjector;
use crate::filter::ItemFilter;
use crate::model::{History, ItemId, ItemMapping, MetricValue, ReplayCursor, TaskStatus, unix_now};
use crate::sink::{Emission, SendReport, TelemetrySink, validate_batch};
use crate::store::TaskStore;

/// Tick-local processing failure. Leaves the stored cursor untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("cursor {index} out of bounds for item {item_id} with {len} samples")]
    CursorOutOfBounds {
        item_id: ItemId,
        index: usize,
        len: usize,
    },
}

/// A stored sample selected for emission, before fault injection.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedValue {
    pub item_id: ItemId,
    pub key: String,
    pub index: usize,
    pub value: MetricValue,
}

/// What one tick will do, computed without side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub staged: Vec<StagedValue>,
    /// Cursor after this tick's advances
    pub cursor: ReplayCursor,
    pub replayable_items: usize,
    /// Samples sent this cycle across replayable items, including this tick
    pub sent_points: usize,
    pub total_points: usize,
    pub cycle_complete: bool,
}

impl TickPlan {
    /// Percent sent this cycle, two decimals. No replayable samples reads as 100.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_points == 0 {
            return 100.0;
        }
        let pct = self.sent_points as f64 / self.total_points as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }
}

/// Select the next sample of every replayable item.
///
/// An item is replayable when it has a destination key and that key passes
/// the filter. Items without a mapping are skipped silently.
pub fn plan_tick(
    history: &History,
    mapping: &ItemMapping,
    cursor: &ReplayCursor,
    filter: &ItemFilter,
) -> std::result::Result<TickPlan, PlanError> {
    let mut plan = TickPlan {
        staged: Vec::new(),
        cursor: cursor.clone(),
        replayable_items: 0,
        sent_points: 0,
        total_points: 0,
        cycle_complete: true,
    };

    for (item_id, points) in history {
        let Some(key) = mapping.get(item_id) else {
            continue;
        };
        if filter.should_skip(key, key) {
            debug!(item_id = %item_id, item_key = %key, "Destination key filtered from replay");
            continue;
        }

        let len = points.len();
        if let Some(last) = cursor.last_sent(item_id) {
            if last >= len {
                return Err(PlanError::CursorOutOfBounds {
                    item_id: item_id.clone(),
                    index: last,
                    len,
                });
            }
        }

        plan.replayable_items += 1;
        plan.total_points += len;

        let next = cursor.next_index(item_id);
        let sent = if let Some(point) = points.get(next) {
            plan.staged.push(StagedValue {
                item_id: item_id.clone(),
                key: key.clone(),
                index: next,
                value: point.value.clone(),
            });
            plan.cursor.advance(item_id.clone(), next);
            next + 1
        } else {
            next
        };

        plan.sent_points += sent;
        if sent < len {
            plan.cycle_complete = false;
        }
    }

    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Missing,
    Terminal(TaskStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped {
        reason: SkipReason,
    },
    Processed {
        emitted: usize,
        window_restarted: bool,
        cycle_completed: bool,
        progress: f64,
        status: TaskStatus,
        message: String,
        send: Option<SendReport>,
    },
    Failed {
        status: TaskStatus,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub source_host_id: String,
    pub outcome: TickOutcome,
}

impl TickReport {
    fn new(source_host_id: &str, outcome: TickOutcome) -> Self {
        Self {
            source_host_id: source_host_id.to_string(),
            outcome,
        }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, TickOutcome::Skipped { .. })
    }

    #[must_use]
    pub fn emitted(&self) -> usize {
        match self.outcome {
            TickOutcome::Processed { emitted, .. } => emitted,
            _ => 0,
        }
    }
}

/// Result of the send step, folded into the final status write.
enum SendResult {
    Nothing,
    Sent(SendReport),
    Failed(TaskStatus, String),
}

/// Replays stored history into a [`TelemetrySink`].
#[derive(Clone)]
pub struct ReplayEngine {
    store: TaskStore,
    sink: Arc<dyn TelemetrySink>,
    faults: Arc<FaultInjector>,
    filter: ItemFilter,
    window: Duration,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("sink", &self.sink.name())
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    #[must_use]
    pub fn new(
        store: TaskStore,
        sink: Arc<dyn TelemetrySink>,
        faults: Arc<FaultInjector>,
        filter: ItemFilter,
        window: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            faults,
            filter,
            window,
        }
    }

    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Run one tick at the current wall-clock time.
    pub async fn tick(&self, source_host_id: &str) -> TickReport {
        self.tick_at(source_host_id, unix_now()).await
    }

    /// Run one tick as if the time were `now` (epoch seconds).
    ///
    /// Never returns an error: failures are recorded on the task and in the
    /// report. After a failed send the task stays `failed_sending` or
    /// `failed_sending_setup` until a later tick sends successfully and moves
    /// it back to `replaying`.
    pub async fn tick_at(&self, source_host_id: &str, now: f64) -> TickReport {
        let span = crate::task_span!("replay_tick", source_host_id);
        async {
            match self.run_tick(source_host_id, now).await {
                Ok(report) => report,
                Err(e) => self.record_job_error(source_host_id, &e).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_tick(&self, source_host_id: &str, now: f64) -> Result<TickReport> {
        let Some(mut task) = self.store.get(source_host_id).await? else {
            debug!("No task; skipping tick");
            return Ok(TickReport::new(
                source_host_id,
                TickOutcome::Skipped {
                    reason: SkipReason::Missing,
                },
            ));
        };
        if task.status.is_terminal() {
            debug!(status = %task.status, "Task is terminal; skipping tick");
            return Ok(TickReport::new(
                source_host_id,
                TickOutcome::Skipped {
                    reason: SkipReason::Terminal(task.status),
                },
            ));
        }
        let Some(dest_host) = task.dest_host_name.clone().filter(|h| !h.is_empty()) else {
            let message = "Missing necessary data for replay.";
            error!("Task has no destination host name");
            self.store
                .set_status(source_host_id, TaskStatus::Failed, message)
                .await?;
            return Ok(TickReport::new(
                source_host_id,
                TickOutcome::Failed {
                    status: TaskStatus::Failed,
                    message: message.to_string(),
                },
            ));
        };

        let window_secs = self.window.as_secs_f64();
        let window_restarted = now - task.start_time >= window_secs;
        if window_restarted {
            let hours = self.window.as_secs() / 3600;
            info!(hours, "Replay window elapsed; restarting from the beginning");
            let message = format!("Replaying... (restarted after {hours} hours, time reset)");
            let restarted = self
                .store
                .modify(source_host_id, move |t| {
                    t.last_sent_index.clear();
                    t.start_time = now;
                    t.progress = 0.0;
                    t.message = message.clone();
                })
                .await?;
            if restarted.is_none() {
                return Ok(TickReport::new(
                    source_host_id,
                    TickOutcome::Skipped {
                        reason: SkipReason::Missing,
                    },
                ));
            }
            task.last_sent_index.clear();
            task.start_time = now;
        }

        let plan = match plan_tick(
            &task.history,
            &task.item_mapping,
            &task.last_sent_index,
            &self.filter,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                let message = format!("Error during data processing: {e}");
                error!(error = %e, "Replay processing failed");
                self.store
                    .set_status(source_host_id, TaskStatus::FailedProcessing, message.clone())
                    .await?;
                return Ok(TickReport::new(
                    source_host_id,
                    TickOutcome::Failed {
                        status: TaskStatus::FailedProcessing,
                        message,
                    },
                ));
            }
        };

        let clock = now.floor() as i64;
        let batch: Vec<Emission> = plan
            .staged
            .iter()
            .map(|staged| Emission {
                host: dest_host.clone(),
                key: staged.key.clone(),
                value: self
                    .faults
                    .inject(source_host_id, &staged.key, staged.value.clone()),
                clock,
            })
            .collect();

        // Cursor is committed before anything leaves the process.
        let cursor = plan.cursor.clone();
        self.store
            .modify(source_host_id, move |t| {
                t.last_sent_index = cursor.clone();
            })
            .await?;

        let send = if batch.is_empty() {
            SendResult::Nothing
        } else {
            self.send_batch(&batch).await
        };

        let progress = plan.progress();
        let cycle_completed = plan.cycle_complete;
        let emitted = batch.len();
        let (sent_points, total_points) = (plan.sent_points, plan.total_points);
        let send_for_status = match &send {
            SendResult::Nothing => None,
            SendResult::Sent(report) => Some(Ok(report.failed)),
            SendResult::Failed(status, message) => Some(Err((*status, message.clone()))),
        };

        let written = self
            .store
            .modify(source_host_id, move |t| {
                if t.status.is_terminal() {
                    return (t.status, t.message.clone());
                }
                let (status, message) = match &send_for_status {
                    Some(Err((status, message))) => (*status, message.clone()),
                    Some(Ok(failed)) if *failed > 0 => (
                        TaskStatus::Replaying,
                        format!("Replaying... (encountered {failed} send failures)"),
                    ),
                    _ if cycle_completed => (
                        TaskStatus::Replaying,
                        "Replaying... (looping with current timestamps)".to_string(),
                    ),
                    _ => (
                        TaskStatus::Replaying,
                        format!(
                            "Replaying... Sent {emitted} points this run. ({sent_points}/{total_points} total)"
                        ),
                    ),
                };
                if cycle_completed {
                    t.last_sent_index.clear();
                    t.progress = 0.0;
                } else {
                    t.progress = progress;
                }
                t.set_status(status, message.clone());
                (status, message)
            })
            .await?;
        let Some((status, message)) = written else {
            return Ok(TickReport::new(
                source_host_id,
                TickOutcome::Skipped {
                    reason: SkipReason::Missing,
                },
            ));
        };

        if cycle_completed {
            info!("Replay cycle complete; looping");
        }
        debug!(emitted, progress, %status, "Tick processed");

        Ok(TickReport::new(
            source_host_id,
            TickOutcome::Processed {
                emitted,
                window_restarted,
                cycle_completed,
                progress: if cycle_completed { 0.0 } else { progress },
                status,
                message,
                send: match send {
                    SendResult::Sent(report) => Some(report),
                    _ => None,
                },
            },
        ))
    }

    async fn send_batch(&self, batch: &[Emission]) -> SendResult {
        if let Err(e) = validate_batch(batch) {
            error!(error = %e, "Batch failed validation; nothing sent");
            return SendResult::Failed(
                TaskStatus::FailedSendingSetup,
                format!("Error during sending setup: {e}"),
            );
        }
        match self.sink.send(batch).await {
            Ok(report) => {
                if report.has_failures() {
                    warn!(
                        failed = report.failed,
                        total = report.total,
                        details = report.details.as_deref().unwrap_or(""),
                        "Sink reported partial failure"
                    );
                }
                SendResult::Sent(report)
            }
            Err(Error::Sink(e)) => {
                error!(sink = self.sink.name(), error = %e, "Send failed");
                let status = status_for_sink_error(&e);
                let message = if status == TaskStatus::FailedSendingSetup {
                    format!("Error during sending setup: {e}")
                } else {
                    format!("Error sending data: {e}")
                };
                SendResult::Failed(status, message)
            }
            Err(e) => {
                error!(sink = self.sink.name(), error = %e, "Send failed");
                SendResult::Failed(TaskStatus::FailedSending, format!("Error sending data: {e}"))
            }
        }
    }

    /// Best-effort `failed` write after an unexpected error.
    async fn record_job_error(&self, source_host_id: &str, e: &Error) -> TickReport {
        let message = format!("Job Error: {e}");
        error!(error = %e, "Replay tick failed");
        if let Err(secondary) = self
            .store
            .set_status(source_host_id, TaskStatus::Failed, message.clone())
            .await
        {
            error!(error = %secondary, "Could not record failed status");
        }
        TickReport::new(
            source_host_id,
            TickOutcome::Failed {
                status: TaskStatus::Failed,
                message,
            },
        )
    }
}

/// Map a sink error to the status a tick records for it.
#[must_use]
pub fn status_for_sink_error(e: &SinkError) -> TaskStatus {
    if e.is_setup() {
        TaskStatus::FailedSendingSetup
    } else {
        TaskStatus::FailedSending
    }
}
