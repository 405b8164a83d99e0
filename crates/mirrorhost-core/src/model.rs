//! Replication task records and the typed maps they carry.
//!
//! A [`ReplicationTask`] is keyed by source host id and holds everything the
//! replay engine needs between ticks: the history snapshot, the
//! source-item to destination-key mapping, and the per-item replay cursor.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch with sub-second precision.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Canonical item identifier.
///
/// Monitoring APIs hand out numeric ids; they are converted to this string
/// form once, at the API boundary, so every map in a task agrees on keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A single telemetry value.
///
/// Serialized untagged, so stored history stays plain JSON (`5`, `7.5`,
/// `"up"`, `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Parse a value as monitoring APIs return it (always a string).
    ///
    /// Integer first, then finite float, else text.
    #[must_use]
    pub fn parse_lossy(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Integer(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Self::Float(f),
            _ => Self::Text(raw.to_string()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// One recorded sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Original sample time (epoch seconds). Never emitted; replay stamps `now`.
    pub clock: i64,
    pub value: MetricValue,
}

impl HistoryPoint {
    #[must_use]
    pub fn new(clock: i64, value: impl Into<MetricValue>) -> Self {
        Self {
            clock,
            value: value.into(),
        }
    }
}

/// Time-ordered samples per source item.
pub type History = BTreeMap<ItemId, Vec<HistoryPoint>>;

/// Source item id to destination item key.
pub type ItemMapping = BTreeMap<ItemId, String>;

/// Index of the last emitted sample per item.
///
/// An absent item means nothing has been sent this cycle (index -1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayCursor(BTreeMap<ItemId, usize>);

impl ReplayCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sent index, or `None` for "-1".
    #[must_use]
    pub fn last_sent(&self, item: &ItemId) -> Option<usize> {
        self.0.get(item).copied()
    }

    /// Index the next tick would emit for this item.
    #[must_use]
    pub fn next_index(&self, item: &ItemId) -> usize {
        self.last_sent(item).map_or(0, |i| i + 1)
    }

    /// Number of samples already sent for this item this cycle.
    #[must_use]
    pub fn sent_count(&self, item: &ItemId) -> usize {
        self.next_index(item)
    }

    pub fn advance(&mut self, item: ItemId, index: usize) {
        self.0.insert(item, index);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, usize)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }
}

impl FromIterator<(ItemId, usize)> for ReplayCursor {
    fn from_iter<I: IntoIterator<Item = (ItemId, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    FetchingSourceConfig,
    MappingIds,
    ModifyingItems,
    CreatingDestHost,
    ComparingItems,
    FetchingHistory,
    StoringData,
    SchedulingReplay,
    Replicating,
    Relinking,
    RebuildingMapping,
    Replaying,
    Completed,
    Failed,
    FailedProcessing,
    FailedSending,
    FailedSendingSetup,
}

impl TaskStatus {
    pub const ALL: [Self; 18] = [
        Self::Starting,
        Self::FetchingSourceConfig,
        Self::MappingIds,
        Self::ModifyingItems,
        Self::CreatingDestHost,
        Self::ComparingItems,
        Self::FetchingHistory,
        Self::StoringData,
        Self::SchedulingReplay,
        Self::Replicating,
        Self::Relinking,
        Self::RebuildingMapping,
        Self::Replaying,
        Self::Completed,
        Self::Failed,
        Self::FailedProcessing,
        Self::FailedSending,
        Self::FailedSendingSetup,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::FetchingSourceConfig => "fetching_source_config",
            Self::MappingIds => "mapping_ids",
            Self::ModifyingItems => "modifying_items",
            Self::CreatingDestHost => "creating_dest_host",
            Self::ComparingItems => "comparing_items",
            Self::FetchingHistory => "fetching_history",
            Self::StoringData => "storing_data",
            Self::SchedulingReplay => "scheduling_replay",
            Self::Replicating => "replicating",
            Self::Relinking => "relinking",
            Self::RebuildingMapping => "rebuilding_mapping",
            Self::Replaying => "replaying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedProcessing => "failed_processing",
            Self::FailedSending => "failed_sending",
            Self::FailedSendingSetup => "failed_sending_setup",
        }
    }

    /// Ticks skip terminal tasks without touching them.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Tick-local failure states; the next tick may recover from these.
    #[must_use]
    pub const fn is_tick_failure(self) -> bool {
        matches!(
            self,
            Self::FailedProcessing | Self::FailedSending | Self::FailedSendingSetup
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// Durable replication state for one source host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub source_host_id: String,
    pub dest_host_id: Option<String>,
    pub dest_host_name: Option<String>,
    pub status: TaskStatus,
    pub message: String,
    /// Start of the current replay window (epoch seconds).
    pub start_time: f64,
    /// Earliest sample in the snapshot. Informational only.
    pub first_history_timestamp: Option<i64>,
    pub history: History,
    pub item_mapping: ItemMapping,
    pub last_sent_index: ReplayCursor,
    /// Stored and reported, never read by replay.
    pub cycle_offset: i64,
    /// Percent of replayable samples sent this cycle, `[0, 100]`.
    pub progress: f64,
}

impl ReplicationTask {
    /// Fresh task in `starting`.
    #[must_use]
    pub fn new(source_host_id: impl Into<String>, now: f64) -> Self {
        Self {
            source_host_id: source_host_id.into(),
            dest_host_id: None,
            dest_host_name: None,
            status: TaskStatus::Starting,
            message: "Replication task created.".to_string(),
            start_time: now,
            first_history_timestamp: None,
            history: History::new(),
            item_mapping: ItemMapping::new(),
            last_sent_index: ReplayCursor::new(),
            cycle_offset: 0,
            progress: 0.0,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus, message: impl Into<String>) {
        self.status = status;
        self.message = message.into();
    }

    /// Reset replay bookkeeping for a new run (re-initialization or relink).
    pub fn reset_replay(&mut self, now: f64) {
        self.start_time = now;
        self.cycle_offset = 0;
        self.last_sent_index.clear();
        self.progress = 0.0;
    }

    #[must_use]
    pub fn history_point_count(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn summary(&self) -> TaskSummary {
        TaskSummary::from(self)
    }
}

/// Status view of a task without the history body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub source_host_id: String,
    pub dest_host_id: Option<String>,
    pub dest_host_name: Option<String>,
    pub status: TaskStatus,
    pub message: String,
    pub start_time: f64,
    /// `start_time` rendered as RFC 3339 UTC.
    pub start_time_utc: Option<String>,
    pub first_history_timestamp: Option<i64>,
    pub history_items: usize,
    pub history_points: usize,
    pub mapped_items: usize,
    pub cursor_items: usize,
    pub cycle_offset: i64,
    pub progress: f64,
}

impl From<&ReplicationTask> for TaskSummary {
    fn from(task: &ReplicationTask) -> Self {
        let secs = task.start_time.floor() as i64;
        let nanos = ((task.start_time - task.start_time.floor()) * 1e9) as u32;
        let start_time_utc = chrono::DateTime::from_timestamp(secs, nanos)
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

        Self {
            source_host_id: task.source_host_id.clone(),
            dest_host_id: task.dest_host_id.clone(),
            dest_host_name: task.dest_host_name.clone(),
            status: task.status,
            message: task.message.clone(),
            start_time: task.start_time,
            start_time_utc,
            first_history_timestamp: task.first_history_timestamp,
            history_items: task.history.len(),
            history_points: task.history_point_count(),
            mapped_items: task.item_mapping.len(),
            cursor_items: task.last_sent_index.len(),
            cycle_offset: task.cycle_offset,
            progress: task.progress,
        }
    }
}
