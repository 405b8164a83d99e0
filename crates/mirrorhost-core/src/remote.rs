//! Monitoring server API boundary.
//!
//! The replication pipeline talks to a source and a destination monitoring
//! server through [`MonitoringApi`]. Concrete clients (JSON-RPC over HTTP,
//! obfuscation of names and interfaces, trigger creation) live outside this
//! crate; everything here is the data shape crossing that boundary plus the
//! pure helpers the pipeline applies to it.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::filter::ItemFilter;
use crate::model::{ItemId, ItemMapping, MetricValue};

/// Destination host group every cloned host is placed in.
pub const CLONE_GROUP: &str = "clonedfordemo";

/// Group used when none of the source groups resolve on the destination.
pub const FALLBACK_GROUP: &str = "Zabbix servers";

/// Host macro carrying the source host id on a cloned host.
pub const SOURCE_HOST_MACRO: &str = "{$SOURCE_HOST_ID}";

/// Boxed future returned by [`MonitoringApi`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Item value type; history is partitioned by the same codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Float,
    Character,
    Log,
    Unsigned,
    Text,
}

impl ValueType {
    pub const ALL: [Self; 5] = [
        Self::Float,
        Self::Character,
        Self::Log,
        Self::Unsigned,
        Self::Text,
    ];

    /// Parse the wire code (`"0"`..`"4"`). Other codes cannot be replayed.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Self::Float),
            "1" => Some(Self::Character),
            "2" => Some(Self::Log),
            "3" => Some(Self::Unsigned),
            "4" => Some(Self::Text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Float => 0,
            Self::Character => 1,
            Self::Log => 2,
            Self::Unsigned => 3,
            Self::Text => 4,
        }
    }

    /// History table code to query for items of this type.
    #[must_use]
    pub const fn history_type(self) -> u8 {
        self.code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: String,
    /// Technical host name
    pub host: String,
    /// Visible name
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: ItemId,
    pub key: String,
    pub name: String,
    /// `None` when the server reported a code trappers cannot carry.
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMacro {
    pub name: String,
    pub value: String,
}

/// Everything fetched from the source server for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHostConfig {
    pub host: HostRecord,
    /// Items defined directly on the host
    pub host_items: Vec<ItemRecord>,
    /// Items inherited from linked templates
    pub template_items: Vec<ItemRecord>,
    /// Host group names
    pub groups: Vec<String>,
    /// Linked template names
    pub templates: Vec<String>,
    pub macros: Vec<HostMacro>,
}

impl SourceHostConfig {
    /// Host and template items, first occurrence of each item id wins.
    #[must_use]
    pub fn all_items(&self) -> Vec<ItemRecord> {
        let mut seen = HashSet::new();
        self.host_items
            .iter()
            .chain(&self.template_items)
            .filter(|item| seen.insert(item.item_id.clone()))
            .cloned()
            .collect()
    }
}

/// Trapper item to create on the destination host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapperItemBlueprint {
    pub source_item_id: ItemId,
    pub key: String,
    pub name: String,
    pub value_type: ValueType,
    pub units: String,
    pub description: String,
}

/// Request to create the destination host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationHostSpec {
    pub source_host_id: String,
    pub source_host_name: String,
    pub group_ids: Vec<String>,
    pub template_ids: Vec<String>,
    pub items: Vec<TrapperItemBlueprint>,
    pub macros: Vec<HostMacro>,
    /// Every source item (host and template), for the initial mapping
    pub source_items: Vec<ItemRecord>,
}

/// Result of destination host creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedHost {
    pub host_id: String,
    /// Name replay emits under (possibly obfuscated)
    pub host_name: String,
    /// Initial mapping computed by the creating client
    pub item_mapping: ItemMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub value_type: ValueType,
    pub item_ids: Vec<ItemId>,
    pub time_from: i64,
    pub time_till: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item_id: ItemId,
    pub clock: i64,
    pub value: MetricValue,
}

/// Destination host found in the clone group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedHost {
    pub host_id: String,
    pub host_name: String,
    /// Value of the source-host macro, when present
    pub source_host_hint: Option<String>,
}

/// A monitoring server the pipeline reads from or writes to.
pub trait MonitoringApi: Send + Sync {
    /// Server label used in logs and error messages.
    fn name(&self) -> &str;

    fn get_host<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, Option<HostRecord>>;

    fn get_host_config<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, SourceHostConfig>;

    /// Every item on the host, inherited ones included.
    fn list_items<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, Vec<ItemRecord>>;

    /// Resolve (creating when missing) host groups by name, returning ids.
    fn resolve_groups<'a>(&'a self, names: &'a [String]) -> RemoteFuture<'a, Vec<String>>;

    /// Resolve templates by name, returning ids of those that exist.
    fn resolve_templates<'a>(&'a self, names: &'a [String]) -> RemoteFuture<'a, Vec<String>>;

    fn create_host<'a>(&'a self, spec: &'a DestinationHostSpec) -> RemoteFuture<'a, CreatedHost>;

    fn fetch_history<'a>(&'a self, query: &'a HistoryQuery) -> RemoteFuture<'a, Vec<HistoryRecord>>;

    /// Hosts in [`CLONE_GROUP`].
    fn list_cloned_hosts(&self) -> RemoteFuture<'_, Vec<ClonedHost>>;
}

/// Convert direct host items into trapper blueprints.
///
/// Filtered items and items whose value type a trapper cannot carry are
/// dropped.
#[must_use]
pub fn trapper_blueprints(items: &[ItemRecord], filter: &ItemFilter) -> Vec<TrapperItemBlueprint> {
    items
        .iter()
        .filter(|item| !filter.should_skip(&item.name, &item.key))
        .filter_map(|item| {
            let Some(value_type) = item.value_type else {
                warn!(
                    item_id = %item.item_id,
                    item_key = %item.key,
                    "Skipping item with a value type trappers cannot carry"
                );
                return None;
            };
            Some(TrapperItemBlueprint {
                source_item_id: item.item_id.clone(),
                key: item.key.clone(),
                name: item.name.clone(),
                value_type,
                units: item.units.clone(),
                description: item.description.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMismatch {
    pub key: String,
    pub source_name: String,
    pub dest_name: String,
}

/// Diagnostic diff between source and destination items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemComparison {
    /// Source keys with no destination item
    pub missing_on_destination: Vec<String>,
    pub name_mismatches: Vec<NameMismatch>,
}

impl ItemComparison {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_on_destination.is_empty() && self.name_mismatches.is_empty()
    }
}

/// Compare items by key. Results are sorted by key.
#[must_use]
pub fn compare_items(source: &[ItemRecord], dest: &[ItemRecord]) -> ItemComparison {
    let dest_by_key: BTreeMap<&str, &ItemRecord> =
        dest.iter().map(|item| (item.key.as_str(), item)).collect();
    let mut comparison = ItemComparison::default();

    let source_by_key: BTreeMap<&str, &ItemRecord> =
        source.iter().map(|item| (item.key.as_str(), item)).collect();
    for (key, item) in source_by_key {
        match dest_by_key.get(key) {
            None => comparison.missing_on_destination.push(key.to_string()),
            Some(dest_item) if dest_item.name != item.name => {
                comparison.name_mismatches.push(NameMismatch {
                    key: key.to_string(),
                    source_name: item.name.clone(),
                    dest_name: dest_item.name.clone(),
                });
            }
            Some(_) => {}
        }
    }
    comparison
}
