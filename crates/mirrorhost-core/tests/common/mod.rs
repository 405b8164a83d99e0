//! Shared test infrastructure for mirrorhost-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{FakeMonitoringApi, RecordingSink};
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirrorhost_core::config::StorageConfig;
use mirrorhost_core::error::{RemoteError, Result, SinkError};
use mirrorhost_core::faults::FaultInjector;
use mirrorhost_core::filter::ItemFilter;
use mirrorhost_core::model::{ItemId, ItemMapping, MetricValue};
use mirrorhost_core::remote::{
    ClonedHost, CreatedHost, DestinationHostSpec, HistoryQuery, HistoryRecord, HostRecord,
    ItemRecord, MonitoringApi, RemoteFuture, SOURCE_HOST_MACRO, SourceHostConfig, ValueType,
};
use mirrorhost_core::replay::ReplayEngine;
use mirrorhost_core::sink::{Emission, SendReport, SinkFuture, TelemetrySink};
use mirrorhost_core::store::TaskStore;

// ============================================================================
// Builders
// ============================================================================

pub fn item(id: &str, key: &str, name: &str, value_type: Option<ValueType>) -> ItemRecord {
    ItemRecord {
        item_id: ItemId::from(id),
        key: key.to_string(),
        name: name.to_string(),
        value_type,
        units: String::new(),
        description: String::new(),
    }
}

pub fn float_item(id: &str, key: &str) -> ItemRecord {
    item(id, key, key, Some(ValueType::Float))
}

pub fn host(id: &str, name: &str) -> HostRecord {
    HostRecord {
        host_id: id.to_string(),
        host: name.to_string(),
        name: name.to_string(),
    }
}

pub fn record(item_id: &str, clock: i64, value: impl Into<MetricValue>) -> HistoryRecord {
    HistoryRecord {
        item_id: ItemId::from(item_id),
        clock,
        value: value.into(),
    }
}

/// Store in a fresh temp dir. Keep the `TempDir` alive for the test.
pub fn temp_store() -> (tempfile::TempDir, TaskStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TaskStore::open(dir.path().join("tasks.db"), &StorageConfig::default())
        .expect("open store");
    (dir, store)
}

pub fn engine(store: &TaskStore, sink: Arc<RecordingSink>, window: Duration) -> ReplayEngine {
    ReplayEngine::new(
        store.clone(),
        sink,
        Arc::new(FaultInjector::disabled()),
        ItemFilter::default(),
        window,
    )
}

// ============================================================================
// FakeMonitoringApi
// ============================================================================

#[derive(Default)]
struct FakeState {
    hosts: HashMap<String, HostRecord>,
    configs: HashMap<String, SourceHostConfig>,
    items: HashMap<String, Vec<ItemRecord>>,
    history: Vec<HistoryRecord>,
    /// Appended to every history response regardless of the query
    stray_history: Vec<HistoryRecord>,
    item_types: HashMap<ItemId, ValueType>,
    groups: HashMap<String, String>,
    templates: HashMap<String, String>,
    cloned: Vec<ClonedHost>,
    created: Vec<DestinationHostSpec>,
    failing_history_types: HashSet<ValueType>,
    fail_create: bool,
    next_id: u64,
}

/// In-memory monitoring server.
///
/// `create_host` registers a host named `clone-<source name>` carrying one
/// item per blueprint and returns a mapping over those blueprints.
pub struct FakeMonitoringApi {
    name: String,
    state: Mutex<FakeState>,
}

impl FakeMonitoringApi {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                next_id: 50_000,
                ..FakeState::default()
            }),
        }
    }

    /// Register a host with direct items.
    pub fn with_host(self, host: HostRecord, items: Vec<ItemRecord>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for item in &items {
                if let Some(vt) = item.value_type {
                    state.item_types.insert(item.item_id.clone(), vt);
                }
            }
            state.configs.insert(
                host.host_id.clone(),
                SourceHostConfig {
                    host: host.clone(),
                    host_items: items.clone(),
                    template_items: Vec::new(),
                    groups: vec!["Linux servers".to_string()],
                    templates: Vec::new(),
                    macros: Vec::new(),
                },
            );
            state.items.insert(host.host_id.clone(), items);
            state.hosts.insert(host.host_id.clone(), host);
        }
        self
    }

    pub fn with_history(self, records: Vec<HistoryRecord>) -> Self {
        self.state.lock().unwrap().history.extend(records);
        self
    }

    /// Answer every history query with these extra records as well.
    pub fn with_stray_history(self, records: Vec<HistoryRecord>) -> Self {
        self.state.lock().unwrap().stray_history.extend(records);
        self
    }

    pub fn with_group(self, name: &str, id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(name.to_string(), id.to_string());
        self
    }

    pub fn with_cloned_host(self, host: ClonedHost) -> Self {
        self.state.lock().unwrap().cloned.push(host);
        self
    }

    pub fn set_items(&self, host_id: &str, items: Vec<ItemRecord>) {
        self.state
            .lock()
            .unwrap()
            .items
            .insert(host_id.to_string(), items);
    }

    pub fn fail_history_for(&self, value_type: ValueType) {
        self.state
            .lock()
            .unwrap()
            .failing_history_types
            .insert(value_type);
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn created_specs(&self) -> Vec<DestinationHostSpec> {
        self.state.lock().unwrap().created.clone()
    }

    fn request_error(&self, message: &str) -> mirrorhost_core::Error {
        RemoteError::Request {
            server: self.name.clone(),
            message: message.to_string(),
        }
        .into()
    }
}

impl MonitoringApi for FakeMonitoringApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_host<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, Option<HostRecord>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().hosts.get(host_id).cloned()) })
    }

    fn get_host_config<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, SourceHostConfig> {
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .configs
                .get(host_id)
                .cloned()
                .ok_or_else(|| {
                    RemoteError::HostNotFound {
                        server: self.name.clone(),
                        host_id: host_id.to_string(),
                    }
                    .into()
                })
        })
    }

    fn list_items<'a>(&'a self, host_id: &'a str) -> RemoteFuture<'a, Vec<ItemRecord>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .items
                .get(host_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn resolve_groups<'a>(&'a self, names: &'a [String]) -> RemoteFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(names
                .iter()
                .filter_map(|name| state.groups.get(name).cloned())
                .collect())
        })
    }

    fn resolve_templates<'a>(&'a self, names: &'a [String]) -> RemoteFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(names
                .iter()
                .filter_map(|name| state.templates.get(name).cloned())
                .collect())
        })
    }

    fn create_host<'a>(&'a self, spec: &'a DestinationHostSpec) -> RemoteFuture<'a, CreatedHost> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                drop(state);
                return Err(self.request_error("host.create rejected"));
            }
            state.created.push(spec.clone());
            state.next_id += 1;
            let host_id = state.next_id.to_string();
            let host_name = format!("clone-{}", spec.source_host_name);

            let mut items = Vec::new();
            let mut mapping = ItemMapping::new();
            for blueprint in &spec.items {
                state.next_id += 1;
                items.push(item(
                    &state.next_id.to_string(),
                    &blueprint.key,
                    &blueprint.name,
                    Some(blueprint.value_type),
                ));
                mapping.insert(blueprint.source_item_id.clone(), blueprint.key.clone());
            }
            state.items.insert(host_id.clone(), items);
            state
                .hosts
                .insert(host_id.clone(), host(&host_id, &host_name));
            let hint = spec
                .macros
                .iter()
                .find(|m| m.name == SOURCE_HOST_MACRO)
                .map(|m| m.value.clone());
            state.cloned.push(ClonedHost {
                host_id: host_id.clone(),
                host_name: host_name.clone(),
                source_host_hint: hint,
            });

            Ok(CreatedHost {
                host_id,
                host_name,
                item_mapping: mapping,
            })
        })
    }

    fn fetch_history<'a>(&'a self, query: &'a HistoryQuery) -> RemoteFuture<'a, Vec<HistoryRecord>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            if state.failing_history_types.contains(&query.value_type) {
                drop(state);
                return Err(self.request_error("history.get failed"));
            }
            let wanted: HashSet<&ItemId> = query.item_ids.iter().collect();
            Ok(state
                .history
                .iter()
                .filter(|r| wanted.contains(&r.item_id))
                .filter(|r| state.item_types.get(&r.item_id) == Some(&query.value_type))
                .filter(|r| r.clock >= query.time_from && r.clock <= query.time_till)
                .chain(state.stray_history.iter())
                .cloned()
                .collect())
        })
    }

    fn list_cloned_hosts(&self) -> RemoteFuture<'_, Vec<ClonedHost>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().cloned.clone()) })
    }
}

// ============================================================================
// RecordingSink
// ============================================================================

#[derive(Debug, Clone)]
pub enum SinkBehavior {
    Accept,
    /// Report this many failed values per batch
    PartialFailure(u64),
    Fail(SinkError),
}

/// Sink that records every batch it is handed.
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<Emission>>>,
    behavior: Mutex<SinkBehavior>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            behavior: Mutex::new(SinkBehavior::Accept),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, behavior: SinkBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn batches(&self) -> Vec<Vec<Emission>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.batches().into_iter().flatten().collect()
    }

    /// Values per destination key, in send order.
    pub fn values_by_key(&self) -> BTreeMap<String, Vec<MetricValue>> {
        let mut out: BTreeMap<String, Vec<MetricValue>> = BTreeMap::new();
        for e in self.emissions() {
            out.entry(e.key).or_default().push(e.value);
        }
        out
    }
}

impl TelemetrySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn send<'a>(&'a self, batch: &'a [Emission]) -> SinkFuture<'a> {
        Box::pin(async move {
            let behavior = self.behavior.lock().unwrap().clone();
            if let SinkBehavior::Fail(e) = behavior {
                return Err(e.into());
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            let total = batch.len() as u64;
            let failed = match behavior {
                SinkBehavior::PartialFailure(n) => n.min(total),
                _ => 0,
            };
            Ok(SendReport {
                processed: total - failed,
                failed,
                total,
                seconds_spent: Some(0.0),
                details: None,
            })
        })
    }
}

pub type TestResult = Result<()>;
