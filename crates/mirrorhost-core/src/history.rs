//! History snapshot collection from the source server.
//!
//! Items are grouped by value type and fetched with one query per type.
//! A type whose query fails is logged and skipped; the rest of the snapshot
//! is still usable. Records for items that were not asked for are dropped.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

use crate::filter::ItemFilter;
use crate::model::{History, HistoryPoint, ItemId};
use crate::remote::{HistoryQuery, ItemRecord, MonitoringApi, ValueType};

/// A fetched history snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedHistory {
    /// Per-item samples ordered by clock. Items without samples are absent.
    pub history: History,
    /// Earliest sample clock across all items
    pub earliest: Option<i64>,
    pub point_count: usize,
    /// Value types whose query failed
    pub failed_types: Vec<ValueType>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryCollector {
    filter: ItemFilter,
}

impl HistoryCollector {
    #[must_use]
    pub fn new(filter: ItemFilter) -> Self {
        Self { filter }
    }

    /// Fetch history for `items` over `[time_from, time_till]`.
    pub async fn collect(
        &self,
        api: &dyn MonitoringApi,
        items: &[ItemRecord],
        time_from: i64,
        time_till: i64,
    ) -> CollectedHistory {
        let mut by_type: BTreeMap<ValueType, Vec<ItemId>> = BTreeMap::new();
        for item in items {
            if self.filter.should_skip(&item.name, &item.key) {
                continue;
            }
            match item.value_type {
                Some(vt) => by_type.entry(vt).or_default().push(item.item_id.clone()),
                None => debug!(item_id = %item.item_id, "No history type for item"),
            }
        }

        let mut collected = CollectedHistory::default();
        for (value_type, item_ids) in by_type {
            let queried: HashSet<ItemId> = item_ids.iter().cloned().collect();
            let query = HistoryQuery {
                value_type,
                item_ids,
                time_from,
                time_till,
            };
            match api.fetch_history(&query).await {
                Ok(records) => {
                    debug!(
                        server = api.name(),
                        history_type = value_type.history_type(),
                        records = records.len(),
                        "Fetched history"
                    );
                    for record in records {
                        if !queried.contains(&record.item_id) {
                            debug!(item_id = %record.item_id, "Dropping history for unrequested item");
                            continue;
                        }
                        collected
                            .history
                            .entry(record.item_id)
                            .or_default()
                            .push(HistoryPoint {
                                clock: record.clock,
                                value: record.value,
                            });
                    }
                }
                Err(e) => {
                    warn!(
                        server = api.name(),
                        history_type = value_type.history_type(),
                        error = %e,
                        "History query failed; skipping value type"
                    );
                    collected.failed_types.push(value_type);
                }
            }
        }

        for points in collected.history.values_mut() {
            points.sort_by_key(|p| p.clock);
        }
        collected.earliest = collected
            .history
            .values()
            .filter_map(|points| points.first().map(|p| p.clock))
            .min();
        collected.point_count = collected.history.values().map(Vec::len).sum();

        info!(
            items = collected.history.len(),
            points = collected.point_count,
            failed_types = collected.failed_types.len(),
            "History snapshot collected"
        );
        collected
    }
}
