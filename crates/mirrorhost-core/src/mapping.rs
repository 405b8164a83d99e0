//! Source item to destination key mapping.
//!
//! A rebuild always recomputes the whole mapping from the live item sets
//! and replaces the stored one; it never merges into it. Re-running with
//! unchanged remote state therefore yields an identical mapping.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LifecycleError, Result};
use crate::model::{ItemId, ItemMapping};
use crate::remote::{ItemRecord, MonitoringApi};
use crate::store::TaskStore;

/// Result of [`build_mapping`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingBuild {
    pub mapping: ItemMapping,
    /// Source items whose key has no destination item
    pub unmatched: Vec<(ItemId, String)>,
}

/// Map every source item whose key exists on the destination.
#[must_use]
pub fn build_mapping(source_items: &[ItemRecord], dest_items: &[ItemRecord]) -> MappingBuild {
    let dest_by_key: HashMap<&str, &ItemId> = dest_items
        .iter()
        .map(|item| (item.key.as_str(), &item.item_id))
        .collect();

    let mut build = MappingBuild::default();
    for item in source_items {
        if dest_by_key.contains_key(item.key.as_str()) {
            build.mapping.insert(item.item_id.clone(), item.key.clone());
        } else {
            build.unmatched.push((item.item_id.clone(), item.key.clone()));
        }
    }
    build
}

/// Outcome reported by both the manual and the automatic rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildOutcome {
    pub success: bool,
    pub message: String,
    pub mapped: usize,
    pub unmatched: usize,
}

impl RebuildOutcome {
    fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            message: format!("Mapping rebuild failed: {error}"),
            mapped: 0,
            unmatched: 0,
        }
    }
}

/// Recomputes and stores a task's item mapping.
#[derive(Clone)]
pub struct MappingRebuilder {
    store: TaskStore,
    source: Arc<dyn MonitoringApi>,
    dest: Arc<dyn MonitoringApi>,
}

impl MappingRebuilder {
    #[must_use]
    pub fn new(store: TaskStore, source: Arc<dyn MonitoringApi>, dest: Arc<dyn MonitoringApi>) -> Self {
        Self {
            store,
            source,
            dest,
        }
    }

    /// Rebuild the mapping of `source_host_id` against `dest_host_id`.
    ///
    /// Never returns an error; failures are reported in the outcome.
    pub async fn rebuild(&self, source_host_id: &str, dest_host_id: &str) -> RebuildOutcome {
        match self.try_rebuild(source_host_id, dest_host_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(source_host_id, dest_host_id, error = %e, "Mapping rebuild failed");
                RebuildOutcome::failed(e)
            }
        }
    }

    async fn try_rebuild(&self, source_host_id: &str, dest_host_id: &str) -> Result<RebuildOutcome> {
        let source_items = self.source.list_items(source_host_id).await?;
        let dest_items = self.dest.list_items(dest_host_id).await?;

        let build = build_mapping(&source_items, &dest_items);
        for (item_id, key) in &build.unmatched {
            warn!(
                source_host_id,
                dest_host_id,
                item_id = %item_id,
                item_key = %key,
                "Source item has no destination counterpart; leaving it unmapped"
            );
        }

        let mapped = build.mapping.len();
        let unmatched = build.unmatched.len();
        let mapping = build.mapping;
        let stored = self
            .store
            .modify(source_host_id, move |task| {
                task.item_mapping = mapping.clone();
            })
            .await?;
        if stored.is_none() {
            return Err(LifecycleError::TaskNotFound(source_host_id.to_string()).into());
        }

        info!(source_host_id, dest_host_id, mapped, unmatched, "Mapping rebuilt");
        Ok(RebuildOutcome {
            success: true,
            message: "Mapping rebuild successful.".to_string(),
            mapped,
            unmatched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ValueType;

    fn item(id: &str, key: &str) -> ItemRecord {
        ItemRecord {
            item_id: ItemId::from(id),
            key: key.to_string(),
            name: key.to_string(),
            value_type: Some(ValueType::Float),
            units: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn maps_only_keys_present_on_destination() {
        let source = vec![item("1", "agent.ping"), item("2", "custom.metric")];
        let dest = vec![item("91", "agent.ping"), item("95", "only.on.dest")];

        let build = build_mapping(&source, &dest);
        assert_eq!(build.mapping.len(), 1);
        assert_eq!(
            build.mapping.get(&ItemId::from("1")).map(String::as_str),
            Some("agent.ping")
        );
        assert_eq!(
            build.unmatched,
            vec![(ItemId::from("2"), "custom.metric".to_string())]
        );
    }

    #[test]
    fn build_is_deterministic() {
        let source = vec![item("3", "c"), item("1", "a"), item("2", "b")];
        let dest = vec![item("9", "b"), item("8", "a"), item("7", "c")];
        let first = serde_json::to_string(&build_mapping(&source, &dest).mapping).unwrap();
        let mut reversed = source.clone();
        reversed.reverse();
        let second = serde_json::to_string(&build_mapping(&reversed, &dest).mapping).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_destination_maps_nothing() {
        let build = build_mapping(&[item("1", "a")], &[]);
        assert!(build.mapping.is_empty());
        assert_eq!(build.unmatched.len(), 1);
    }
}
