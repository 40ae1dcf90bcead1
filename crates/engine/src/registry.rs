//! Published flow versions. A version, once referenced by an execution,
//! is never mutated or removed; `latest` only steers new executions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use flowline_core::types::{FlowId, StoreId};
use flowline_graph::ValidGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Archived,
}

struct FlowRecord {
    store_id: StoreId,
    status: FlowStatus,
    latest: u32,
    versions: BTreeMap<u32, Arc<ValidGraph>>,
    published_at: DateTime<Utc>,
}

/// Operator-facing listing row.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub flow_id: FlowId,
    pub name: String,
    pub store_id: StoreId,
    pub status: FlowStatus,
    pub latest_version: u32,
    pub node_count: usize,
    pub published_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct FlowRegistry {
    flows: DashMap<FlowId, FlowRecord>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a validated graph under the next version number for its
    /// flow id. Republishing an archived flow reactivates it.
    pub fn publish(&self, graph: ValidGraph, store_id: StoreId) -> u32 {
        let flow_id = graph.id();
        let graph = Arc::new(graph);
        match self.flows.entry(flow_id) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                record.latest += 1;
                record.status = FlowStatus::Active;
                record.store_id = store_id;
                record.versions.insert(record.latest, graph);
                record.latest
            }
            Entry::Vacant(slot) => {
                slot.insert(FlowRecord {
                    store_id,
                    status: FlowStatus::Active,
                    latest: 1,
                    versions: BTreeMap::from([(1, graph)]),
                    published_at: Utc::now(),
                });
                1
            }
        }
    }

    /// Marks a flow archived. Existing executions keep their captured
    /// version; the caller is responsible for cancelling them.
    pub fn archive(&self, flow_id: FlowId) -> bool {
        match self.flows.get_mut(&flow_id) {
            Some(mut record) => {
                record.status = FlowStatus::Archived;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, flow_id: FlowId) -> Option<FlowStatus> {
        self.flows.get(&flow_id).map(|r| r.status)
    }

    pub fn graph(&self, flow_id: FlowId, version: u32) -> Option<Arc<ValidGraph>> {
        self.flows
            .get(&flow_id)
            .and_then(|r| r.versions.get(&version).cloned())
    }

    /// The latest version of an active flow, for new executions.
    pub fn latest_active(&self, flow_id: FlowId) -> Option<(u32, Arc<ValidGraph>)> {
        let record = self.flows.get(&flow_id)?;
        if record.status != FlowStatus::Active {
            return None;
        }
        let graph = record.versions.get(&record.latest).cloned()?;
        Some((record.latest, graph))
    }

    /// Graph and owning store for a pinned execution version. Serves
    /// archived flows too; in-flight entries finish on their version.
    pub fn execution_view(
        &self,
        flow_id: FlowId,
        version: u32,
    ) -> Option<(Arc<ValidGraph>, StoreId)> {
        let record = self.flows.get(&flow_id)?;
        let graph = record.versions.get(&version).cloned()?;
        Some((graph, record.store_id.clone()))
    }

    pub fn list(&self) -> Vec<FlowSummary> {
        self.flows
            .iter()
            .map(|entry| {
                let record = entry.value();
                let node_count = record
                    .versions
                    .get(&record.latest)
                    .map(|g| g.node_count())
                    .unwrap_or(0);
                let name = record
                    .versions
                    .get(&record.latest)
                    .map(|g| g.name().to_string())
                    .unwrap_or_default();
                FlowSummary {
                    flow_id: *entry.key(),
                    name,
                    store_id: record.store_id.clone(),
                    status: record.status,
                    latest_version: record.latest,
                    node_count,
                    published_at: record.published_at,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
