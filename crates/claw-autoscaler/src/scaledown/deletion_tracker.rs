//! Bookkeeping of node deletions in flight and their results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::status::NodeDeleteResult;
use crate::types::NodeGroupId;

#[derive(Debug, Clone)]
struct InFlight {
    group: NodeGroupId,
    drain: bool,
}

#[derive(Debug, Clone)]
struct Outcome {
    result: NodeDeleteResult,
    time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerState {
    in_flight: BTreeMap<String, InFlight>,
    results: BTreeMap<String, Outcome>,
    evictions: Vec<(String, DateTime<Utc>)>,
    last_delete: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

/// Tracks deletions started by the actuator.
///
/// Shared between the planner, which needs in-flight counts, and the
/// actuator, which records starts and ends.
#[derive(Debug, Default)]
pub struct NodeDeletionTracker {
    state: Mutex<TrackerState>,
}

impl NodeDeletionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an empty-node deletion.
    pub fn start_deletion(&self, group: &NodeGroupId, node: &str) {
        self.start(group, node, false);
    }

    /// Records the start of a deletion that drains the node first.
    pub fn start_deletion_with_drain(&self, group: &NodeGroupId, node: &str) {
        self.start(group, node, true);
    }

    fn start(&self, group: &NodeGroupId, node: &str, drain: bool) {
        self.state.lock().in_flight.insert(
            node.to_string(),
            InFlight {
                group: group.clone(),
                drain,
            },
        );
    }

    /// Records the end of a deletion.
    pub fn end_deletion(&self, node: &str, result: NodeDeleteResult, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.in_flight.remove(node);
        match &result {
            NodeDeleteResult::Deleted => state.last_delete = Some(now),
            NodeDeleteResult::Failed(reason) => {
                debug!(node, %reason, "node deletion failed");
                state.last_failure = Some(now);
            }
            NodeDeleteResult::Deferred => {}
        }
        state
            .results
            .insert(node.to_string(), Outcome { result, time: now });
    }

    /// Deletions in flight in one group.
    #[must_use]
    pub fn deletions_count(&self, group: &NodeGroupId) -> usize {
        self.state
            .lock()
            .in_flight
            .values()
            .filter(|f| &f.group == group)
            .count()
    }

    /// Deletions in flight.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drains in flight.
    #[must_use]
    pub fn drains_count(&self) -> usize {
        self.state.lock().in_flight.values().filter(|f| f.drain).count()
    }

    /// Returns true if the node is being deleted.
    #[must_use]
    pub fn is_being_deleted(&self, node: &str) -> bool {
        self.state.lock().in_flight.contains_key(node)
    }

    /// Names of nodes being deleted.
    #[must_use]
    pub fn deletions_in_progress(&self) -> Vec<String> {
        self.state.lock().in_flight.keys().cloned().collect()
    }

    /// Names of nodes being drained.
    #[must_use]
    pub fn draining_nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .in_flight
            .iter()
            .filter(|(_, f)| f.drain)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Records an evicted pod.
    pub fn register_eviction(&self, pod_key: &str, now: DateTime<Utc>) {
        self.state.lock().evictions.push((pod_key.to_string(), now));
    }

    /// Pods evicted at or after `since`.
    #[must_use]
    pub fn recent_evictions(&self, since: DateTime<Utc>) -> Vec<String> {
        self.state
            .lock()
            .evictions
            .iter()
            .filter(|(_, at)| *at >= since)
            .map(|(pod, _)| pod.clone())
            .collect()
    }

    /// Latest result per node.
    #[must_use]
    pub fn results(&self) -> BTreeMap<String, NodeDeleteResult> {
        self.state
            .lock()
            .results
            .iter()
            .map(|(n, o)| (n.clone(), o.result.clone()))
            .collect()
    }

    /// Drops results and evictions recorded at or before `cutoff`.
    pub fn clear_results_not_newer_than(&self, cutoff: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.results.retain(|_, o| o.time > cutoff);
        state.evictions.retain(|(_, at)| *at > cutoff);
    }

    /// Time of the last successful deletion.
    #[must_use]
    pub fn last_delete_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_delete
    }

    /// Time of the last failed deletion.
    #[must_use]
    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_failure
    }
}
