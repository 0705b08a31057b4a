//! Scale-down execution.
//!
//! Selected nodes are tainted up front so the scheduler stops using them.
//! Empty nodes are then deleted per node group; the others are drained by
//! eviction and deleted one by one. Deletions run concurrently, bounded by
//! the deletion and drain semaphores, and are all awaited before the
//! iteration ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::budgets::{BudgetProcessor, NodeGroupView};
use super::deletion_tracker::NodeDeletionTracker;
use super::pdb::RemainingPdbTracker;
use super::simulator::NodeToBeRemoved;
use crate::cloudprovider::{find_node_group, CloudProvider};
use crate::config::ScaleDownOptions;
use crate::error::{AutoscalerError, Result};
use crate::events::{
    Event, EventObject, EventRecorder, REASON_SCALE_DOWN, REASON_SCALE_DOWN_DEFERRED,
    REASON_SCALE_DOWN_FAILED,
};
use crate::kube::{to_be_deleted_taint, KubeClient, TO_BE_DELETED_TAINT};
use crate::metrics::AutoscalerMetrics;
use crate::snapshot::ClusterSnapshot;
use crate::status::{NodeDeleteResult, ScaleDownNode, ScaleDownResult, ScaleDownStatus};
use crate::types::{Node, NodeGroupId, Pod, PodDisruptionBudget};

const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const MAX_PARALLEL_EVICTIONS: usize = 16;

/// Removal reason labels for the scaled-down counter.
const REASON_EMPTY: &str = "empty";
const REASON_UNDERUTILIZED: &str = "underutilized";
const REASON_UNREADY: &str = "unready";

/// Nodes to delete in one iteration.
#[derive(Debug, Clone, Default)]
pub struct DeletionPlan {
    /// Empty nodes, in deletion order.
    pub empty: Vec<NodeToBeRemoved>,
    /// Nodes to drain, in deletion order.
    pub drain: Vec<NodeToBeRemoved>,
    /// Disruption budgets as listed this iteration.
    pub pdbs: Vec<PodDisruptionBudget>,
    /// Node groups, for the atomic budget rule.
    pub groups: BTreeMap<NodeGroupId, NodeGroupView>,
}

enum Drain {
    Drained(Vec<String>),
    Deferred(Vec<String>),
}

struct Finished {
    node: String,
    result: NodeDeleteResult,
    evicted: Vec<String>,
}

/// Deletes nodes chosen by the planner.
#[derive(Debug)]
pub struct ScaleDownActuator<K: KubeClient> {
    kube: Arc<K>,
    provider: Arc<dyn CloudProvider>,
    tracker: Arc<NodeDeletionTracker>,
    budgets: BudgetProcessor,
    options: ScaleDownOptions,
    events: Arc<dyn EventRecorder>,
    metrics: AutoscalerMetrics,
    deletions: Semaphore,
    drains: Semaphore,
}

impl<K: KubeClient> ScaleDownActuator<K> {
    /// Creates an actuator.
    #[must_use]
    pub fn new(
        kube: Arc<K>,
        provider: Arc<dyn CloudProvider>,
        tracker: Arc<NodeDeletionTracker>,
        options: &ScaleDownOptions,
        events: Arc<dyn EventRecorder>,
        metrics: AutoscalerMetrics,
    ) -> Self {
        Self {
            kube,
            provider,
            tracker,
            budgets: BudgetProcessor::from_options(options),
            options: options.clone(),
            events,
            metrics,
            deletions: Semaphore::new(options.max_scale_down_parallelism.max(1)),
            drains: Semaphore::new(options.max_drain_parallelism.max(1)),
        }
    }

    /// The deletion tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<NodeDeletionTracker> {
        &self.tracker
    }

    /// Deletes as much of the plan as the budgets allow.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected nodes cannot all be tainted; every
    /// taint placed is rolled back first.
    pub async fn start_deletion(
        &self,
        snapshot: &dyn ClusterSnapshot,
        plan: DeletionPlan,
        now: DateTime<Utc>,
    ) -> Result<ScaleDownStatus> {
        let mut status = ScaleDownStatus::with_result(ScaleDownResult::NoNodeDeleted);
        let cropped = self
            .budgets
            .crop_nodes(&self.tracker, plan.empty, plan.drain, &plan.groups);
        status.unremovable_nodes = cropped.unremovable;

        let mut empty = Vec::new();
        for candidate in cropped.empty {
            match snapshot.get_node_info(&candidate.node) {
                Ok(info) if has_movable_pods(info.pods()) => {
                    warn!(node = %candidate.node, "empty node gained pods, not deleting");
                    status.node_delete_results.insert(
                        candidate.node.clone(),
                        NodeDeleteResult::Failed("node is not empty".into()),
                    );
                }
                Ok(info) => empty.push((candidate, info.node.clone())),
                Err(e) => {
                    status
                        .node_delete_results
                        .insert(candidate.node.clone(), NodeDeleteResult::Failed(e.to_string()));
                }
            }
        }
        let mut drain = Vec::new();
        for candidate in cropped.drain {
            match snapshot.get_node_info(&candidate.node) {
                Ok(info) => drain.push((candidate, info.node.clone())),
                Err(e) => {
                    status
                        .node_delete_results
                        .insert(candidate.node.clone(), NodeDeleteResult::Failed(e.to_string()));
                }
            }
        }
        if empty.is_empty() && drain.is_empty() {
            return Ok(status);
        }

        let names: Vec<&str> = empty
            .iter()
            .chain(&drain)
            .map(|(c, _)| c.node.as_str())
            .collect();
        self.taint_all(&names, now).await?;

        for (candidate, node) in &empty {
            self.tracker.start_deletion(&candidate.group, &candidate.node);
            self.announce(candidate, node, &mut status);
        }
        for (candidate, node) in &drain {
            self.tracker
                .start_deletion_with_drain(&candidate.group, &candidate.node);
            self.announce(candidate, node, &mut status);
        }

        let mut by_group: BTreeMap<NodeGroupId, Vec<Node>> = BTreeMap::new();
        for (candidate, node) in &empty {
            by_group
                .entry(candidate.group.clone())
                .or_default()
                .push(node.clone());
        }
        let pdbs = Mutex::new(RemainingPdbTracker::new(plan.pdbs));
        let empty_jobs = join_all(
            by_group
                .into_iter()
                .map(|(group, nodes)| self.delete_empty(group, nodes)),
        );
        let drain_jobs = join_all(
            drain
                .iter()
                .map(|(candidate, node)| self.delete_drained(candidate, node.clone(), &pdbs, now)),
        );
        let (empty_done, drain_done) = futures::join!(empty_jobs, drain_jobs);

        let ready: BTreeMap<&str, bool> = empty
            .iter()
            .chain(&drain)
            .map(|(c, n)| (c.node.as_str(), n.ready))
            .collect();
        for finished in empty_done.into_iter().flatten() {
            self.finish(&finished, REASON_EMPTY, now).await;
            status.node_delete_results.insert(finished.node, finished.result);
        }
        for finished in drain_done {
            let reason = if ready.get(finished.node.as_str()).copied().unwrap_or(true) {
                REASON_UNDERUTILIZED
            } else {
                REASON_UNREADY
            };
            self.finish(&finished, reason, now).await;
            if let Some(entry) = status
                .scaled_down_nodes
                .iter_mut()
                .find(|n| n.node == finished.node)
            {
                entry.evicted_pods = finished.evicted;
            }
            status.node_delete_results.insert(finished.node, finished.result);
        }
        status.result = ScaleDownResult::NodeDeleteStarted;
        Ok(status)
    }

    async fn taint_all(&self, names: &[&str], now: DateTime<Utc>) -> Result<()> {
        let mut tainted: Vec<&str> = Vec::with_capacity(names.len());
        for name in names {
            if let Err(e) = self.kube.taint_node(name, to_be_deleted_taint(now)).await {
                warn!(node = %name, error = %e, "failed to taint node, rolling back");
                for done in &tainted {
                    self.untaint(done).await;
                }
                self.metrics.register_error(e.kind());
                return Err(e);
            }
            tainted.push(name);
        }
        Ok(())
    }

    async fn untaint(&self, node: &str) {
        if let Err(e) = self.kube.untaint_node(node, TO_BE_DELETED_TAINT).await {
            warn!(node, error = %e, "failed to remove deletion taint");
        }
    }

    fn announce(&self, candidate: &NodeToBeRemoved, node: &Node, status: &mut ScaleDownStatus) {
        info!(
            node = %candidate.node,
            node_group = %candidate.group,
            empty = candidate.is_empty(),
            utilization = candidate.utilization,
            "scale-down: removing node"
        );
        self.events.record(Event::normal(
            EventObject::Node(node.name.clone()),
            REASON_SCALE_DOWN,
            "marked the node as toBeDeleted/unschedulable",
        ));
        status.scaled_down_nodes.push(ScaleDownNode {
            node: candidate.node.clone(),
            group: candidate.group.clone(),
            empty: candidate.is_empty(),
            evicted_pods: candidate.pods_to_reschedule.iter().map(Pod::key).collect(),
            utilization: candidate.utilization,
        });
    }

    fn delete_from_group(&self, group: &NodeGroupId, nodes: &[Node]) -> Result<()> {
        let node_group = find_node_group(&*self.provider, group).ok_or_else(|| {
            AutoscalerError::NodeGroupNotFound {
                id: group.to_string(),
            }
        })?;
        node_group.delete_nodes(nodes)
    }

    async fn delete_empty(&self, group: NodeGroupId, nodes: Vec<Node>) -> Vec<Finished> {
        let result = match self.deletions.acquire().await {
            Ok(_permit) => match self.delete_from_group(&group, &nodes) {
                Ok(()) => NodeDeleteResult::Deleted,
                Err(e) => NodeDeleteResult::Failed(e.to_string()),
            },
            Err(e) => NodeDeleteResult::Failed(e.to_string()),
        };
        debug!(node_group = %group, count = nodes.len(), ?result, "empty nodes deleted");
        nodes
            .into_iter()
            .map(|n| Finished {
                node: n.name,
                result: result.clone(),
                evicted: Vec::new(),
            })
            .collect()
    }

    async fn delete_drained(
        &self,
        candidate: &NodeToBeRemoved,
        node: Node,
        pdbs: &Mutex<RemainingPdbTracker>,
        now: DateTime<Utc>,
    ) -> Finished {
        let finished = |result, evicted| Finished {
            node: candidate.node.clone(),
            result,
            evicted,
        };
        let (Ok(_deletion), Ok(_drain)) = (self.deletions.acquire().await, self.drains.acquire().await)
        else {
            return finished(NodeDeleteResult::Failed("actuator shut down".into()), Vec::new());
        };
        let drained = timeout(
            self.options.max_node_drain_time,
            self.drain_node(candidate, pdbs, now),
        )
        .await;
        match drained {
            Err(_) => finished(
                NodeDeleteResult::Failed(format!("drain of node {} timed out", candidate.node)),
                Vec::new(),
            ),
            Ok(Err(e)) => finished(NodeDeleteResult::Failed(e.to_string()), Vec::new()),
            Ok(Ok(Drain::Deferred(evicted))) => finished(NodeDeleteResult::Deferred, evicted),
            Ok(Ok(Drain::Drained(evicted))) => {
                match self.delete_from_group(&candidate.group, std::slice::from_ref(&node)) {
                    Ok(()) => finished(NodeDeleteResult::Deleted, evicted),
                    Err(e) => finished(NodeDeleteResult::Failed(e.to_string()), evicted),
                }
            }
        }
    }

    async fn drain_node(
        &self,
        candidate: &NodeToBeRemoved,
        pdbs: &Mutex<RemainingPdbTracker>,
        now: DateTime<Utc>,
    ) -> Result<Drain> {
        let (acquired, held_back): (Vec<&Pod>, Vec<&Pod>) = {
            let mut tracker = pdbs.lock();
            candidate
                .pods_to_reschedule
                .iter()
                .partition(|pod| tracker.try_remove_pod(pod))
        };

        let results: Vec<Result<String>> = futures::stream::iter(acquired)
            .map(|pod| self.evict_with_retry(pod))
            .buffer_unordered(MAX_PARALLEL_EVICTIONS)
            .collect()
            .await;
        let mut evicted = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(key) => {
                    self.tracker.register_eviction(&key, now);
                    self.metrics.register_evicted_pod();
                    evicted.push(key);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !held_back.is_empty() {
            debug!(
                node = %candidate.node,
                held_back = held_back.len(),
                "disruption budgets exhausted, deferring drain"
            );
            return Ok(Drain::Deferred(evicted));
        }

        if self.options.daemonset_eviction_for_occupied_nodes {
            for pod in &candidate.daemonset_pods {
                if let Err(e) = self
                    .kube
                    .evict_pod(pod, self.options.max_graceful_termination)
                    .await
                {
                    debug!(pod = %pod.key(), error = %e, "daemonset pod eviction failed");
                }
            }
        }
        Ok(Drain::Drained(evicted))
    }

    async fn evict_with_retry(&self, pod: &Pod) -> Result<String> {
        let key = pod.key();
        let attempt = async {
            loop {
                match self
                    .kube
                    .evict_pod(pod, self.options.max_graceful_termination)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_retryable() => {
                        debug!(pod = %key, error = %e, "eviction refused, retrying");
                        tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        match timeout(self.options.max_pod_eviction_time, attempt).await {
            Ok(Ok(())) => Ok(key),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AutoscalerError::transient(format!(
                "eviction of pod {key} timed out"
            ))),
        }
    }

    async fn finish(&self, finished: &Finished, reason: &str, now: DateTime<Utc>) {
        self.tracker
            .end_deletion(&finished.node, finished.result.clone(), now);
        let object = EventObject::Node(finished.node.clone());
        match &finished.result {
            NodeDeleteResult::Deleted => {
                self.metrics.register_scale_down(reason);
                self.events.record(Event::normal(
                    object,
                    REASON_SCALE_DOWN,
                    "node removed by cluster autoscaler",
                ));
            }
            NodeDeleteResult::Deferred => {
                self.untaint(&finished.node).await;
                self.events.record(Event::normal(
                    object,
                    REASON_SCALE_DOWN_DEFERRED,
                    "drain deferred by pod disruption budgets",
                ));
            }
            NodeDeleteResult::Failed(message) => {
                warn!(node = %finished.node, error = %message, "scale-down failed");
                self.untaint(&finished.node).await;
                self.events.record(Event::warning(
                    object,
                    REASON_SCALE_DOWN_FAILED,
                    format!("failed to delete node: {message}"),
                ));
            }
        }
    }
}

fn has_movable_pods(pods: &[Pod]) -> bool {
    pods.iter().any(|p| {
        !p.is_daemonset() && !p.is_mirror() && !p.is_terminal() && p.deletion_timestamp.is_none()
    })
}
