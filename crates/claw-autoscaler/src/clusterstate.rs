//! Cluster-state registry.
//!
//! Tracks node readiness per node group, nodes that were requested but have
//! not registered yet, in-flight scale-up requests and per-group backoff.
//! The registry is refreshed once per iteration from the cloud provider and
//! the node lister, and answers the health questions that gate scaling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};

use crate::backoff::{BackoffStatus, ExponentialBackoff, ScaleUpError};
use crate::cloudprovider::{CloudProvider, Instance, InstanceState, NodeGroup};
use crate::config::{AutoscalingOptions, HealthOptions, NodeGroupAutoscalingOptions};
use crate::error::Result;
use crate::events::{Event, EventObject, EventRecorder, REASON_SCALE_UP_TIMED_OUT};
use crate::kube::TO_BE_DELETED_TAINT;
use crate::metrics::AutoscalerMetrics;
use crate::status::{
    ClusterAutoscalerStatus, HealthStatus, NodeGroupStatus, ReadinessCounts, ScaleDownResult,
    ScaleUpActivity, ScaleUpResult,
};
use crate::types::{Node, NodeGroupId};

/// Failure class used when requested nodes never show up.
pub const FAILURE_TIMEOUT: &str = "timeout";
/// Failure class used for provider errors.
pub const FAILURE_CLOUD_PROVIDER: &str = "cloudProviderError";

fn chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Readiness of a set of nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Ready nodes.
    pub ready: Vec<String>,
    /// Nodes unready past their start-up window.
    pub unready: Vec<String>,
    /// Unready nodes still within their start-up window.
    pub not_started: Vec<String>,
    /// Nodes tainted for deletion.
    pub deleted: Vec<String>,
    /// Every registered node.
    pub registered: Vec<String>,
}

impl Readiness {
    /// Counts for the status document.
    #[must_use]
    pub fn counts(&self) -> ReadinessCounts {
        ReadinessCounts {
            ready: self.ready.len(),
            unready: self.unready.len(),
            not_started: self.not_started.len(),
            registered: self.registered.len(),
            deleted: self.deleted.len(),
        }
    }
}

/// An in-flight scale-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleUpRequest {
    /// Group.
    pub group: NodeGroupId,
    /// Nodes requested.
    pub increase: usize,
    /// Time of the first request.
    pub time: DateTime<Utc>,
    /// Deadline for the nodes to register.
    pub expected_add_time: DateTime<Utc>,
}

/// A recent scale-up failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedScaleUp {
    /// Group.
    pub group: NodeGroupId,
    /// Failure class.
    pub reason: String,
    /// Time of the failure.
    pub time: DateTime<Utc>,
}

/// A group whose target stayed above its registered nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncorrectSize {
    /// Provider-reported target.
    pub expected: usize,
    /// Registered nodes.
    pub current: usize,
    /// When the mismatch was first seen.
    pub first_observed: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct GroupView {
    group: Arc<dyn NodeGroup>,
    target: usize,
    instances: Vec<Instance>,
    options: NodeGroupAutoscalingOptions,
}

/// Per-iteration view of cluster health and scale-up progress.
#[derive(Debug)]
pub struct ClusterStateRegistry {
    provider: Arc<dyn CloudProvider>,
    health: HealthOptions,
    defaults: NodeGroupAutoscalingOptions,
    backoff: ExponentialBackoff,
    events: Arc<dyn EventRecorder>,
    metrics: AutoscalerMetrics,
    groups: BTreeMap<NodeGroupId, GroupView>,
    node_to_group: HashMap<String, NodeGroupId>,
    per_group: BTreeMap<NodeGroupId, Readiness>,
    total: Readiness,
    requests: BTreeMap<NodeGroupId, ScaleUpRequest>,
    incorrect_sizes: BTreeMap<NodeGroupId, IncorrectSize>,
    failed_scale_ups: Vec<FailedScaleUp>,
    last_update: Option<DateTime<Utc>>,
    scale_down_candidates: Vec<String>,
    last_scale_up: ScaleUpResult,
    last_scale_down: ScaleDownResult,
}

impl ClusterStateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        options: &AutoscalingOptions,
        events: Arc<dyn EventRecorder>,
        metrics: AutoscalerMetrics,
    ) -> Self {
        Self {
            provider,
            health: options.health.clone(),
            defaults: options.node_group_defaults.clone(),
            backoff: ExponentialBackoff::from_options(&options.backoff),
            events,
            metrics,
            groups: BTreeMap::new(),
            node_to_group: HashMap::new(),
            per_group: BTreeMap::new(),
            total: Readiness::default(),
            requests: BTreeMap::new(),
            incorrect_sizes: BTreeMap::new(),
            failed_scale_ups: Vec::new(),
            last_update: None,
            scale_down_candidates: Vec::new(),
            last_scale_up: ScaleUpResult::NotTried,
            last_scale_down: ScaleDownResult::NotTried,
        }
    }

    /// Recomputes readiness and scale-up progress.
    ///
    /// # Errors
    ///
    /// Returns an error if a node group's size or instances cannot be read.
    pub fn update(&mut self, nodes: &[Node], now: DateTime<Utc>) -> Result<()> {
        let mut groups = BTreeMap::new();
        let mut instance_to_group = HashMap::new();
        for group in self.provider.node_groups() {
            if !group.exist() {
                continue;
            }
            let target = group.target_size()?;
            let instances = group.nodes()?;
            for instance in &instances {
                instance_to_group.insert(instance.id.clone(), group.id().clone());
            }
            let options = group
                .options(&self.defaults)
                .unwrap_or_else(|| self.defaults.clone());
            groups.insert(
                group.id().clone(),
                GroupView {
                    group,
                    target,
                    instances,
                    options,
                },
            );
        }

        let mut node_to_group = HashMap::new();
        let mut per_group: BTreeMap<NodeGroupId, Readiness> = groups
            .keys()
            .map(|id| (id.clone(), Readiness::default()))
            .collect();
        let mut total = Readiness::default();
        for node in nodes {
            let group = instance_to_group.get(&node.provider_id).cloned();
            let provision_time = group
                .as_ref()
                .and_then(|id| groups.get(id))
                .map_or(self.defaults.max_node_provision_time, |g| {
                    g.options.max_node_provision_time
                });
            let bucket = classify(node, now, provision_time);
            total.push(bucket, &node.name);
            if let Some(id) = group {
                if let Some(readiness) = per_group.get_mut(&id) {
                    readiness.push(bucket, &node.name);
                }
                node_to_group.insert(node.name.clone(), id);
            }
        }

        self.groups = groups;
        self.node_to_group = node_to_group;
        self.per_group = per_group;
        self.total = total;
        self.update_scale_up_requests(now);
        self.update_incorrect_sizes(now);
        self.backoff.remove_stale(now);
        self.last_update = Some(now);
        debug!(
            ready = self.total.ready.len(),
            unready = self.total.unready.len(),
            not_started = self.total.not_started.len(),
            "cluster state updated"
        );
        Ok(())
    }

    fn registered_in(&self, id: &NodeGroupId) -> usize {
        self.per_group.get(id).map_or(0, |r| r.registered.len())
    }

    fn update_scale_up_requests(&mut self, now: DateTime<Utc>) {
        let ids: Vec<NodeGroupId> = self.requests.keys().cloned().collect();
        for id in ids {
            let upcoming = self.upcoming_for(&id);
            let Some(request) = self.requests.get(&id) else {
                continue;
            };
            if upcoming == 0 || !self.groups.contains_key(&id) {
                info!(node_group = %id, increase = request.increase, "scale-up completed");
                self.requests.remove(&id);
                continue;
            }
            if now > request.expected_add_time {
                let message = format!(
                    "nodes added to group {id} failed to register within {}s",
                    (request.expected_add_time - request.time).num_seconds()
                );
                self.events.record(Event::warning(
                    EventObject::NodeGroup(id.clone()),
                    REASON_SCALE_UP_TIMED_OUT,
                    message.clone(),
                ));
                self.requests.remove(&id);
                self.register_failed_scale_up(&id, FAILURE_TIMEOUT, &message, now);
            }
        }
    }

    fn update_incorrect_sizes(&mut self, now: DateTime<Utc>) {
        let mut next = BTreeMap::new();
        for (id, view) in &self.groups {
            let registered = self.registered_in(id);
            if self.requests.contains_key(id) || view.target <= registered {
                continue;
            }
            let entry = match self.incorrect_sizes.get(id) {
                Some(prev) if prev.expected == view.target && prev.current == registered => *prev,
                _ => IncorrectSize {
                    expected: view.target,
                    current: registered,
                    first_observed: now,
                },
            };
            next.insert(id.clone(), entry);
        }
        self.incorrect_sizes = next;
    }

    fn upcoming_for(&self, id: &NodeGroupId) -> usize {
        self.groups
            .get(id)
            .map_or(0, |g| g.target.saturating_sub(self.registered_in(id)))
    }

    /// Nodes requested from each group that have not registered yet.
    #[must_use]
    pub fn upcoming_nodes(&self) -> BTreeMap<NodeGroupId, usize> {
        self.groups
            .keys()
            .map(|id| (id.clone(), self.upcoming_for(id)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Records a successful resize and clears the group's backoff.
    pub fn register_scale_up(&mut self, group: &NodeGroupId, delta: usize, now: DateTime<Utc>) {
        let provision_time = self
            .groups
            .get(group)
            .map_or(self.defaults.max_node_provision_time, |g| {
                g.options.max_node_provision_time
            });
        let deadline = now + chrono(provision_time);
        self.requests
            .entry(group.clone())
            .and_modify(|r| {
                r.increase += delta;
                r.expected_add_time = deadline;
            })
            .or_insert_with(|| ScaleUpRequest {
                group: group.clone(),
                increase: delta,
                time: now,
                expected_add_time: deadline,
            });
        if let Some(view) = self.groups.get_mut(group) {
            view.target += delta;
        }
        self.backoff.remove_backoff(group);
    }

    /// Records a failed scale-up and backs the group off.
    pub fn register_failed_scale_up(
        &mut self,
        group: &NodeGroupId,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        self.metrics.register_failed_scale_up(reason);
        self.failed_scale_ups.push(FailedScaleUp {
            group: group.clone(),
            reason: reason.to_string(),
            time: now,
        });
        let cutoff = now - ChronoDuration::hours(1);
        self.failed_scale_ups.retain(|f| f.time > cutoff);
        self.backoff
            .backoff(group, ScaleUpError::new(reason, message), now);
    }

    /// Backoff state of a group.
    #[must_use]
    pub fn backoff_status(&self, group: &NodeGroupId, now: DateTime<Utc>) -> BackoffStatus {
        self.backoff.status(group, now)
    }

    /// Returns true if the cluster has few enough unready nodes.
    #[must_use]
    pub fn is_cluster_healthy(&self) -> bool {
        self.is_healthy(&self.total)
    }

    /// Returns true if the group has few enough unready nodes.
    #[must_use]
    pub fn is_node_group_healthy(&self, group: &NodeGroupId) -> bool {
        self.per_group.get(group).is_none_or(|r| self.is_healthy(r))
    }

    #[allow(clippy::cast_precision_loss)]
    fn is_healthy(&self, readiness: &Readiness) -> bool {
        let unready = readiness.unready.len();
        let total = readiness.ready.len() + unready + readiness.not_started.len();
        let limit = self.health.max_total_unready_percentage / 100.0 * total as f64;
        !(unready > self.health.ok_total_unready_count && unready as f64 > limit)
    }

    /// Returns true if the group may be scaled up now.
    #[must_use]
    pub fn is_node_group_safe_to_scale_up(&self, group: &NodeGroupId, now: DateTime<Utc>) -> bool {
        self.is_node_group_healthy(group) && !self.backoff.is_backed_off(group, now)
    }

    /// Readiness across the cluster.
    #[must_use]
    pub const fn total_readiness(&self) -> &Readiness {
        &self.total
    }

    /// Readiness of one group.
    #[must_use]
    pub fn readiness(&self, group: &NodeGroupId) -> Option<&Readiness> {
        self.per_group.get(group)
    }

    /// The group owning a registered node.
    #[must_use]
    pub fn node_group_of(&self, node: &str) -> Option<&NodeGroupId> {
        self.node_to_group.get(node)
    }

    /// Provider-reported target observed at the last update, plus any resize
    /// registered since.
    #[must_use]
    pub fn target_size(&self, group: &NodeGroupId) -> Option<usize> {
        self.groups.get(group).map(|g| g.target)
    }

    /// Effective autoscaling options of a group.
    #[must_use]
    pub fn node_group_options(&self, group: &NodeGroupId) -> &NodeGroupAutoscalingOptions {
        self.groups.get(group).map_or(&self.defaults, |g| &g.options)
    }

    /// Groups whose target has exceeded their registered nodes for longer
    /// than the provision time, with the excess.
    #[must_use]
    pub fn incorrect_node_group_sizes(&self, now: DateTime<Utc>) -> Vec<(Arc<dyn NodeGroup>, usize)> {
        self.incorrect_sizes
            .iter()
            .filter_map(|(id, size)| {
                let view = self.groups.get(id)?;
                let overdue =
                    size.first_observed + chrono(view.options.max_node_provision_time) < now;
                overdue.then(|| (Arc::clone(&view.group), size.expected - size.current))
            })
            .collect()
    }

    /// Instances the provider reports as failed to start.
    #[must_use]
    pub fn errored_instances(&self) -> Vec<(Arc<dyn NodeGroup>, Instance)> {
        self.groups
            .values()
            .flat_map(|view| {
                view.instances
                    .iter()
                    .filter(|i| matches!(i.state, InstanceState::Errored { .. }))
                    .map(|i| (Arc::clone(&view.group), i.clone()))
            })
            .collect()
    }

    /// Instances in the `Creating` state, per group.
    #[must_use]
    pub fn creating_instances(&self, group: &NodeGroupId) -> usize {
        self.groups.get(group).map_or(0, |g| {
            g.instances
                .iter()
                .filter(|i| i.state == InstanceState::Creating)
                .count()
        })
    }

    /// In-flight scale-up requests.
    #[must_use]
    pub fn scale_up_requests(&self) -> Vec<&ScaleUpRequest> {
        self.requests.values().collect()
    }

    /// Failures registered in the last hour.
    #[must_use]
    pub fn recent_failed_scale_ups(&self) -> &[FailedScaleUp] {
        &self.failed_scale_ups
    }

    /// Records the latest scaling results for the status document.
    pub fn record_results(
        &mut self,
        scale_up: ScaleUpResult,
        scale_down: ScaleDownResult,
        candidates: Vec<String>,
    ) {
        self.last_scale_up = scale_up;
        self.last_scale_down = scale_down;
        self.scale_down_candidates = candidates;
    }

    /// Builds the status document.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> ClusterAutoscalerStatus {
        let health = |healthy: bool| {
            if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            }
        };
        let node_groups = self
            .groups
            .iter()
            .map(|(id, view)| {
                let request = self.requests.get(id);
                NodeGroupStatus {
                    id: id.clone(),
                    health: health(self.is_node_group_healthy(id)),
                    readiness: self
                        .per_group
                        .get(id)
                        .map(Readiness::counts)
                        .unwrap_or_default(),
                    min_size: view.group.min_size(),
                    max_size: view.group.max_size(),
                    target_size: view.target,
                    backoff: self.backoff.status(id, now),
                    scale_up: ScaleUpActivity {
                        in_progress: request.is_some(),
                        increase: request.map_or(0, |r| r.increase),
                        deadline: request.map(|r| r.expected_add_time),
                    },
                }
            })
            .collect();
        ClusterAutoscalerStatus {
            time: now,
            cluster_health: health(self.is_cluster_healthy()),
            readiness: self.total.counts(),
            node_groups,
            scale_down_candidates: self.scale_down_candidates.clone(),
            last_scale_up: self.last_scale_up,
            last_scale_down: self.last_scale_down,
        }
    }

    /// Time of the last successful update.
    #[must_use]
    pub const fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Ready,
    Unready,
    NotStarted,
    Deleted,
}

impl Readiness {
    fn push(&mut self, bucket: Bucket, name: &str) {
        self.registered.push(name.to_string());
        let list = match bucket {
            Bucket::Ready => &mut self.ready,
            Bucket::Unready => &mut self.unready,
            Bucket::NotStarted => &mut self.not_started,
            Bucket::Deleted => &mut self.deleted,
        };
        list.push(name.to_string());
    }
}

fn classify(node: &Node, now: DateTime<Utc>, provision_time: std::time::Duration) -> Bucket {
    if node.has_taint(TO_BE_DELETED_TAINT) {
        return Bucket::Deleted;
    }
    if node.ready {
        return Bucket::Ready;
    }
    if now - node.created_at < chrono(provision_time) {
        Bucket::NotStarted
    } else {
        debug!(node = %node.name, "node is unready");
        Bucket::Unready
    }
}
