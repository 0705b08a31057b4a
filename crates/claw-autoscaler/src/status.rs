//! Results of scale-up and scale-down attempts, and the cluster status
//! document published after every iteration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffStatus;
use crate::scaledown::drainability::BlockingPod;
use crate::types::{NodeGroupId, Pod, RESOURCE_CPU};

/// Why a node group was not considered for scale-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The group no longer exists.
    NotExist,
    /// The group is backed off after a failure.
    Backoff,
    /// The group has too many unready nodes.
    NotReady,
    /// The group is at its maximum size.
    MaxLimitReached,
    /// The group has no usable template.
    MissingTemplate,
    /// Adding a node would exceed cluster-wide resource limits.
    MaxResourceLimitReached(Vec<String>),
    /// No pending pod fits the group's template.
    NotFit,
    /// The cluster is at `max_nodes_total`.
    MaxNodesTotalReached,
    /// An atomic group cannot be scaled to its maximum in one step.
    AtomicScaleUpImpossible,
}

fn resource_display(name: &str) -> &str {
    if name == RESOURCE_CPU { "cores" } else { name }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExist => f.write_str("node group does not exist"),
            Self::Backoff => f.write_str("in backoff after failed scale-up"),
            Self::NotReady => f.write_str("not ready for scale-up"),
            Self::MaxLimitReached => f.write_str("max node group size reached"),
            Self::MissingTemplate => f.write_str("node group template unavailable"),
            Self::MaxResourceLimitReached(resources) => {
                let names: Vec<&str> = resources.iter().map(|r| resource_display(r)).collect();
                write!(f, "max cluster {} limit reached", names.join(", "))
            }
            Self::NotFit => f.write_str("no pending pod fits the node template"),
            Self::MaxNodesTotalReached => f.write_str("max total nodes in cluster reached"),
            Self::AtomicScaleUpImpossible => {
                f.write_str("atomic node group cannot be scaled to its maximum size")
            }
        }
    }
}

/// Outcome of a scale-up attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleUpResult {
    /// Scale-up was not attempted this iteration.
    #[default]
    NotTried,
    /// No pending pods needed new capacity.
    NotNeeded,
    /// No group could help.
    NoOptionsAvailable,
    /// At least one group was resized.
    Successful,
    /// The resize failed.
    Error,
}

/// A single group resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpInfo {
    /// Group.
    pub group: NodeGroupId,
    /// Target before the resize.
    pub current_size: usize,
    /// Target after the resize.
    pub new_size: usize,
    /// Group maximum.
    pub max_size: usize,
}

impl fmt::Display for ScaleUpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} {}->{} (max: {})}}",
            self.group, self.current_size, self.new_size, self.max_size
        )
    }
}

/// Why a pending pod did not trigger a scale-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoScaleUpInfo {
    /// The pod.
    pub pod: Pod,
    /// Predicate failures per group whose template rejected the pod.
    pub rejected: BTreeMap<NodeGroupId, Vec<String>>,
    /// Skip reasons per group that was not considered at all.
    pub skipped: BTreeMap<NodeGroupId, Vec<String>>,
}

impl NoScaleUpInfo {
    /// Creates an entry with no reasons.
    #[must_use]
    pub fn new(pod: Pod) -> Self {
        Self {
            pod,
            rejected: BTreeMap::new(),
            skipped: BTreeMap::new(),
        }
    }

    /// Aggregated message naming how many groups gave each reason.
    #[must_use]
    pub fn message(&self) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for reason in self.rejected.values().chain(self.skipped.values()).flatten() {
            *counts.entry(reason.as_str()).or_default() += 1;
        }
        if counts.is_empty() {
            return "pod didn't trigger scale-up: no node groups".to_string();
        }
        let parts: Vec<String> = counts
            .into_iter()
            .map(|(reason, n)| format!("{n} {reason}"))
            .collect();
        format!("pod didn't trigger scale-up: {}", parts.join(", "))
    }
}

/// Result of the scale-up stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScaleUpStatus {
    /// Outcome.
    pub result: ScaleUpResult,
    /// Error message when `result` is `Error`.
    pub error: Option<String>,
    /// Resizes that were executed.
    pub scale_up_infos: Vec<ScaleUpInfo>,
    /// Pods the resize is expected to help.
    pub pods_triggered_scale_up: Vec<Pod>,
    /// Pods no group could help, with reasons.
    pub pods_remain_unschedulable: Vec<NoScaleUpInfo>,
    /// Pods held back for a later iteration.
    pub pods_awaiting_evaluation: Vec<Pod>,
    /// Groups whose resize failed.
    pub failed_resize_groups: Vec<NodeGroupId>,
}

impl ScaleUpStatus {
    /// A status with only the result set.
    #[must_use]
    pub fn with_result(result: ScaleUpResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    /// Returns true if any group was resized, including the steps of a plan
    /// that failed part way.
    #[must_use]
    pub fn scaled_up(&self) -> bool {
        self.result == ScaleUpResult::Successful || !self.scale_up_infos.is_empty()
    }
}

/// Why a node cannot be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnremovableReason {
    /// The node carries the scale-down-disabled annotation.
    ScaleDownDisabledAnnotation,
    /// No autoscaled node group owns the node.
    NotAutoscaled,
    /// Utilization is at or above the threshold.
    NotUnderutilized,
    /// Removable, but not for long enough.
    NotUnneededLongEnough,
    /// Unready, but not for long enough.
    NotUnreadyLongEnough,
    /// Unready nodes may not be removed.
    ScaleDownUnreadyDisabled,
    /// The group is at its minimum size.
    NodeGroupMinSizeReached,
    /// Removal would drop below a cluster-wide minimum.
    MinimalResourceLimitExceeded(Vec<String>),
    /// The node is already being deleted.
    CurrentlyBeingDeleted,
    /// Some pod cannot be placed elsewhere.
    NoPlaceToMovePods,
    /// A pod blocks draining.
    BlockedByPod(BlockingPod),
    /// Found unremovable recently; not re-simulated yet.
    RecentlyUnremovable,
    /// The removal simulation ran out of time.
    SimulationTimeout,
    /// An atomic group cannot be scaled down partially.
    AtomicScaleDownFailed,
    /// Something unexpected went wrong.
    UnexpectedError(String),
}

impl fmt::Display for UnremovableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScaleDownDisabledAnnotation => f.write_str("scale-down disabled by annotation"),
            Self::NotAutoscaled => f.write_str("node is not autoscaled"),
            Self::NotUnderutilized => f.write_str("node is not underutilized"),
            Self::NotUnneededLongEnough => f.write_str("node not unneeded for long enough"),
            Self::NotUnreadyLongEnough => f.write_str("node not unready for long enough"),
            Self::ScaleDownUnreadyDisabled => f.write_str("scale-down of unready nodes disabled"),
            Self::NodeGroupMinSizeReached => f.write_str("node group min size reached"),
            Self::MinimalResourceLimitExceeded(resources) => {
                let names: Vec<&str> = resources.iter().map(|r| resource_display(r)).collect();
                write!(f, "min cluster {} limit reached", names.join(", "))
            }
            Self::CurrentlyBeingDeleted => f.write_str("node is currently being deleted"),
            Self::NoPlaceToMovePods => f.write_str("no place to move pods"),
            Self::BlockedByPod(blocking) => write!(f, "blocked by pod {blocking}"),
            Self::RecentlyUnremovable => f.write_str("recently found unremovable"),
            Self::SimulationTimeout => f.write_str("scale-down simulation timed out"),
            Self::AtomicScaleDownFailed => f.write_str("atomic node group cannot be scaled down"),
            Self::UnexpectedError(message) => write!(f, "unexpected error: {message}"),
        }
    }
}

/// A node that cannot be removed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnremovableNode {
    /// Node name.
    pub node: String,
    /// Reason.
    pub reason: UnremovableReason,
}

/// Outcome of deleting one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeleteResult {
    /// The node was deleted.
    Deleted,
    /// Draining yielded to disruption budgets; retried later.
    Deferred,
    /// Deletion failed.
    Failed(String),
}

/// Outcome of the scale-down stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDownResult {
    /// Scale-down did not run.
    #[default]
    NotTried,
    /// No node was unneeded.
    NoUnneeded,
    /// Unneeded nodes exist, but none could be deleted now.
    NoNodeDeleted,
    /// Deletions were started.
    NodeDeleteStarted,
    /// A cooldown is in effect.
    InCooldown,
    /// Scale-down failed.
    Error,
}

/// A node removed (or attempted) by scale-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDownNode {
    /// Node name.
    pub node: String,
    /// Owning group.
    pub group: NodeGroupId,
    /// The node had no workload pods.
    pub empty: bool,
    /// Pods to evict.
    pub evicted_pods: Vec<String>,
    /// Utilization at selection time.
    pub utilization: f64,
}

/// Result of the scale-down stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleDownStatus {
    /// Outcome.
    pub result: ScaleDownResult,
    /// Error message when `result` is `Error`.
    pub error: Option<String>,
    /// Nodes selected for deletion.
    pub scaled_down_nodes: Vec<ScaleDownNode>,
    /// Per-node deletion results.
    pub node_delete_results: BTreeMap<String, NodeDeleteResult>,
    /// Nodes that could not be removed.
    pub unremovable_nodes: Vec<UnremovableNode>,
}

impl ScaleDownStatus {
    /// A status with only the result set.
    #[must_use]
    pub fn with_result(result: ScaleDownResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    /// Names of nodes that were actually deleted.
    #[must_use]
    pub fn deleted_nodes(&self) -> Vec<&str> {
        self.node_delete_results
            .iter()
            .filter(|(_, r)| **r == NodeDeleteResult::Deleted)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Cluster or node group health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Few enough unready nodes.
    Healthy,
    /// Too many unready nodes.
    Unhealthy,
}

/// Node readiness counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadinessCounts {
    /// Ready nodes.
    pub ready: usize,
    /// Unready nodes past their start-up window.
    pub unready: usize,
    /// Nodes still starting.
    pub not_started: usize,
    /// Registered nodes.
    pub registered: usize,
    /// Nodes tainted for deletion.
    pub deleted: usize,
}

/// Scale-up activity of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpActivity {
    /// Nodes requested and not yet registered.
    pub in_progress: bool,
    /// Requested increase.
    pub increase: usize,
    /// Deadline for the requested nodes.
    pub deadline: Option<DateTime<Utc>>,
}

/// Status of a single node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupStatus {
    /// Group.
    pub id: NodeGroupId,
    /// Health.
    pub health: HealthStatus,
    /// Readiness counts.
    pub readiness: ReadinessCounts,
    /// Minimum size.
    pub min_size: usize,
    /// Maximum size.
    pub max_size: usize,
    /// Provider-reported target.
    pub target_size: usize,
    /// Backoff state.
    pub backoff: BackoffStatus,
    /// Scale-up in flight.
    pub scale_up: ScaleUpActivity,
}

/// The status document published after every iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAutoscalerStatus {
    /// Time the document was produced.
    pub time: DateTime<Utc>,
    /// Cluster-wide health.
    pub cluster_health: HealthStatus,
    /// Cluster-wide readiness.
    pub readiness: ReadinessCounts,
    /// Per-group status, ordered by id.
    pub node_groups: Vec<NodeGroupStatus>,
    /// Nodes currently considered unneeded.
    pub scale_down_candidates: Vec<String>,
    /// Last scale-up result.
    pub last_scale_up: ScaleUpResult,
    /// Last scale-down result.
    pub last_scale_down: ScaleDownResult,
}

impl ClusterAutoscalerStatus {
    /// Looks up a group's status.
    #[must_use]
    pub fn node_group(&self, id: &NodeGroupId) -> Option<&NodeGroupStatus> {
        self.node_groups.iter().find(|g| &g.id == id)
    }
}
