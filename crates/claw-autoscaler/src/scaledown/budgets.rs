//! Caps on how many nodes one iteration starts deleting.

use std::collections::BTreeMap;

use tracing::debug;

use super::deletion_tracker::NodeDeletionTracker;
use super::simulator::NodeToBeRemoved;
use crate::cloudprovider::CloudProvider;
use crate::clusterstate::ClusterStateRegistry;
use crate::config::ScaleDownOptions;
use crate::status::{UnremovableNode, UnremovableReason};
use crate::types::NodeGroupId;

/// What the budget needs to know about a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupView {
    /// Group.
    pub id: NodeGroupId,
    /// The group is deleted all at once or not at all.
    pub atomic: bool,
    /// Current target size.
    pub size: usize,
}

/// Views of every node group, keyed by id.
///
/// A group is atomic if the provider resizes it atomically or its options
/// ask for zero-or-max scaling. Groups without a known target are left out.
#[must_use]
pub fn node_group_views(
    provider: &dyn CloudProvider,
    cluster_state: &ClusterStateRegistry,
) -> BTreeMap<NodeGroupId, NodeGroupView> {
    provider
        .node_groups()
        .into_iter()
        .filter_map(|group| {
            let id = group.id().clone();
            let size = cluster_state.target_size(&id)?;
            let atomic = group.capabilities().atomic_resize
                || cluster_state.node_group_options(&id).zero_or_max_node_scaling;
            Some((id.clone(), NodeGroupView { id, atomic, size }))
        })
        .collect()
}

/// Nodes selected within budget.
#[derive(Debug, Clone, Default)]
pub struct CroppedNodes {
    /// Empty nodes to delete.
    pub empty: Vec<NodeToBeRemoved>,
    /// Nodes to drain and delete.
    pub drain: Vec<NodeToBeRemoved>,
    /// Atomic group nodes that could not be deleted together.
    pub unremovable: Vec<UnremovableNode>,
}

impl CroppedNodes {
    /// Returns true if nothing was selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty.is_empty() && self.drain.is_empty()
    }
}

/// Applies the deletion parallelism limits.
#[derive(Debug, Clone, Copy)]
pub struct BudgetProcessor {
    max_parallelism: usize,
    max_drain_parallelism: usize,
}

impl BudgetProcessor {
    /// Creates a processor with explicit limits.
    #[must_use]
    pub const fn new(max_parallelism: usize, max_drain_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            max_drain_parallelism,
        }
    }

    /// Reads the limits from the options.
    #[must_use]
    pub const fn from_options(options: &ScaleDownOptions) -> Self {
        Self::new(options.max_scale_down_parallelism, options.max_drain_parallelism)
    }

    /// Selects the nodes to delete now.
    ///
    /// Deletions in flight count against the budgets. Atomic groups are
    /// taken whole, before anything else, or left out; the rest is filled
    /// with empty nodes first, then drains.
    #[must_use]
    pub fn crop_nodes(
        &self,
        tracker: &NodeDeletionTracker,
        empty: Vec<NodeToBeRemoved>,
        drain: Vec<NodeToBeRemoved>,
        groups: &BTreeMap<NodeGroupId, NodeGroupView>,
    ) -> CroppedNodes {
        let mut budget = self.max_parallelism.saturating_sub(tracker.total_count());
        let mut drain_budget = self
            .max_drain_parallelism
            .saturating_sub(tracker.drains_count());
        let mut out = CroppedNodes::default();

        let is_atomic = |id: &NodeGroupId| groups.get(id).is_some_and(|g| g.atomic);
        let (atomic_empty, empty): (Vec<_>, Vec<_>) =
            empty.into_iter().partition(|n| is_atomic(&n.group));
        let (atomic_drain, drain): (Vec<_>, Vec<_>) =
            drain.into_iter().partition(|n| is_atomic(&n.group));

        let mut atomic: BTreeMap<NodeGroupId, (Vec<NodeToBeRemoved>, Vec<NodeToBeRemoved>)> =
            BTreeMap::new();
        for node in atomic_empty {
            atomic.entry(node.group.clone()).or_default().0.push(node);
        }
        for node in atomic_drain {
            atomic.entry(node.group.clone()).or_default().1.push(node);
        }
        for (id, (group_empty, group_drain)) in atomic {
            let count = group_empty.len() + group_drain.len();
            let size = groups.get(&id).map_or(0, |g| g.size);
            if count != size {
                debug!(node_group = %id, count, size, "atomic group not entirely removable");
                out.unremovable.extend(
                    group_empty
                        .iter()
                        .chain(&group_drain)
                        .map(|n| UnremovableNode {
                            node: n.node.clone(),
                            reason: UnremovableReason::AtomicScaleDownFailed,
                        }),
                );
                continue;
            }
            if count > budget || group_drain.len() > drain_budget {
                debug!(node_group = %id, count, budget, "atomic group over budget");
                continue;
            }
            budget -= count;
            drain_budget -= group_drain.len();
            out.empty.extend(group_empty);
            out.drain.extend(group_drain);
        }

        for node in empty {
            if budget == 0 {
                break;
            }
            budget -= 1;
            out.empty.push(node);
        }
        for node in drain {
            if budget == 0 || drain_budget == 0 {
                break;
            }
            budget -= 1;
            drain_budget -= 1;
            out.drain.push(node);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OwnerKind, Pod, Resources};

    fn candidate(name: &str, group: &str, empty: bool) -> NodeToBeRemoved {
        let pods = if empty {
            Vec::new()
        } else {
            vec![Pod::new("default", format!("{name}-p"), Resources::new(100, 0))
                .with_owner(OwnerKind::ReplicaSet, "web")]
        };
        NodeToBeRemoved {
            node: name.to_string(),
            group: NodeGroupId::new(group),
            pods_to_reschedule: pods,
            daemonset_pods: Vec::new(),
            utilization: 0.0,
            is_risky: false,
        }
    }

    fn views(atomic_size: usize) -> BTreeMap<NodeGroupId, NodeGroupView> {
        [
            NodeGroupView {
                id: NodeGroupId::new("ng"),
                atomic: false,
                size: 10,
            },
            NodeGroupView {
                id: NodeGroupId::new("tpu"),
                atomic: true,
                size: atomic_size,
            },
        ]
        .into_iter()
        .map(|v| (v.id.clone(), v))
        .collect()
    }

    fn names(nodes: &[NodeToBeRemoved]) -> Vec<&str> {
        nodes.iter().map(|n| n.node.as_str()).collect()
    }

    #[test]
    fn empty_nodes_fill_budget_first() {
        let budgets = BudgetProcessor::new(3, 2);
        let out = budgets.crop_nodes(
            &NodeDeletionTracker::new(),
            vec![candidate("e1", "ng", true), candidate("e2", "ng", true)],
            vec![candidate("d1", "ng", false), candidate("d2", "ng", false)],
            &views(0),
        );
        assert_eq!(names(&out.empty), vec!["e1", "e2"]);
        assert_eq!(names(&out.drain), vec!["d1"]);
    }

    #[test]
    fn in_flight_deletions_consume_budget() {
        let tracker = NodeDeletionTracker::new();
        tracker.start_deletion_with_drain(&NodeGroupId::new("ng"), "busy");
        let budgets = BudgetProcessor::new(3, 1);
        let out = budgets.crop_nodes(
            &tracker,
            vec![candidate("e1", "ng", true)],
            vec![candidate("d1", "ng", false)],
            &views(0),
        );
        assert_eq!(names(&out.empty), vec!["e1"]);
        assert!(out.drain.is_empty());
    }

    #[test]
    fn atomic_group_taken_whole() {
        let budgets = BudgetProcessor::new(3, 1);
        let out = budgets.crop_nodes(
            &NodeDeletionTracker::new(),
            vec![candidate("e1", "ng", true), candidate("t1", "tpu", true), candidate("t2", "tpu", true)],
            Vec::new(),
            &views(2),
        );
        assert_eq!(names(&out.empty), vec!["t1", "t2", "e1"]);
    }

    #[test]
    fn partial_atomic_group_rejected() {
        let budgets = BudgetProcessor::new(10, 10);
        let out = budgets.crop_nodes(
            &NodeDeletionTracker::new(),
            vec![candidate("t1", "tpu", true)],
            Vec::new(),
            &views(2),
        );
        assert!(out.is_empty());
        assert_eq!(out.unremovable.len(), 1);
        assert_eq!(out.unremovable[0].reason, UnremovableReason::AtomicScaleDownFailed);
    }

    #[test]
    fn atomic_group_over_budget_waits() {
        let budgets = BudgetProcessor::new(1, 1);
        let out = budgets.crop_nodes(
            &NodeDeletionTracker::new(),
            vec![candidate("t1", "tpu", true), candidate("t2", "tpu", true)],
            Vec::new(),
            &views(2),
        );
        assert!(out.is_empty());
        assert!(out.unremovable.is_empty());
    }
}
