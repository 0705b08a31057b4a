//! Nodes found removable across iterations, and nodes found unremovable.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::deletion_tracker::NodeDeletionTracker;
use super::eligibility::ANNOTATION_SCALE_DOWN_DISABLED;
use super::simulator::NodeToBeRemoved;
use super::to_chrono;
use crate::cloudprovider::{find_node_group, CloudProvider};
use crate::clusterstate::ClusterStateRegistry;
use crate::scaleup::{node_resources, ResourceManager};
use crate::snapshot::ClusterSnapshot;
use crate::status::{UnremovableNode, UnremovableReason};
use crate::types::NodeGroupId;

#[derive(Debug, Clone)]
struct Unneeded {
    node: NodeToBeRemoved,
    since: DateTime<Utc>,
}

/// What [`UnneededNodes::removable_at`] consults.
#[derive(Debug, Clone, Copy)]
pub struct RemovalContext<'a> {
    /// Cloud provider.
    pub provider: &'a dyn CloudProvider,
    /// Cluster state.
    pub cluster_state: &'a ClusterStateRegistry,
    /// Current snapshot.
    pub snapshot: &'a dyn ClusterSnapshot,
    /// Deletions in flight.
    pub deletions: &'a NodeDeletionTracker,
    /// Cluster-wide resource floors.
    pub resources: &'a ResourceManager,
    /// Unready nodes may be removed.
    pub unready_enabled: bool,
}

/// Nodes ready for deletion now, split by whether they need a drain.
#[derive(Debug, Clone, Default)]
pub struct Removable {
    /// Nodes with nothing to relocate.
    pub empty: Vec<NodeToBeRemoved>,
    /// Nodes to drain.
    pub drain: Vec<NodeToBeRemoved>,
    /// Unneeded nodes held back, with reasons.
    pub unremovable: Vec<UnremovableNode>,
}

/// Nodes found removable, with the time each first became so.
#[derive(Debug, Clone, Default)]
pub struct UnneededNodes {
    nodes: BTreeMap<String, Unneeded>,
}

impl UnneededNodes {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set with this iteration's removable nodes.
    ///
    /// A node keeps its `since` only if it was unneeded last time in the
    /// same class (empty or drain); nodes absent from `removable` are
    /// dropped.
    pub fn update(&mut self, removable: Vec<NodeToBeRemoved>, now: DateTime<Utc>) {
        let mut next = BTreeMap::new();
        for node in removable {
            let since = match self.nodes.get(&node.node) {
                Some(prev) if prev.node.is_empty() == node.is_empty() => prev.since,
                _ => now,
            };
            next.insert(node.node.clone(), Unneeded { node, since });
        }
        self.nodes = next;
    }

    /// Forgets every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Returns true if the node is unneeded.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Forgets one node.
    pub fn remove(&mut self, node: &str) {
        self.nodes.remove(node);
    }

    /// Names of unneeded nodes.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Unneeded nodes.
    #[must_use]
    pub fn as_list(&self) -> Vec<&NodeToBeRemoved> {
        self.nodes.values().map(|u| &u.node).collect()
    }

    /// When the node became unneeded.
    #[must_use]
    pub fn since(&self, node: &str) -> Option<DateTime<Utc>> {
        self.nodes.get(node).map(|u| u.since)
    }

    /// Number of unneeded nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node is unneeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that may be deleted at `now`.
    ///
    /// Every accepted node lowers the working size of its group and the
    /// cluster totals, so later nodes are checked against what would remain.
    #[must_use]
    pub fn removable_at(&self, ctx: &RemovalContext<'_>, now: DateTime<Utc>) -> Removable {
        let mut out = Removable::default();
        let mut group_sizes: HashMap<NodeGroupId, usize> = HashMap::new();
        let being_deleted: HashSet<String> = ctx.deletions.deletions_in_progress().into_iter().collect();
        let totals = ctx.resources.node_totals(
            ctx.snapshot
                .list_node_infos()
                .into_iter()
                .filter(|i| !being_deleted.contains(i.name()))
                .map(|i| &i.node),
        );
        let mut left = ctx.resources.left_for_scale_down(&totals);
        let gpu_label = ctx.provider.gpu_label().to_string();

        for (name, entry) in &self.nodes {
            let reason = Self::unremovable_reason(ctx, entry, now, &mut group_sizes);
            let reason = reason.or_else(|| {
                let info = ctx.snapshot.get_node_info(name).ok()?;
                let delta = node_resources(&info.node, &gpu_label);
                let exceeded = left.exceeded(&delta);
                if exceeded.is_empty() {
                    left.consume(&delta, 1);
                    None
                } else {
                    Some(UnremovableReason::MinimalResourceLimitExceeded(exceeded))
                }
            });
            match reason {
                Some(reason) => {
                    trace!(node = %name, %reason, "unneeded node not removable yet");
                    out.unremovable.push(UnremovableNode {
                        node: name.clone(),
                        reason,
                    });
                }
                None => {
                    if let Some(size) = group_sizes.get_mut(&entry.node.group) {
                        *size = size.saturating_sub(1);
                    }
                    if entry.node.is_empty() {
                        out.empty.push(entry.node.clone());
                    } else {
                        out.drain.push(entry.node.clone());
                    }
                }
            }
        }
        debug!(
            empty = out.empty.len(),
            drain = out.drain.len(),
            held = out.unremovable.len(),
            "removable unneeded nodes"
        );
        out
    }

    fn unremovable_reason(
        ctx: &RemovalContext<'_>,
        entry: &Unneeded,
        now: DateTime<Utc>,
        group_sizes: &mut HashMap<NodeGroupId, usize>,
    ) -> Option<UnremovableReason> {
        let name = entry.node.node.as_str();
        let Ok(info) = ctx.snapshot.get_node_info(name) else {
            return Some(UnremovableReason::UnexpectedError(format!(
                "node {name} not found in snapshot"
            )));
        };
        let node = &info.node;
        if node.annotation(ANNOTATION_SCALE_DOWN_DISABLED) == Some("true") {
            return Some(UnremovableReason::ScaleDownDisabledAnnotation);
        }
        if ctx.deletions.is_being_deleted(name) {
            return Some(UnremovableReason::CurrentlyBeingDeleted);
        }
        let Some(group_id) = ctx.cluster_state.node_group_of(name) else {
            return Some(UnremovableReason::NotAutoscaled);
        };
        let options = ctx.cluster_state.node_group_options(group_id);
        if node.ready {
            let grace = if entry.node.is_empty() {
                options.scale_down_empty_unneeded_time
            } else {
                options.scale_down_unneeded_time
            };
            if entry.since + to_chrono(grace) > now {
                return Some(UnremovableReason::NotUnneededLongEnough);
            }
        } else {
            if !ctx.unready_enabled {
                return Some(UnremovableReason::ScaleDownUnreadyDisabled);
            }
            if entry.since + to_chrono(options.scale_down_unready_time) > now {
                return Some(UnremovableReason::NotUnreadyLongEnough);
            }
        }
        let Some(group) = find_node_group(ctx.provider, group_id) else {
            return Some(UnremovableReason::NotAutoscaled);
        };
        let size = match group_sizes.get(group_id) {
            Some(size) => *size,
            None => {
                let target = match group.target_size() {
                    Ok(target) => target,
                    Err(e) => return Some(UnremovableReason::UnexpectedError(e.to_string())),
                };
                let size = target.saturating_sub(ctx.deletions.deletions_count(group_id));
                group_sizes.insert(group_id.clone(), size);
                size
            }
        };
        if size <= group.min_size() {
            return Some(UnremovableReason::NodeGroupMinSizeReached);
        }
        None
    }
}

/// Nodes found unremovable, some of them not to be re-checked for a while.
#[derive(Debug, Clone, Default)]
pub struct UnremovableNodes {
    ttls: BTreeMap<String, DateTime<Utc>>,
    reasons: BTreeMap<String, UnremovableNode>,
}

impl UnremovableNodes {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reason for this iteration.
    pub fn add(&mut self, node: UnremovableNode) {
        self.reasons.insert(node.node.clone(), node);
    }

    /// Records a reason and skips the node until `until`.
    pub fn add_timeout(&mut self, node: UnremovableNode, until: DateTime<Utc>) {
        self.ttls.insert(node.node.clone(), until);
        self.add(node);
    }

    /// Returns true if the node should not be re-checked yet.
    #[must_use]
    pub fn is_recent(&self, node: &str, now: DateTime<Utc>) -> bool {
        self.ttls.get(node).is_some_and(|until| *until > now)
    }

    /// Starts a new iteration: drops expired timeouts, nodes that left the
    /// cluster, and last iteration's reasons.
    pub fn update(&mut self, live_nodes: &HashSet<String>, now: DateTime<Utc>) {
        self.ttls
            .retain(|node, until| *until > now && live_nodes.contains(node));
        self.reasons.clear();
    }

    /// Reason recorded for a node this iteration.
    #[must_use]
    pub fn reason(&self, node: &str) -> Option<&UnremovableReason> {
        self.reasons.get(node).map(|u| &u.reason)
    }

    /// Every node recorded this iteration.
    #[must_use]
    pub fn as_list(&self) -> Vec<UnremovableNode> {
        self.reasons.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::{InMemoryCloudProvider, NodeGroupSpec, ResourceLimiter};
    use crate::config::AutoscalingOptions;
    use crate::events::InMemoryEventRecorder;
    use crate::metrics::AutoscalerMetrics;
    use crate::snapshot::BasicSnapshot;
    use crate::types::{Node, OwnerKind, Pod, Resources, GIB, RESOURCE_CPU};
    use chrono::Duration;
    use std::sync::Arc;

    fn removable(name: &str, group: &str, empty: bool) -> NodeToBeRemoved {
        let pods = if empty {
            Vec::new()
        } else {
            vec![Pod::new("default", format!("{name}-pod"), Resources::new(100, 0))
                .with_owner(OwnerKind::ReplicaSet, "web")]
        };
        NodeToBeRemoved {
            node: name.to_string(),
            group: NodeGroupId::new(group),
            pods_to_reschedule: pods,
            daemonset_pods: Vec::new(),
            utilization: 0.1,
            is_risky: false,
        }
    }

    mod tracking_tests {
        use super::*;

        #[test]
        fn since_carried_forward_within_class() {
            let mut unneeded = UnneededNodes::new();
            let t0 = Utc::now();
            let t1 = t0 + Duration::minutes(1);
            unneeded.update(vec![removable("a", "ng", true), removable("b", "ng", true)], t0);
            unneeded.update(vec![removable("a", "ng", true), removable("b", "ng", false)], t1);
            assert_eq!(unneeded.since("a"), Some(t0));
            assert_eq!(unneeded.since("b"), Some(t1));
        }

        #[test]
        fn disqualified_nodes_dropped() {
            let mut unneeded = UnneededNodes::new();
            let t0 = Utc::now();
            unneeded.update(vec![removable("a", "ng", true), removable("b", "ng", true)], t0);
            unneeded.update(vec![removable("b", "ng", true)], t0 + Duration::minutes(1));
            assert!(!unneeded.contains("a"));
            assert_eq!(unneeded.names(), vec!["b"]);

            unneeded.update(vec![removable("a", "ng", true)], t0 + Duration::minutes(2));
            assert_eq!(unneeded.since("a"), Some(t0 + Duration::minutes(2)));

            unneeded.remove("a");
            assert!(unneeded.is_empty());
        }

        #[test]
        fn unremovable_timeouts_expire() {
            let mut unremovable = UnremovableNodes::new();
            let now = Utc::now();
            let entry = |node: &str| UnremovableNode {
                node: node.to_string(),
                reason: UnremovableReason::NoPlaceToMovePods,
            };
            unremovable.add_timeout(entry("a"), now + Duration::minutes(5));
            unremovable.add_timeout(entry("gone"), now + Duration::minutes(5));
            unremovable.add(entry("b"));
            assert!(unremovable.is_recent("a", now));
            assert!(!unremovable.is_recent("b", now));
            assert_eq!(unremovable.as_list().len(), 3);

            let live: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
            unremovable.update(&live, now + Duration::minutes(1));
            assert!(unremovable.is_recent("a", now + Duration::minutes(1)));
            assert!(!unremovable.is_recent("gone", now + Duration::minutes(1)));
            assert!(unremovable.as_list().is_empty());

            unremovable.update(&live, now + Duration::minutes(6));
            assert!(!unremovable.is_recent("a", now + Duration::minutes(6)));
        }
    }

    mod tracking_proptests {
        use super::*;
        use proptest::prelude::*;

        const NODES: [&str; 3] = ["a", "b", "c"];

        // 0: not removable, 1: empty, 2: needs drain
        fn step_strategy() -> impl Strategy<Value = Vec<[u8; 3]>> {
            proptest::collection::vec(proptest::array::uniform3(0u8..3), 1..12)
        }

        proptest! {
            #[test]
            fn since_only_moves_on_disqualification_or_class_change(steps in step_strategy()) {
                let t0 = Utc::now();
                let mut unneeded = UnneededNodes::new();
                let mut previous: [u8; 3] = [0; 3];
                let mut expected: [Option<DateTime<Utc>>; 3] = [None; 3];

                for (i, step) in steps.iter().enumerate() {
                    let now = t0 + Duration::minutes(i as i64);
                    let removable_now: Vec<NodeToBeRemoved> = NODES
                        .iter()
                        .zip(step.iter())
                        .filter(|(_, class)| **class != 0)
                        .map(|(name, class)| removable(name, "ng", *class == 1))
                        .collect();
                    unneeded.update(removable_now, now);

                    for (j, name) in NODES.iter().enumerate() {
                        expected[j] = match (previous[j], step[j]) {
                            (_, 0) => None,
                            (prev, class) if prev == class => expected[j],
                            _ => Some(now),
                        };
                        prop_assert_eq!(unneeded.since(name), expected[j]);
                        if let Some(since) = unneeded.since(name) {
                            prop_assert!(since <= now);
                        }
                    }
                    previous = *step;
                }
            }
        }
    }

    mod removable_at_tests {
        use super::*;

        struct Fixture {
            provider: Arc<InMemoryCloudProvider>,
            registry: ClusterStateRegistry,
            snapshot: BasicSnapshot,
            deletions: NodeDeletionTracker,
            resources: ResourceManager,
        }

        fn node(name: &str) -> Node {
            Node::new(name, Resources::new(2000, 4 * GIB).with_pods(110))
        }

        fn fixture(min_size: usize, nodes: Vec<Node>, limiter: ResourceLimiter) -> Fixture {
            let provider = Arc::new(InMemoryCloudProvider::new());
            provider
                .add_node_group(NodeGroupSpec::new("ng", min_size, 10, node("tpl")))
                .expect("group");
            for n in &nodes {
                provider.add_node(&NodeGroupId::new("ng"), n).expect("node");
            }
            let mut registry = ClusterStateRegistry::new(
                provider.clone(),
                &AutoscalingOptions::default(),
                Arc::new(InMemoryEventRecorder::new()),
                AutoscalerMetrics::new(),
            );
            registry.update(&nodes, Utc::now()).expect("update");
            let mut snapshot = BasicSnapshot::new();
            snapshot.set_cluster_state(nodes, Vec::new()).expect("state");
            Fixture {
                provider,
                registry,
                snapshot,
                deletions: NodeDeletionTracker::new(),
                resources: ResourceManager::new(limiter, "gpu"),
            }
        }

        impl Fixture {
            fn ctx(&self) -> RemovalContext<'_> {
                RemovalContext {
                    provider: &*self.provider,
                    cluster_state: &self.registry,
                    snapshot: &self.snapshot,
                    deletions: &self.deletions,
                    resources: &self.resources,
                    unready_enabled: true,
                }
            }
        }

        fn reasons(r: &Removable) -> BTreeMap<String, UnremovableReason> {
            r.unremovable
                .iter()
                .map(|u| (u.node.clone(), u.reason.clone()))
                .collect()
        }

        #[test]
        fn waits_for_grace_period() {
            let f = fixture(0, vec![node("a"), node("b")], ResourceLimiter::default());
            let t0 = Utc::now();
            let mut unneeded = UnneededNodes::new();
            unneeded.update(vec![removable("a", "ng", true), removable("b", "ng", false)], t0);

            let early = unneeded.removable_at(&f.ctx(), t0 + Duration::minutes(5));
            assert!(early.empty.is_empty() && early.drain.is_empty());
            assert_eq!(
                reasons(&early)["a"],
                UnremovableReason::NotUnneededLongEnough
            );

            let later = unneeded.removable_at(&f.ctx(), t0 + Duration::minutes(11));
            assert_eq!(later.empty.len(), 1);
            assert_eq!(later.drain.len(), 1);
        }

        #[test]
        fn min_size_counts_accepted_nodes() {
            let f = fixture(1, vec![node("a"), node("b")], ResourceLimiter::default());
            let t0 = Utc::now() - Duration::hours(1);
            let mut unneeded = UnneededNodes::new();
            unneeded.update(vec![removable("a", "ng", true), removable("b", "ng", true)], t0);
            let r = unneeded.removable_at(&f.ctx(), Utc::now());
            assert_eq!(r.empty.len(), 1);
            assert_eq!(r.empty[0].node, "a");
            assert_eq!(reasons(&r)["b"], UnremovableReason::NodeGroupMinSizeReached);
        }

        #[test]
        fn deletions_in_progress_count_against_min_size() {
            let f = fixture(1, vec![node("a"), node("b")], ResourceLimiter::default());
            f.deletions.start_deletion(&NodeGroupId::new("ng"), "b");
            let mut unneeded = UnneededNodes::new();
            unneeded.update(
                vec![removable("a", "ng", true), removable("b", "ng", true)],
                Utc::now() - Duration::hours(1),
            );
            let r = unneeded.removable_at(&f.ctx(), Utc::now());
            let reasons = reasons(&r);
            assert_eq!(reasons["a"], UnremovableReason::NodeGroupMinSizeReached);
            assert_eq!(reasons["b"], UnremovableReason::CurrentlyBeingDeleted);
        }

        #[test]
        fn resource_floor_holds_back_nodes() {
            let limiter = ResourceLimiter::default().with_min(RESOURCE_CPU, 4);
            let f = fixture(0, vec![node("a"), node("b"), node("c")], limiter);
            let mut unneeded = UnneededNodes::new();
            unneeded.update(
                vec![removable("a", "ng", true), removable("b", "ng", true)],
                Utc::now() - Duration::hours(1),
            );
            let r = unneeded.removable_at(&f.ctx(), Utc::now());
            assert_eq!(r.empty.len(), 1);
            assert_eq!(
                reasons(&r)["b"],
                UnremovableReason::MinimalResourceLimitExceeded(vec![RESOURCE_CPU.to_string()])
            );
        }

        #[test]
        fn unready_nodes_use_unready_grace() {
            let t0 = Utc::now() - Duration::minutes(15);
            let f = fixture(0, vec![node("a").not_ready_since(t0)], ResourceLimiter::default());
            let mut unneeded = UnneededNodes::new();
            unneeded.update(vec![removable("a", "ng", true)], t0);
            let r = unneeded.removable_at(&f.ctx(), Utc::now());
            assert_eq!(reasons(&r)["a"], UnremovableReason::NotUnreadyLongEnough);

            let mut ctx = f.ctx();
            ctx.unready_enabled = false;
            let r = unneeded.removable_at(&ctx, Utc::now());
            assert_eq!(reasons(&r)["a"], UnremovableReason::ScaleDownUnreadyDisabled);
        }
    }
}
