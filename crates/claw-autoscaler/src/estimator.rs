//! Binpacking estimator.
//!
//! Given a node group's template and the pods waiting for capacity, the
//! estimator decides how many template nodes would place as many of those
//! pods as possible. Pods are packed hardest first onto simulated nodes in a
//! fork of the snapshot, which is reverted before returning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::scheduler::Scheduler;
use crate::snapshot::ClusterSnapshot;
use crate::types::{NodeInfo, Pod};

/// Result of an estimation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Estimate {
    /// Template nodes needed.
    pub node_count: usize,
    /// Pods that would be placed on them.
    pub scheduled_pods: Vec<Pod>,
}

/// Bounds a single estimation by node count and wall-clock time.
#[derive(Debug, Clone)]
pub struct EstimationLimiter {
    max_nodes: usize,
    max_duration: Duration,
    global_deadline: Option<Instant>,
    started: Option<Instant>,
    nodes: usize,
}

impl EstimationLimiter {
    /// Creates a limiter. Zero `max_nodes` or `max_duration` means unlimited.
    #[must_use]
    pub const fn new(max_nodes: usize, max_duration: Duration, global_deadline: Option<Instant>) -> Self {
        Self {
            max_nodes,
            max_duration,
            global_deadline,
            started: None,
            nodes: 0,
        }
    }

    /// Starts counting for a new estimation.
    pub fn start_estimation(&mut self) {
        self.started = Some(Instant::now());
        self.nodes = 0;
    }

    /// Stops the current estimation.
    pub fn end_estimation(&mut self) {
        self.started = None;
        self.nodes = 0;
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        let now = Instant::now();
        if self.global_deadline.is_some_and(|d| now >= d) {
            return true;
        }
        !self.max_duration.is_zero()
            && self
                .started
                .is_some_and(|s| now.duration_since(s) >= self.max_duration)
    }

    /// Grants one more node if the limits allow it.
    pub fn permission_for_new_node(&mut self) -> bool {
        if self.max_nodes > 0 && self.nodes >= self.max_nodes {
            return false;
        }
        if self.deadline_exceeded() {
            return false;
        }
        self.nodes += 1;
        true
    }
}

/// Packs pods onto template nodes.
#[derive(Debug, Clone)]
pub struct BinpackingEstimator {
    scheduler: Arc<dyn Scheduler>,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(requested: u64, available: u64) -> f64 {
    if available == 0 {
        0.0
    } else {
        requested as f64 / available as f64
    }
}

impl BinpackingEstimator {
    /// Creates an estimator.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Sorts pods so the largest requests, relative to the template, come first.
    fn hardest_first(pods: &[Pod], template: &NodeInfo) -> Vec<Pod> {
        let alloc = &template.node.allocatable;
        let mut scored: Vec<(f64, String, &Pod)> = pods
            .iter()
            .map(|p| {
                let score = ratio(p.requests.cpu_millis, alloc.cpu_millis)
                    + ratio(p.requests.memory_bytes, alloc.memory_bytes);
                (score, p.key(), p)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, _, p)| p.clone()).collect()
    }

    /// Estimates the nodes needed to place `pods` on copies of `template`.
    ///
    /// At most `headroom` nodes are added. The snapshot is left as it was
    /// found.
    pub fn estimate(
        &self,
        pods: &[Pod],
        template: &NodeInfo,
        headroom: usize,
        snapshot: &mut dyn ClusterSnapshot,
        limiter: &mut EstimationLimiter,
    ) -> Estimate {
        limiter.start_estimation();
        snapshot.fork();
        let estimate = self.pack(pods, template, headroom, snapshot, limiter);
        snapshot.revert();
        limiter.end_estimation();
        debug!(
            template = template.name(),
            nodes = estimate.node_count,
            pods = estimate.scheduled_pods.len(),
            "binpacking estimate"
        );
        estimate
    }

    fn pack(
        &self,
        pods: &[Pod],
        template: &NodeInfo,
        headroom: usize,
        snapshot: &mut dyn ClusterSnapshot,
        limiter: &mut EstimationLimiter,
    ) -> Estimate {
        let mut new_nodes: Vec<String> = Vec::new();
        let mut scheduled = Vec::new();

        for pod in Self::hardest_first(pods, template) {
            if limiter.deadline_exceeded() {
                warn!(template = template.name(), "binpacking deadline exceeded, using partial estimate");
                break;
            }

            let existing = {
                let accept = |info: &NodeInfo| new_nodes.iter().any(|n| n == info.name());
                self.scheduler.fits_any_node(&*snapshot, &pod, &accept)
            };
            if let Some(node) = existing {
                if snapshot.add_pod(pod.clone(), &node).is_ok() {
                    scheduled.push(pod);
                }
                continue;
            }

            if new_nodes.len() >= headroom || !limiter.permission_for_new_node() {
                continue;
            }
            let info = instantiate(template, new_nodes.len());
            let name = info.name().to_string();
            if snapshot.add_node_info(info).is_err() {
                continue;
            }
            let fits = self.scheduler.check_predicates(&*snapshot, &pod, &name).is_ok();
            if fits && snapshot.add_pod(pod.clone(), &name).is_ok() {
                new_nodes.push(name);
                scheduled.push(pod);
            } else {
                // the pod does not fit an empty template node
                let _ = snapshot.remove_node(&name);
            }
        }

        Estimate {
            node_count: new_nodes.len(),
            scheduled_pods: scheduled,
        }
    }
}

fn instantiate(template: &NodeInfo, index: usize) -> NodeInfo {
    let mut node = template.node.clone();
    node.name = format!("{}-estimated-{index}", template.name());
    node.provider_id.clone_from(&node.name);
    let pods = template.pods().iter().map(|p| {
        let mut pod = p.clone();
        pod.name = format!("{}-estimated-{index}", p.name);
        pod
    });
    NodeInfo::with_pods(node, pods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PredicateChecker;
    use crate::snapshot::{test_util::dump, BasicSnapshot, DeltaSnapshot};
    use crate::types::{Node, OwnerKind, Resources, MIB};
    use proptest::prelude::*;

    fn template() -> NodeInfo {
        NodeInfo::new(Node::new(
            "template-node-for-ng1",
            Resources::new(1000, 1000 * MIB).with_pods(110),
        ))
    }

    fn pod(name: &str, cpu: u64, mem_mib: u64) -> Pod {
        Pod::new("default", name, Resources::new(cpu, mem_mib * MIB)).unschedulable()
    }

    fn estimator() -> BinpackingEstimator {
        BinpackingEstimator::new(Arc::new(PredicateChecker::new()))
    }

    fn unlimited() -> EstimationLimiter {
        EstimationLimiter::new(0, Duration::ZERO, None)
    }

    #[test]
    fn packs_pods_hardest_first() {
        let mut snapshot = BasicSnapshot::new();
        let pods = vec![
            pod("a", 300, 100),
            pod("b", 600, 100),
            pod("c", 400, 100),
            pod("d", 700, 100),
        ];
        let estimate = estimator().estimate(&pods, &template(), 10, &mut snapshot, &mut unlimited());
        // d -> node0, b -> node1, c -> node1, a -> node0
        assert_eq!(estimate.node_count, 2);
        assert_eq!(estimate.scheduled_pods.len(), 4);
        assert_eq!(snapshot.node_count(), 0);
    }

    #[test]
    fn headroom_limits_nodes() {
        let mut snapshot = BasicSnapshot::new();
        let pods: Vec<Pod> = (0..5).map(|i| pod(&format!("p{i}"), 600, 10)).collect();
        let estimate = estimator().estimate(&pods, &template(), 2, &mut snapshot, &mut unlimited());
        assert_eq!(estimate.node_count, 2);
        assert_eq!(estimate.scheduled_pods.len(), 2);
    }

    #[test]
    fn limiter_caps_nodes() {
        let mut snapshot = BasicSnapshot::new();
        let pods: Vec<Pod> = (0..5).map(|i| pod(&format!("p{i}"), 600, 10)).collect();
        let mut limiter = EstimationLimiter::new(3, Duration::ZERO, None);
        let estimate = estimator().estimate(&pods, &template(), 10, &mut snapshot, &mut limiter);
        assert_eq!(estimate.node_count, 3);
    }

    #[test]
    fn oversized_pod_is_skipped() {
        let mut snapshot = BasicSnapshot::new();
        let pods = vec![pod("huge", 4000, 10), pod("small", 100, 10)];
        let estimate = estimator().estimate(&pods, &template(), 10, &mut snapshot, &mut unlimited());
        assert_eq!(estimate.node_count, 1);
        assert_eq!(estimate.scheduled_pods.len(), 1);
        assert_eq!(estimate.scheduled_pods[0].name, "small");
    }

    #[test]
    fn template_pods_take_capacity() {
        let ds = Pod::new("kube-system", "ds", Resources::new(500, 0))
            .with_owner(OwnerKind::DaemonSet, "ds");
        let template = NodeInfo::with_pods(template().node, vec![ds]);
        let mut snapshot = BasicSnapshot::new();
        let pods = vec![pod("a", 400, 10), pod("b", 400, 10)];
        let estimate = estimator().estimate(&pods, &template, 10, &mut snapshot, &mut unlimited());
        assert_eq!(estimate.node_count, 2);
    }

    #[test]
    fn expired_deadline_returns_empty_estimate() {
        let mut snapshot = BasicSnapshot::new();
        let pods = vec![pod("a", 100, 10)];
        let past = Instant::now();
        let mut limiter = EstimationLimiter::new(0, Duration::ZERO, Some(past));
        let estimate = estimator().estimate(&pods, &template(), 10, &mut snapshot, &mut limiter);
        assert_eq!(estimate, Estimate::default());
    }

    #[test]
    fn snapshot_is_restored() {
        let mut snapshot = DeltaSnapshot::new();
        snapshot
            .add_node(Node::new("n1", Resources::new(1000, 1000 * MIB)))
            .expect("node");
        let before = dump(&snapshot);
        let pods = vec![pod("a", 100, 10)];
        let _ = estimator().estimate(&pods, &template(), 10, &mut snapshot, &mut unlimited());
        assert_eq!(dump(&snapshot), before);
        assert_eq!(snapshot.fork_depth(), 0);
    }

    proptest! {
        #[test]
        fn estimate_is_deterministic(
            requests in proptest::collection::vec((1u64..1200, 1u64..1200), 0..25),
            headroom in 0usize..12,
        ) {
            let pods: Vec<Pod> = requests
                .iter()
                .enumerate()
                .map(|(i, (cpu, mem))| pod(&format!("p{i}"), *cpu, *mem))
                .collect();
            let mut reversed = pods.clone();
            reversed.reverse();
            let mut s1 = BasicSnapshot::new();
            let mut s2 = DeltaSnapshot::new();
            let a = estimator().estimate(&pods, &template(), headroom, &mut s1, &mut unlimited());
            let b = estimator().estimate(&reversed, &template(), headroom, &mut s2, &mut unlimited());
            prop_assert_eq!(&a, &b);
            prop_assert!(a.node_count <= headroom);
            prop_assert!(a.scheduled_pods.len() <= pods.len());
        }
    }
}
