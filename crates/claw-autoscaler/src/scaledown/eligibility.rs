//! Which nodes are worth simulating for removal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::unneeded::UnremovableNodes;
use crate::clusterstate::ClusterStateRegistry;
use crate::snapshot::ClusterSnapshot;
use crate::status::{UnremovableNode, UnremovableReason};
use crate::types::NodeInfo;

/// `true` keeps the autoscaler from removing the node.
pub const ANNOTATION_SCALE_DOWN_DISABLED: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

/// Requested over allocatable, per resource.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilizationInfo {
    /// CPU ratio.
    pub cpu: f64,
    /// Memory ratio.
    pub memory: f64,
    /// GPU ratio; zero on nodes without GPUs.
    pub gpu: f64,
    /// The ratio compared against the threshold.
    pub result: f64,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(requested: u64, allocatable: u64) -> f64 {
    if allocatable == 0 {
        0.0
    } else {
        requested as f64 / allocatable as f64
    }
}

/// Computes node utilization.
///
/// GPU nodes are judged by their GPU ratio alone; other nodes by the larger
/// of the CPU and memory ratios. With `ignore_daemonsets`, DaemonSet and
/// mirror pods do not count.
#[must_use]
pub fn calculate_utilization(info: &NodeInfo, ignore_daemonsets: bool) -> UtilizationInfo {
    let (mut cpu, mut memory, mut gpus) = (0u64, 0u64, 0u64);
    for pod in info.pods() {
        if ignore_daemonsets && (pod.is_daemonset() || pod.is_mirror()) {
            continue;
        }
        if pod.is_terminal() {
            continue;
        }
        cpu = cpu.saturating_add(pod.requests.cpu_millis);
        memory = memory.saturating_add(pod.requests.memory_bytes);
        gpus = gpus.saturating_add(pod.requests.gpus());
    }
    let allocatable = &info.node.allocatable;
    let cpu = ratio(cpu, allocatable.cpu_millis);
    let memory = ratio(memory, allocatable.memory_bytes);
    if allocatable.gpus() > 0 {
        let gpu = ratio(gpus, allocatable.gpus());
        return UtilizationInfo {
            cpu,
            memory,
            gpu,
            result: gpu,
        };
    }
    UtilizationInfo {
        cpu,
        memory,
        gpu: 0.0,
        result: cpu.max(memory),
    }
}

/// Output of the eligibility filter.
#[derive(Debug, Clone, Default)]
pub struct Eligibility {
    /// Nodes to simulate, in input order.
    pub eligible: Vec<String>,
    /// Utilization of every node that got that far.
    pub utilization: BTreeMap<String, UtilizationInfo>,
    /// Nodes filtered out, with reasons.
    pub ineligible: Vec<UnremovableNode>,
}

/// Filters out nodes that cannot or should not be removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct EligibilityChecker;

impl EligibilityChecker {
    /// Creates a checker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Splits candidates into eligible and ineligible nodes.
    #[must_use]
    pub fn filter_out_unremovable(
        &self,
        snapshot: &dyn ClusterSnapshot,
        candidates: &[String],
        cluster_state: &ClusterStateRegistry,
        unremovable: &UnremovableNodes,
        now: DateTime<Utc>,
    ) -> Eligibility {
        let mut result = Eligibility::default();
        for name in candidates {
            let reject = |reason| UnremovableNode {
                node: name.clone(),
                reason,
            };
            if unremovable.is_recent(name, now) {
                result.ineligible.push(reject(UnremovableReason::RecentlyUnremovable));
                continue;
            }
            let Ok(info) = snapshot.get_node_info(name) else {
                debug!(node = %name, "candidate missing from snapshot");
                result.ineligible.push(reject(UnremovableReason::UnexpectedError(
                    "node not found in snapshot".into(),
                )));
                continue;
            };
            if info.node.annotation(ANNOTATION_SCALE_DOWN_DISABLED) == Some("true") {
                result
                    .ineligible
                    .push(reject(UnremovableReason::ScaleDownDisabledAnnotation));
                continue;
            }
            let Some(group) = cluster_state.node_group_of(name) else {
                result.ineligible.push(reject(UnremovableReason::NotAutoscaled));
                continue;
            };
            let options = cluster_state.node_group_options(group);
            let utilization = calculate_utilization(info, options.ignore_daemonsets_utilization);
            result.utilization.insert(name.clone(), utilization);

            // unready nodes are candidates whatever their load
            if info.node.ready {
                let threshold = if info.node.allocatable.gpus() > 0 {
                    options.scale_down_gpu_utilization_threshold
                } else {
                    options.scale_down_utilization_threshold
                };
                if utilization.result >= threshold {
                    trace!(node = %name, utilization = utilization.result, threshold, "node not underutilized");
                    result.ineligible.push(reject(UnremovableReason::NotUnderutilized));
                    continue;
                }
            }
            result.eligible.push(name.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::{InMemoryCloudProvider, NodeGroupSpec};
    use crate::config::AutoscalingOptions;
    use crate::events::InMemoryEventRecorder;
    use crate::metrics::AutoscalerMetrics;
    use crate::snapshot::BasicSnapshot;
    use crate::types::{Node, NodeGroupId, OwnerKind, Pod, Resources, GIB};
    use std::sync::Arc;
    use test_case::test_case;

    fn node(name: &str) -> Node {
        Node::new(name, Resources::new(1000, GIB).with_pods(110))
    }

    fn pod(name: &str, cpu: u64, node: &str) -> Pod {
        Pod::new("default", name, Resources::new(cpu, 0))
            .with_owner(OwnerKind::ReplicaSet, "web")
            .on_node(node)
    }

    #[test_case(200, 0, 0.2; "cpu bound")]
    #[test_case(100, GIB / 2, 0.5; "memory bound")]
    fn utilization_is_max_of_cpu_and_memory(cpu: u64, memory: u64, expected: f64) {
        let p = Pod::new("default", "p", Resources::new(cpu, memory)).on_node("n");
        let info = NodeInfo::with_pods(node("n"), [p]);
        let u = calculate_utilization(&info, false);
        assert!((u.result - expected).abs() < 1e-9);
    }

    #[test]
    fn gpu_nodes_use_gpu_ratio() {
        let gpu_node = Node::new("g", Resources::new(1000, GIB).with_gpus(4));
        let p = Pod::new("default", "p", Resources::new(900, 0).with_gpus(1)).on_node("g");
        let u = calculate_utilization(&NodeInfo::with_pods(gpu_node, [p]), false);
        assert!((u.result - 0.25).abs() < 1e-9);
        assert!((u.cpu - 0.9).abs() < 1e-9);
    }

    #[test]
    fn daemonsets_excluded_when_configured() {
        let ds = Pod::new("kube-system", "ds", Resources::new(500, 0))
            .with_owner(OwnerKind::DaemonSet, "ds")
            .on_node("n");
        let info = NodeInfo::with_pods(node("n"), [ds]);
        assert!((calculate_utilization(&info, false).result - 0.5).abs() < 1e-9);
        assert!(calculate_utilization(&info, true).result.abs() < 1e-9);
    }

    fn registry(provider: &Arc<InMemoryCloudProvider>, nodes: &[Node]) -> ClusterStateRegistry {
        let mut registry = ClusterStateRegistry::new(
            provider.clone(),
            &AutoscalingOptions::default(),
            Arc::new(InMemoryEventRecorder::new()),
            AutoscalerMetrics::new(),
        );
        registry.update(nodes, Utc::now()).expect("update");
        registry
    }

    #[test]
    fn filter_reports_reasons() {
        let provider = Arc::new(InMemoryCloudProvider::new());
        provider
            .add_node_group(NodeGroupSpec::new("ng1", 0, 10, node("tpl")))
            .expect("group");
        let busy = node("busy");
        let idle = node("idle");
        let pinned = node("pinned").with_annotation(ANNOTATION_SCALE_DOWN_DISABLED, "true");
        let unready = node("unready").not_ready_since(Utc::now());
        for n in [&busy, &idle, &pinned, &unready] {
            provider.add_node(&NodeGroupId::new("ng1"), n).expect("node");
        }
        let stray = node("stray");
        let nodes = vec![busy.clone(), idle.clone(), pinned.clone(), unready.clone(), stray.clone()];
        let registry = registry(&provider, &nodes);

        let mut snapshot = BasicSnapshot::new();
        snapshot
            .set_cluster_state(
                nodes,
                vec![pod("a", 800, "busy"), pod("b", 800, "unready"), pod("c", 100, "idle")],
            )
            .expect("state");

        let mut unremovable = UnremovableNodes::default();
        let now = Utc::now();
        unremovable.add_timeout(
            UnremovableNode {
                node: "recent".into(),
                reason: UnremovableReason::NoPlaceToMovePods,
            },
            now + chrono::Duration::minutes(5),
        );

        let candidates: Vec<String> = ["busy", "idle", "pinned", "unready", "stray", "recent"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let result = EligibilityChecker::new().filter_out_unremovable(
            &snapshot,
            &candidates,
            &registry,
            &unremovable,
            now,
        );
        assert_eq!(result.eligible, vec!["idle", "unready"]);
        let reasons: BTreeMap<&str, &UnremovableReason> = result
            .ineligible
            .iter()
            .map(|u| (u.node.as_str(), &u.reason))
            .collect();
        assert_eq!(reasons["busy"], &UnremovableReason::NotUnderutilized);
        assert_eq!(reasons["pinned"], &UnremovableReason::ScaleDownDisabledAnnotation);
        assert_eq!(reasons["stray"], &UnremovableReason::NotAutoscaled);
        assert_eq!(reasons["recent"], &UnremovableReason::RecentlyUnremovable);
        assert!(result.utilization.contains_key("idle"));
    }
}
