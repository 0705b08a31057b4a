//! End-to-end autoscaling scenarios.
//!
//! Each test drives the autoscaler through the in-memory cloud provider and
//! cluster. Between iterations the harness registers provisioned instances
//! and binds pending pods, standing in for the kubelet and the scheduler.

mod helpers;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use claw_autoscaler::cloudprovider::{CloudCall, FailureOp, NodeGroupSpec, ResourceLimiter};
use claw_autoscaler::status::NodeDeleteResult;
use claw_autoscaler::types::{Node, Resources, MIB, RESOURCE_CPU};
use claw_autoscaler::{
    AutoscalingOptions, InMemoryCloudProvider, InMemoryCluster, NodeGroupId, ScaleDownResult,
    ScaleUpResult,
};

use helpers::{
    add_nodes, app_pdb, eager_scale_down, replica, small_group, workload, Harness,
};

// ============================================================================
// Scale-up
// ============================================================================

#[tokio::test]
async fn test_scale_up_from_one_to_two() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1"]);
    cluster.add_pod(replica("web", "p1", 600).on_node("n1"));
    cluster.add_pod(replica("web", "p2", 600).unschedulable());
    let mut h = Harness::new(AutoscalingOptions::default(), provider, cluster);

    let summary = h.step(Utc::now()).await;

    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(h.target("ng1"), 2);
    assert_eq!(h.node_count(), 2);
    let p2 = h.cluster.pod("default/p2").expect("p2");
    let bound_to = p2.node_name.expect("p2 is bound");
    assert_ne!(bound_to, "n1");
    assert!(h.cluster.node(&bound_to).is_some());
    assert_eq!(h.metrics.scaled_up_nodes(), 1);
}

#[tokio::test]
async fn test_resource_ceiling_blocks_scale_up() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    provider.set_resource_limiter(ResourceLimiter::default().with_max(RESOURCE_CPU, 1));
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1"]);
    cluster.add_pod(replica("web", "p0", 600).on_node("n1"));
    cluster.add_pod(replica("web", "p1", 600).unschedulable());
    let mut h = Harness::new(AutoscalingOptions::default(), provider.clone(), cluster);
    let now = Utc::now();

    let summary = h.step(now).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::NoOptionsAvailable);
    assert_eq!(h.target("ng1"), 1);
    let remaining = &summary.scale_up.pods_remain_unschedulable;
    assert_eq!(remaining.len(), 1);
    assert!(
        remaining[0].message().contains("max cluster cores limit reached"),
        "unexpected message: {}",
        remaining[0].message()
    );

    provider.set_resource_limiter(ResourceLimiter::default().with_max(RESOURCE_CPU, 2));
    let summary = h.step(now + Duration::seconds(10)).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(h.target("ng1"), 2);
}

#[tokio::test]
async fn test_configured_core_ceiling_blocks_scale_up() {
    let build = |max_cores: u64| {
        let provider = Arc::new(InMemoryCloudProvider::new());
        provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
        let cluster = Arc::new(InMemoryCluster::new());
        add_nodes(&provider, &cluster, "ng1", &["n1"]);
        cluster.add_pod(replica("web", "p0", 600).on_node("n1"));
        cluster.add_pod(replica("web", "p1", 600).unschedulable());
        let mut options = AutoscalingOptions::default();
        options.limits.max_cores_total = max_cores;
        Harness::new(options, provider, cluster)
    };
    let now = Utc::now();

    let mut h = build(1);
    let summary = h.step(now).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::NoOptionsAvailable);
    assert_eq!(h.target("ng1"), 1);
    let remaining = &summary.scale_up.pods_remain_unschedulable;
    assert_eq!(remaining.len(), 1);
    assert!(
        remaining[0].message().contains("max cluster cores limit reached"),
        "unexpected message: {}",
        remaining[0].message()
    );

    let mut h = build(2);
    let summary = h.step(now).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(h.target("ng1"), 2);
}

#[tokio::test]
async fn test_priority_expander_prefers_highest_matching_bucket() {
    let mut options = AutoscalingOptions::default();
    options.scale_up.expander_names = vec!["priority".to_string()];
    let mut priorities = BTreeMap::new();
    priorities.insert(
        10,
        vec![r".*t2\.large.*".to_string(), r".*t3\.large.*".to_string()],
    );
    priorities.insert(50, vec![r".*m4\.4xlarge.*".to_string()]);
    options.scale_up.priorities = priorities;

    // only the priority-10 groups are offered
    let provider = Arc::new(InMemoryCloudProvider::new());
    for id in ["my-asg.t2.large", "my-asg.t3.large"] {
        provider.add_node_group(small_group(id, 0, 5)).expect("group");
    }
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_pod(replica("web", "p1", 600).unschedulable());
    let mut h = Harness::new(options.clone(), provider.clone(), cluster);
    let summary = h.step(Utc::now()).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    let chosen = &summary.scale_up.scale_up_infos[0].group;
    assert!(
        chosen.as_str() == "my-asg.t2.large" || chosen.as_str() == "my-asg.t3.large",
        "chose {chosen}"
    );

    // the m4 group wins once it is an option
    let provider = Arc::new(InMemoryCloudProvider::new());
    for id in ["my-asg.t2.large", "my-asg.t3.large", "my-asg.m4.4xlarge"] {
        provider.add_node_group(small_group(id, 0, 5)).expect("group");
    }
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_pod(replica("web", "p1", 600).unschedulable());
    let mut h = Harness::new(options, provider.clone(), cluster);
    h.step(Utc::now()).await;
    assert_eq!(
        provider.calls(),
        vec![CloudCall::IncreaseSize {
            group: NodeGroupId::new("my-asg.m4.4xlarge"),
            delta: 1,
        }]
    );
}

#[tokio::test]
async fn test_failed_resize_backs_off_group() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1"]);
    cluster.add_pod(replica("web", "p1", 600).on_node("n1"));
    cluster.add_pod(replica("web", "p2", 600).unschedulable());
    let id = NodeGroupId::new("ng1");
    provider.set_failure(&id, FailureOp::IncreaseSize, "quota exceeded");
    let mut h = Harness::new(AutoscalingOptions::default(), provider.clone(), cluster);
    let start = Utc::now();

    let summary = h.step(start).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Error);
    assert_eq!(summary.scale_up.failed_resize_groups, vec![id.clone()]);
    assert!(h.autoscaler.cluster_state().backoff_status(&id, start).backed_off);

    // still backed off a minute later, even though the provider recovered
    provider.clear_failure(&id, FailureOp::IncreaseSize);
    let summary = h.step(start + Duration::minutes(1)).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::NoOptionsAvailable);
    assert!(
        summary.scale_up.pods_remain_unschedulable[0]
            .message()
            .contains("in backoff after failed scale-up")
    );
    assert_eq!(h.target("ng1"), 1);

    // eligible again once the initial backoff has passed
    let later = start + Duration::minutes(6);
    let summary = h.step(later).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(h.target("ng1"), 2);
    assert!(!h.autoscaler.cluster_state().backoff_status(&id, later).backed_off);

    // the success cleared the failure history: the next failure starts over
    // at the initial backoff instead of doubling it
    h.cluster.add_pod(replica("web", "p3", 600).unschedulable());
    provider.set_failure(&id, FailureOp::IncreaseSize, "quota exceeded");
    let failed_at = start + Duration::minutes(7);
    let summary = h.step(failed_at).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Error);
    let status = h.autoscaler.cluster_state().backoff_status(&id, failed_at);
    assert!(status.backed_off);
    assert_eq!(status.until, Some(failed_at + Duration::minutes(5)));
    assert!(
        h.autoscaler
            .cluster_state()
            .backoff_status(&id, failed_at + Duration::minutes(4))
            .backed_off
    );
    assert!(
        !h.autoscaler
            .cluster_state()
            .backoff_status(&id, failed_at + Duration::minutes(5))
            .backed_off
    );
}

// ============================================================================
// Scale-down
// ============================================================================

#[tokio::test]
async fn test_idle_node_removed_after_grace_period() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2"]);
    cluster.add_workload(workload("web", 1));
    cluster.add_pod(replica("web", "p1", 600).on_node("n1"));
    let mut h = Harness::new(AutoscalingOptions::default(), provider, cluster);
    let start = Utc::now();

    // detection
    let summary = h.step(start).await;
    assert_eq!(summary.scale_down.result, ScaleDownResult::NoNodeDeleted);
    assert_eq!(h.target("ng1"), 2);
    let unneeded: Vec<String> = h.autoscaler.planner().unneeded_names();
    assert_eq!(unneeded, vec!["n2".to_string()]);

    // still inside the grace period
    let summary = h.step(start + Duration::minutes(5)).await;
    assert_eq!(summary.scale_down.result, ScaleDownResult::NoNodeDeleted);

    // deletion
    let summary = h.step(start + Duration::minutes(11)).await;
    assert_eq!(summary.scale_down.result, ScaleDownResult::NodeDeleteStarted);
    assert_eq!(summary.scale_down.deleted_nodes(), vec!["n2"]);
    assert_eq!(h.target("ng1"), 1);
    assert_eq!(h.node_count(), 1);
    assert_eq!(h.metrics.scaled_down_nodes("empty"), 1);
}

#[tokio::test]
async fn test_exhausted_pdb_defers_drain() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2", "n3"]);
    cluster.add_workload(workload("web", 2));
    cluster.add_workload(workload("filler", 2));
    cluster.add_pod(replica("filler", "f1", 600).on_node("n1"));
    cluster.add_pod(replica("filler", "f2", 600).on_node("n2"));
    cluster.add_pod(replica("web", "a", 200).on_node("n3"));
    cluster.add_pod(replica("web", "b", 200).on_node("n3"));
    // two healthy replicas, at least one must stay up
    cluster.add_pdb_min_available(app_pdb("web"), 1);
    let mut h = Harness::new(eager_scale_down(), provider, cluster);
    let start = Utc::now();

    let summary = h.step(start).await;
    assert_eq!(summary.scale_down.result, ScaleDownResult::NodeDeleteStarted);
    assert_eq!(
        summary.scale_down.node_delete_results["n3"],
        NodeDeleteResult::Deferred
    );
    assert_eq!(h.cluster.evictions(), vec!["default/a".to_string()]);
    assert_eq!(h.target("ng1"), 3);
    let n3 = h.cluster.node("n3").expect("n3 kept");
    assert!(!n3.has_taint(claw_autoscaler::kube::TO_BE_DELETED_TAINT));

    // the replacement of `a` is running elsewhere, so `b` may go now
    let summary = h.step(start + Duration::minutes(1)).await;
    assert_eq!(summary.scale_down.deleted_nodes(), vec!["n3"]);
    assert_eq!(
        h.cluster.evictions(),
        vec!["default/a".to_string(), "default/b".to_string()]
    );
    assert_eq!(h.target("ng1"), 2);
}

#[tokio::test]
async fn test_scale_down_respects_min_size() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 2, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2"]);
    let mut h = Harness::new(eager_scale_down(), provider.clone(), cluster);
    let start = Utc::now();

    for i in 0..3 {
        h.step(start + Duration::minutes(i)).await;
    }
    assert_eq!(h.target("ng1"), 2);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_gpu_group_uses_gpu_template() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    let gpu_template = Node::new(
        "gpu-template",
        Resources::new(4000, 16000 * MIB).with_pods(110).with_gpus(1),
    )
    .with_label(InMemoryCloudProvider::GPU_LABEL, "nvidia-a100");
    provider
        .add_node_group(NodeGroupSpec::new("gpu", 0, 4, gpu_template))
        .expect("gpu group");
    provider.add_node_group(small_group("cpu", 0, 4)).expect("cpu group");
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_pod(
        claw_autoscaler::Pod::new("default", "trainer", Resources::new(1000, 0).with_gpus(1))
            .unschedulable(),
    );
    let mut h = Harness::new(AutoscalingOptions::default(), provider.clone(), cluster);

    let summary = h.step(Utc::now()).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(h.target("gpu"), 1);
    assert_eq!(h.target("cpu"), 0);
    assert!(h.cluster.pod("default/trainer").expect("trainer").node_name.is_some());
}
