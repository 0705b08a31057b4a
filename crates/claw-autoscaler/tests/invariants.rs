//! Cross-module invariants checked over whole iterations.

mod helpers;

use std::sync::Arc;

use chrono::{Duration, Utc};
use claw_autoscaler::cloudprovider::{CloudCall, FailureOp};
use claw_autoscaler::{
    AutoscalingOptions, InMemoryCloudProvider, InMemoryCluster, NodeGroupId, ScaleDownResult,
    ScaleUpResult,
};
use proptest::prelude::*;

use helpers::{add_nodes, eager_scale_down, replica, small_group, workload, Harness};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

// ============================================================================
// Group bounds
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn targets_stay_within_group_bounds(
        min in 0usize..3,
        extra in 0usize..4,
        running in 0usize..4,
        pending in prop::collection::vec(100u64..900, 0..8),
    ) {
        let max = min + extra + 1;
        let running = running.clamp(min, max);
        let provider = Arc::new(InMemoryCloudProvider::new());
        provider.add_node_group(small_group("ng1", min, max)).expect("group");
        let cluster = Arc::new(InMemoryCluster::new());
        let names: Vec<String> = (0..running).map(|i| format!("n{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        add_nodes(&provider, &cluster, "ng1", &refs);
        cluster.add_workload(workload("web", u32::try_from(pending.len()).unwrap_or(0)));
        for (i, cpu) in pending.iter().enumerate() {
            cluster.add_pod(replica("web", &format!("p{i}"), *cpu).unschedulable());
        }
        let mut h = Harness::new(eager_scale_down(), provider, cluster);
        let start = Utc::now();

        let rt = runtime();
        for i in 0..4 {
            rt.block_on(h.step(start + Duration::minutes(i)));
            let target = h.target("ng1");
            prop_assert!(target >= min, "target {} below min {}", target, min);
            prop_assert!(target <= max, "target {} above max {}", target, max);
        }
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_quiet_cluster_makes_no_cloud_calls() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2"]);
    cluster.add_workload(workload("web", 2));
    cluster.add_pod(replica("web", "p1", 700).on_node("n1"));
    cluster.add_pod(replica("web", "p2", 700).on_node("n2"));
    let mut h = Harness::new(AutoscalingOptions::default(), provider.clone(), cluster);
    let start = Utc::now();

    let first = h.step(start).await;
    let second = h.step(start + Duration::seconds(10)).await;
    assert_eq!(first.scale_up.result, ScaleUpResult::NotNeeded);
    assert_eq!(second.scale_up.result, ScaleUpResult::NotNeeded);
    assert_eq!(second.scale_down.result, ScaleDownResult::NoUnneeded);
    assert!(provider.calls().is_empty());
}

// ============================================================================
// Scale-down limits
// ============================================================================

#[tokio::test]
async fn test_deletions_per_iteration_capped_by_parallelism() {
    let mut options = eager_scale_down();
    options.scale_down.max_scale_down_parallelism = 2;
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2", "n3", "n4", "n5"]);
    let mut h = Harness::new(options, provider, cluster);
    let start = Utc::now();

    let mut previous = h.target("ng1");
    for i in 0..3 {
        let summary = h.step(start + Duration::minutes(i)).await;
        assert!(summary.scale_down.deleted_nodes().len() <= 2);
        let target = h.target("ng1");
        assert!(previous - target <= 2);
        previous = target;
    }
    assert_eq!(h.target("ng1"), 0);
}

#[tokio::test]
async fn test_scale_up_suppresses_scale_down_in_same_iteration() {
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng1", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng1", &["n1", "n2", "n3"]);
    cluster.add_workload(workload("web", 4));
    cluster.add_pod(replica("web", "p1", 700).on_node("n1"));
    cluster.add_pod(replica("web", "p2", 700).on_node("n2"));
    cluster.add_pod(replica("web", "p4", 200).on_node("n3"));
    cluster.add_pod(replica("web", "p3", 900).unschedulable());
    let mut h = Harness::new(eager_scale_down(), provider, cluster);

    let summary = h.step(Utc::now()).await;
    assert_eq!(summary.scale_up.result, ScaleUpResult::Successful);
    assert_eq!(summary.scale_down.result, ScaleDownResult::NotTried);
    // n3 was under-utilized but nothing was deleted
    assert_eq!(h.target("ng1"), 4);
}

#[tokio::test]
async fn test_partially_applied_scale_up_suppresses_scale_down() {
    let mut options = eager_scale_down();
    options.scale_up.balance_similar_node_groups = true;
    let provider = Arc::new(InMemoryCloudProvider::new());
    provider.add_node_group(small_group("ng-a", 0, 10)).expect("group");
    provider.add_node_group(small_group("ng-b", 0, 10)).expect("group");
    let cluster = Arc::new(InMemoryCluster::new());
    add_nodes(&provider, &cluster, "ng-a", &["a1", "a2"]);
    add_nodes(&provider, &cluster, "ng-b", &["b1"]);
    cluster.add_workload(workload("web", 6));
    cluster.add_pod(replica("web", "p1", 700).on_node("a1"));
    cluster.add_pod(replica("web", "p2", 200).on_node("a2"));
    cluster.add_pod(replica("web", "p3", 700).on_node("b1"));
    for name in ["p4", "p5", "p6"] {
        cluster.add_pod(replica("web", name, 900).unschedulable());
    }
    // ng-a is resized first; ng-b fails after that
    provider.set_failure(&NodeGroupId::new("ng-b"), FailureOp::IncreaseSize, "quota exceeded");
    let mut h = Harness::new(options, provider.clone(), cluster);

    let summary = h.step(Utc::now()).await;

    assert_eq!(summary.scale_up.result, ScaleUpResult::Error);
    assert!(summary.scale_up.scaled_up());
    assert!(!summary.scale_up.scale_up_infos.is_empty());
    assert_eq!(summary.scale_down.result, ScaleDownResult::NotTried);
    assert!(summary.scaled());
    // a2 was under-utilized but nothing was deleted
    assert!(!provider
        .calls()
        .iter()
        .any(|c| matches!(c, CloudCall::DeleteNodes { .. })));
    assert_eq!(h.target("ng-a"), 3);
    assert_eq!(h.target("ng-b"), 1);
}
