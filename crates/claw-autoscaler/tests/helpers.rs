//! Shared fixtures for the autoscaler integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use claw_autoscaler::cloudprovider::NodeGroupSpec;
use claw_autoscaler::scheduler::PredicateChecker;
use claw_autoscaler::types::{OwnerKind, PodDisruptionBudget, Workload, MIB};
use claw_autoscaler::{
    Autoscaler, AutoscalerMetrics, AutoscalingOptions, InMemoryCloudProvider, InMemoryCluster,
    InMemoryEventRecorder, IterationSummary, Node, NodeGroupId, Pod, Resources,
};

/// A cluster, its provider and an autoscaler wired to both.
pub struct Harness {
    pub provider: Arc<InMemoryCloudProvider>,
    pub cluster: Arc<InMemoryCluster>,
    pub events: Arc<InMemoryEventRecorder>,
    pub metrics: AutoscalerMetrics,
    pub autoscaler: Autoscaler<InMemoryCluster>,
}

impl Harness {
    /// Builds a harness once groups, nodes and pods are in place.
    pub fn new(
        options: AutoscalingOptions,
        provider: Arc<InMemoryCloudProvider>,
        cluster: Arc<InMemoryCluster>,
    ) -> Self {
        let events = Arc::new(InMemoryEventRecorder::new());
        let metrics = AutoscalerMetrics::new();
        let autoscaler = Autoscaler::new(
            options,
            provider.clone(),
            cluster.clone(),
            cluster.clone(),
            events.clone(),
            metrics.clone(),
        )
        .expect("autoscaler");
        Self {
            provider,
            cluster,
            events,
            metrics,
            autoscaler,
        }
    }

    /// Runs one iteration, then lets the world catch up: provisioned
    /// instances register and pending pods get bound.
    pub async fn step(&mut self, now: DateTime<Utc>) -> IterationSummary {
        let summary = self.autoscaler.run_once(now).await.expect("iteration");
        self.cluster
            .reconcile_with_provider(&self.provider, now)
            .expect("reconcile");
        self.cluster.bind_pending_pods(&PredicateChecker::new());
        summary
    }

    pub fn target(&self, group: &str) -> usize {
        self.provider
            .target_size_of(&NodeGroupId::new(group))
            .expect("target")
    }

    pub fn node_count(&self) -> usize {
        use claw_autoscaler::ClusterSource;
        self.cluster.list_nodes().expect("nodes").len()
    }
}

/// A node with 1 core, 1000Mi of memory and room for 110 pods.
pub fn small_node(name: &str) -> Node {
    Node::new(name, Resources::new(1000, 1000 * MIB).with_pods(110))
}

/// A group of small nodes.
pub fn small_group(id: &str, min: usize, max: usize) -> NodeGroupSpec {
    NodeGroupSpec::new(id, min, max, small_node(&format!("{id}-template")))
}

/// Registers `names` as running nodes of `group`.
pub fn add_nodes(provider: &InMemoryCloudProvider, cluster: &InMemoryCluster, group: &str, names: &[&str]) {
    for name in names {
        let node = small_node(name);
        provider
            .add_node(&NodeGroupId::new(group), &node)
            .expect("node");
        cluster.add_node(node);
    }
}

/// A pod of the `app` ReplicaSet.
pub fn replica(app: &str, name: &str, cpu_millis: u64) -> Pod {
    Pod::new("default", name, Resources::new(cpu_millis, 0))
        .with_label("app", app)
        .with_owner(OwnerKind::ReplicaSet, app)
}

pub fn workload(app: &str, replicas: u32) -> Workload {
    Workload {
        kind: OwnerKind::ReplicaSet,
        namespace: "default".into(),
        name: app.into(),
        replicas,
    }
}

pub fn app_pdb(app: &str) -> PodDisruptionBudget {
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), app.to_string());
    PodDisruptionBudget {
        namespace: "default".into(),
        name: app.into(),
        selector,
        disruptions_allowed: 0,
    }
}

/// Options with scale-down grace periods removed.
pub fn eager_scale_down() -> AutoscalingOptions {
    let mut options = AutoscalingOptions::default();
    options.node_group_defaults.scale_down_unneeded_time = std::time::Duration::ZERO;
    options.node_group_defaults.scale_down_empty_unneeded_time = std::time::Duration::ZERO;
    options
}
