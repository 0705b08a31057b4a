//! Drives the autoscaler against the in-memory provider and cluster.
//!
//! Time is simulated: each iteration advances the clock by the scan
//! interval. Between iterations, instances the provider created register as
//! ready nodes and pending pods are bound to nodes they fit.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use claw_autoscaler::scheduler::PredicateChecker;
use claw_autoscaler::status::ClusterAutoscalerStatus;
use claw_autoscaler::{
    Autoscaler, AutoscalerMetrics, AutoscalingOptions, ClusterSource, InMemoryCloudProvider,
    InMemoryCluster, LogEventRecorder, ScaleDownResult, ScaleUpResult,
};
use serde::Serialize;
use tracing::info;

use crate::cluster::ClusterDescription;

/// What one simulated iteration did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// Iteration number, starting at 1.
    pub iteration: u32,
    /// Simulated time.
    pub time: DateTime<Utc>,
    /// Scale-up result.
    pub scale_up: ScaleUpResult,
    /// Scale-down result.
    pub scale_down: ScaleDownResult,
    /// Registered nodes after the world caught up.
    pub nodes: usize,
    /// Pods still pending.
    pub pending_pods: usize,
    /// Pods bound in this iteration.
    pub bound_pods: usize,
}

/// A simulated cluster with an autoscaler attached.
#[derive(Debug)]
pub struct Simulation {
    provider: Arc<InMemoryCloudProvider>,
    cluster: Arc<InMemoryCluster>,
    autoscaler: Autoscaler<InMemoryCluster>,
    metrics: AutoscalerMetrics,
    scan_interval: Duration,
    now: DateTime<Utc>,
    iteration: u32,
}

impl Simulation {
    /// Builds the simulation starting at `start`.
    pub fn new(
        options: AutoscalingOptions,
        description: &ClusterDescription,
        start: DateTime<Utc>,
    ) -> Result<Self> {
        let (provider, cluster) = description.build()?;
        let provider = Arc::new(provider);
        let cluster = Arc::new(cluster);
        let metrics = AutoscalerMetrics::new();
        let scan_interval =
            Duration::from_std(options.scan_interval).context("scan interval out of range")?;
        let autoscaler = Autoscaler::new(
            options,
            provider.clone(),
            cluster.clone(),
            cluster.clone(),
            Arc::new(LogEventRecorder),
            metrics.clone(),
        )
        .context("cannot create autoscaler")?;
        Ok(Self {
            provider,
            cluster,
            autoscaler,
            metrics,
            scan_interval,
            now: start,
            iteration: 0,
        })
    }

    /// Runs one iteration and lets the cluster catch up.
    pub async fn step(&mut self) -> Result<IterationReport> {
        self.iteration += 1;
        let summary = self
            .autoscaler
            .run_once(self.now)
            .await
            .with_context(|| format!("iteration {} failed", self.iteration))?;
        self.cluster
            .reconcile_with_provider(&self.provider, self.now)
            .context("cannot reconcile cluster with provider")?;
        let bound = self.cluster.bind_pending_pods(&PredicateChecker::new());

        let report = IterationReport {
            iteration: self.iteration,
            time: self.now,
            scale_up: summary.scale_up.result,
            scale_down: summary.scale_down.result,
            nodes: self.cluster.list_nodes()?.len(),
            pending_pods: self.cluster.pending_pods().len(),
            bound_pods: bound.len(),
        };
        info!(
            iteration = report.iteration,
            scale_up = ?report.scale_up,
            scale_down = ?report.scale_down,
            nodes = report.nodes,
            pending = report.pending_pods,
            "iteration finished"
        );
        self.now += self.scan_interval;
        Ok(report)
    }

    /// Runs `iterations` iterations.
    pub async fn run(&mut self, iterations: u32) -> Result<Vec<IterationReport>> {
        let mut reports = Vec::with_capacity(iterations as usize);
        for _ in 0..iterations {
            reports.push(self.step().await?);
        }
        Ok(reports)
    }

    /// Status document of the last iteration.
    pub fn status(&self) -> Option<&ClusterAutoscalerStatus> {
        self.autoscaler.status()
    }

    /// Metrics recorded so far.
    pub const fn metrics(&self) -> &AutoscalerMetrics {
        &self.metrics
    }

    /// Releases provider resources.
    pub fn finish(&self) -> Result<()> {
        self.autoscaler.cleanup()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: &str = r#"{
        "node_groups": [
            {
                "id": "ng1",
                "min_size": 0,
                "max_size": 5,
                "template": { "name": "tpl", "allocatable": { "cpu_millis": 1000, "memory_bytes": 1048576000, "pods": 110 }, "ready": true }
            }
        ],
        "nodes": [
            { "name": "n1", "group": "ng1", "allocatable": { "cpu_millis": 1000, "memory_bytes": 1048576000, "pods": 110 } }
        ],
        "pods": [
            { "namespace": "default", "name": "p1", "requests": { "cpu_millis": 600 }, "node_name": "n1",
              "owner": { "kind": "ReplicaSet", "name": "web" } },
            { "namespace": "default", "name": "p2", "requests": { "cpu_millis": 600 },
              "owner": { "kind": "ReplicaSet", "name": "web" } }
        ],
        "workloads": [
            { "kind": "ReplicaSet", "namespace": "default", "name": "web", "replicas": 2 }
        ]
    }"#;

    #[tokio::test]
    async fn pending_pod_gets_a_new_node() {
        let description = ClusterDescription::from_json(CLUSTER).expect("parse");
        let mut sim =
            Simulation::new(AutoscalingOptions::default(), &description, Utc::now()).expect("sim");

        let reports = sim.run(2).await.expect("run");
        assert_eq!(reports[0].scale_up, ScaleUpResult::Successful);
        assert_eq!(reports[0].nodes, 2);
        assert_eq!(reports[0].bound_pods, 1);
        assert_eq!(reports[0].pending_pods, 0);
        assert_eq!(reports[1].scale_up, ScaleUpResult::NotNeeded);
        assert_eq!(reports[1].time - reports[0].time, Duration::seconds(10));
        assert_eq!(sim.metrics().scaled_up_nodes(), 1);
        assert!(sim.status().is_some());
        sim.finish().expect("cleanup");
    }
}
