//! JSON description of a simulated cluster.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use claw_autoscaler::cloudprovider::{NodeGroupSpec, ResourceLimiter};
use claw_autoscaler::types::{PodDisruptionBudget, Taint, Workload};
use claw_autoscaler::{InMemoryCloudProvider, InMemoryCluster, Node, NodeGroupId, Pod, Resources};
use serde::{Deserialize, Serialize};

const fn ready_default() -> bool {
    true
}

/// A registered node and the group it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node name, also used as the instance id.
    pub name: String,
    /// Owning node group.
    pub group: String,
    /// Capacity available to pods.
    pub allocatable: Resources,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Taints.
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Ready condition.
    #[serde(default = "ready_default")]
    pub ready: bool,
}

impl ClusterNode {
    fn to_node(&self) -> Node {
        let mut node = Node::new(self.name.clone(), self.allocatable.clone());
        node.labels.extend(self.labels.clone());
        node.taints.clone_from(&self.taints);
        node.ready = self.ready;
        node
    }
}

/// Everything the simulator starts from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterDescription {
    /// Node groups offered by the provider.
    pub node_groups: Vec<NodeGroupSpec>,
    /// Registered nodes.
    pub nodes: Vec<ClusterNode>,
    /// Pods. Pods without `node_name` start pending.
    pub pods: Vec<Pod>,
    /// Disruption budgets, keyed by their minimum available healthy pods.
    pub pdbs: Vec<MinAvailableBudget>,
    /// Workload controllers.
    pub workloads: Vec<Workload>,
    /// Cluster-wide resource limits enforced by the provider.
    pub limits: Option<ResourceLimiter>,
}

/// A budget that keeps `min_available` matching pods running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinAvailableBudget {
    /// The budget.
    #[serde(flatten)]
    pub pdb: PodDisruptionBudget,
    /// Healthy pods that must stay up.
    pub min_available: u32,
}

impl ClusterDescription {
    /// Reads a description from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read cluster description {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid cluster description {}", path.display()))
    }

    /// Parses a description.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Builds the in-memory provider and cluster.
    pub fn build(&self) -> Result<(InMemoryCloudProvider, InMemoryCluster)> {
        let mut provider = InMemoryCloudProvider::new();
        if let Some(limits) = &self.limits {
            provider = provider.with_resource_limiter(limits.clone());
        }
        for spec in &self.node_groups {
            provider
                .add_node_group(spec.clone())
                .with_context(|| format!("cannot add node group {}", spec.id))?;
        }

        let cluster = InMemoryCluster::new();
        for entry in &self.nodes {
            let node = entry.to_node();
            provider
                .add_node(&NodeGroupId::new(entry.group.clone()), &node)
                .with_context(|| format!("cannot register node {}", entry.name))?;
            cluster.add_node(node);
        }
        for pod in &self.pods {
            let pod = match &pod.node_name {
                Some(node) => pod.clone().on_node(node.clone()),
                None => pod.clone().unschedulable(),
            };
            cluster.add_pod(pod);
        }
        for budget in &self.pdbs {
            cluster.add_pdb_min_available(budget.pdb.clone(), budget.min_available);
        }
        for workload in &self.workloads {
            cluster.add_workload(workload.clone());
        }
        Ok((provider, cluster))
    }
}
