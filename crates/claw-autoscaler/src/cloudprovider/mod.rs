//! Cloud provider contract.
//!
//! The autoscaler sees the infrastructure only through [`CloudProvider`] and
//! [`NodeGroup`]. Node group handles carry an id and consult the provider for
//! every piece of state, so the provider stays the single owner of sizes and
//! instances. Mutations are synchronous from the core's point of view; a
//! provider that resizes asynchronously must coalesce internally.

mod in_memory;

pub use in_memory::{CloudCall, FailureOp, InMemoryCloudProvider, NodeGroupSpec, StaticPricingModel};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AutoscalingOptions, NodeGroupAutoscalingOptions};
use crate::error::Result;
use crate::types::{Node, NodeGroupId, NodeInfo, Pod, RESOURCE_CPU, RESOURCE_MEMORY};

/// State of a cloud instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Being created.
    Creating,
    /// Running.
    Running,
    /// Being deleted.
    Deleting,
    /// Creation failed.
    Errored {
        /// Provider error class, e.g. `OutOfResource`.
        class: String,
        /// Provider error message.
        message: String,
    },
}

/// A cloud instance belonging to a node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider ID; equals the `provider_id` of the node once registered.
    pub id: String,
    /// Instance state.
    pub state: InstanceState,
}

/// Optional node group features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeGroupCapabilities {
    /// The group can scale from zero using its template.
    pub scale_from_zero: bool,
    /// The group was created by the autoscaler.
    pub autoprovisioned: bool,
    /// Resizes are all-or-nothing.
    pub atomic_resize: bool,
}

/// An elastic set of identically templated nodes.
pub trait NodeGroup: Send + Sync + fmt::Debug {
    /// Group identity.
    fn id(&self) -> &NodeGroupId;

    /// Minimum size.
    fn min_size(&self) -> usize;

    /// Maximum size.
    fn max_size(&self) -> usize;

    /// Current target size as reported by the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot report the size.
    fn target_size(&self) -> Result<usize>;

    /// Raises the target size.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails or would exceed the maximum.
    fn increase_size(&self, delta: usize) -> Result<()>;

    /// Lowers the target size without deleting registered nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the decrease would remove registered nodes.
    fn decrease_target_size(&self, delta: usize) -> Result<()>;

    /// Deletes nodes and lowers the target size accordingly.
    ///
    /// # Errors
    ///
    /// Returns an error if a node does not belong to the group or the group
    /// would drop below its minimum.
    fn delete_nodes(&self, nodes: &[Node]) -> Result<()>;

    /// Lists the group's instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot list instances.
    fn nodes(&self) -> Result<Vec<Instance>>;

    /// Returns a node info describing a new node of this group.
    ///
    /// # Errors
    ///
    /// Returns an error if no template is available.
    fn template_node_info(&self) -> Result<NodeInfo>;

    /// Returns true if the group exists in the provider.
    fn exist(&self) -> bool;

    /// Returns true if the autoscaler created the group.
    fn autoprovisioned(&self) -> bool {
        self.capabilities().autoprovisioned
    }

    /// Group features.
    fn capabilities(&self) -> NodeGroupCapabilities;

    /// Per-group overrides of the scale-down options, if any.
    fn options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> Option<NodeGroupAutoscalingOptions> {
        None
    }
}

/// Prices nodes and pods over a time window.
pub trait PricingModel: Send + Sync + fmt::Debug {
    /// Price of running `node` between `start` and `end`.
    ///
    /// # Errors
    ///
    /// Returns an error if no price is known for the node.
    fn node_price(&self, node: &Node, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64>;

    /// Price of running `pod` between `start` and `end`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod cannot be priced.
    fn pod_price(&self, pod: &Pod, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64>;
}

/// Cluster-wide minimum and maximum per resource.
///
/// CPU limits are expressed in cores and memory in bytes; other names are
/// extended resources such as GPU types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimiter {
    min: BTreeMap<String, u64>,
    max: BTreeMap<String, u64>,
}

impl ResourceLimiter {
    /// Creates a limiter from explicit maps.
    #[must_use]
    pub const fn new(min: BTreeMap<String, u64>, max: BTreeMap<String, u64>) -> Self {
        Self { min, max }
    }

    /// Builds a limiter from the configured cluster limits.
    #[must_use]
    pub fn from_options(options: &AutoscalingOptions) -> Self {
        let limits = &options.limits;
        let mut min = BTreeMap::new();
        let mut max = BTreeMap::new();
        min.insert(RESOURCE_CPU.to_string(), limits.min_cores_total);
        max.insert(RESOURCE_CPU.to_string(), limits.max_cores_total);
        min.insert(RESOURCE_MEMORY.to_string(), limits.min_memory_total);
        max.insert(RESOURCE_MEMORY.to_string(), limits.max_memory_total);
        for gpu in &limits.gpu_total {
            min.insert(gpu.gpu_type.clone(), gpu.min);
            max.insert(gpu.gpu_type.clone(), gpu.max);
        }
        Self { min, max }
    }

    /// Keeps the tighter bound of both limiters for every resource.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut min = self.min.clone();
        for (resource, value) in &other.min {
            let entry = min.entry(resource.clone()).or_insert(0);
            *entry = (*entry).max(*value);
        }
        let mut max = self.max.clone();
        for (resource, value) in &other.max {
            let entry = max.entry(resource.clone()).or_insert(u64::MAX);
            *entry = (*entry).min(*value);
        }
        Self { min, max }
    }

    /// Minimum for a resource; zero when unset.
    #[must_use]
    pub fn min(&self, resource: &str) -> u64 {
        self.min.get(resource).copied().unwrap_or(0)
    }

    /// Maximum for a resource; unbounded when unset.
    #[must_use]
    pub fn max(&self, resource: &str) -> u64 {
        self.max.get(resource).copied().unwrap_or(u64::MAX)
    }

    /// Names of all limited resources.
    #[must_use]
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .min
            .keys()
            .chain(self.max.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Sets a maximum.
    #[must_use]
    pub fn with_max(mut self, resource: impl Into<String>, max: u64) -> Self {
        self.max.insert(resource.into(), max);
        self
    }

    /// Sets a minimum.
    #[must_use]
    pub fn with_min(mut self, resource: impl Into<String>, min: u64) -> Self {
        self.min.insert(resource.into(), min);
        self
    }
}

/// A provider of node groups.
pub trait CloudProvider: Send + Sync + fmt::Debug {
    /// Provider name.
    fn name(&self) -> &str;

    /// Every node group the autoscaler manages.
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;

    /// The group owning a node, if the node is autoscaled.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot answer.
    fn node_group_for_node(&self, node: &Node) -> Result<Option<Arc<dyn NodeGroup>>>;

    /// Pricing model, if the provider has one.
    fn pricing(&self) -> Option<Arc<dyn PricingModel>> {
        None
    }

    /// Node label carrying the GPU type.
    fn gpu_label(&self) -> &str;

    /// Cluster-wide resource limits.
    ///
    /// # Errors
    ///
    /// Returns an error if limits cannot be determined.
    fn resource_limiter(&self) -> Result<ResourceLimiter>;

    /// Refreshes cached provider state. Called at the start of every iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    fn refresh(&self) -> Result<()>;

    /// Releases provider resources on shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails.
    fn cleanup(&self) -> Result<()>;
}

/// Looks up a node group by id.
#[must_use]
pub fn find_node_group(provider: &dyn CloudProvider, id: &NodeGroupId) -> Option<Arc<dyn NodeGroup>> {
    provider.node_groups().into_iter().find(|g| g.id() == id)
}
