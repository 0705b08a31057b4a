//! Cluster-wide resource ceilings and floors.
//!
//! Resources are keyed the way [`ResourceLimiter`] keys them: `cpu` in whole
//! cores, `memory` in bytes and GPUs by GPU type.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::cloudprovider::{CloudProvider, ResourceLimiter};
use crate::config::AutoscalingOptions;
use crate::error::Result;
use crate::types::{Node, NodeGroupId, NodeInfo, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY};

/// Quantities per limited resource.
pub type ResourceMap = BTreeMap<String, u64>;

/// Resources a single node contributes to the cluster totals.
#[must_use]
pub fn node_resources(node: &Node, gpu_label: &str) -> ResourceMap {
    let capacity = if node.capacity.is_zero() {
        &node.allocatable
    } else {
        &node.capacity
    };
    let mut map = ResourceMap::new();
    map.insert(RESOURCE_CPU.to_string(), capacity.cpu_millis.div_ceil(1000));
    map.insert(RESOURCE_MEMORY.to_string(), capacity.memory_bytes);
    let gpus = capacity.gpus();
    if gpus > 0 {
        let gpu_type = node
            .labels
            .get(gpu_label)
            .cloned()
            .unwrap_or_else(|| RESOURCE_GPU.to_string());
        map.insert(gpu_type, gpus);
    }
    map
}

fn add_into(totals: &mut ResourceMap, delta: &ResourceMap, count: u64) {
    for (name, quantity) in delta {
        let entry = totals.entry(name.clone()).or_default();
        *entry = entry.saturating_add(quantity.saturating_mul(count));
    }
}

/// Remaining room per limited resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcesLeft {
    left: ResourceMap,
}

impl ResourcesLeft {
    /// Room per resource. Resources not listed are unlimited.
    #[must_use]
    pub const fn new(left: ResourceMap) -> Self {
        Self { left }
    }

    /// Room left for a resource, `None` when unlimited.
    #[must_use]
    pub fn get(&self, resource: &str) -> Option<u64> {
        self.left.get(resource).copied()
    }

    /// Resources a single node of shape `delta` would exceed.
    #[must_use]
    pub fn exceeded(&self, delta: &ResourceMap) -> Vec<String> {
        delta
            .iter()
            .filter(|(name, quantity)| **quantity > 0 && self.get(name).is_some_and(|left| left < **quantity))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// How many of `wanted` nodes of shape `delta` fit in the remaining room.
    #[must_use]
    pub fn max_nodes(&self, delta: &ResourceMap, wanted: usize) -> usize {
        delta
            .iter()
            .filter(|(_, quantity)| **quantity > 0)
            .filter_map(|(name, quantity)| {
                let left = self.get(name)?;
                Some(usize::try_from(left / quantity).unwrap_or(usize::MAX))
            })
            .fold(wanted, usize::min)
    }

    /// Takes `count` nodes of shape `delta` out of the remaining room.
    pub fn consume(&mut self, delta: &ResourceMap, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        for (name, quantity) in delta {
            if let Some(left) = self.left.get_mut(name) {
                *left = left.saturating_sub(quantity.saturating_mul(count));
            }
        }
    }
}

/// Computes cluster totals and the room left under the provider's limits.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    limiter: ResourceLimiter,
    gpu_label: String,
}

impl ResourceManager {
    /// Creates a manager from explicit limits.
    #[must_use]
    pub fn new(limiter: ResourceLimiter, gpu_label: impl Into<String>) -> Self {
        Self {
            limiter,
            gpu_label: gpu_label.into(),
        }
    }

    /// Reads the GPU label from the provider. The limits in force are the
    /// tighter of the provider's and the configured ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot report its limits.
    pub fn from_provider(provider: &dyn CloudProvider, options: &AutoscalingOptions) -> Result<Self> {
        let limiter = provider
            .resource_limiter()?
            .intersect(&ResourceLimiter::from_options(options));
        Ok(Self::new(limiter, provider.gpu_label()))
    }

    /// The limits in force.
    #[must_use]
    pub const fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    /// Resources one node of a template contributes.
    #[must_use]
    pub fn delta_for_node(&self, info: &NodeInfo) -> ResourceMap {
        node_resources(&info.node, &self.gpu_label)
    }

    /// Totals as seen by scale-up: every group counted at its target size
    /// using its template, plus nodes that belong to no group.
    ///
    /// # Errors
    ///
    /// Returns an error if a group's target size cannot be read.
    pub fn scale_up_totals(
        &self,
        provider: &dyn CloudProvider,
        templates: &BTreeMap<NodeGroupId, NodeInfo>,
        nodes: &[Node],
    ) -> Result<ResourceMap> {
        let mut totals = ResourceMap::new();
        for group in provider.node_groups() {
            let Some(template) = templates.get(group.id()) else {
                debug!(node_group = %group.id(), "no template, group not counted in totals");
                continue;
            };
            let target = u64::try_from(group.target_size()?).unwrap_or(u64::MAX);
            add_into(&mut totals, &self.delta_for_node(template), target);
        }
        for node in nodes {
            match provider.node_group_for_node(node) {
                Ok(Some(_)) => {}
                Ok(None) => add_into(&mut totals, &node_resources(node, &self.gpu_label), 1),
                Err(e) => warn!(node = %node.name, error = %e, "failed to resolve node group"),
            }
        }
        Ok(totals)
    }

    /// Totals of the registered nodes, as seen by scale-down.
    #[must_use]
    pub fn node_totals<'a>(&self, nodes: impl IntoIterator<Item = &'a Node>) -> ResourceMap {
        let mut totals = ResourceMap::new();
        for node in nodes {
            add_into(&mut totals, &node_resources(node, &self.gpu_label), 1);
        }
        totals
    }

    /// Room between the totals and the maxima.
    #[must_use]
    pub fn left_for_scale_up(&self, totals: &ResourceMap) -> ResourcesLeft {
        let left = self
            .limiter
            .resources()
            .into_iter()
            .filter(|name| self.limiter.max(name) != u64::MAX)
            .map(|name| {
                let total = totals.get(name).copied().unwrap_or(0);
                (name.to_string(), self.limiter.max(name).saturating_sub(total))
            })
            .collect();
        ResourcesLeft::new(left)
    }

    /// Room between the totals and the minima.
    #[must_use]
    pub fn left_for_scale_down(&self, totals: &ResourceMap) -> ResourcesLeft {
        let left = self
            .limiter
            .resources()
            .into_iter()
            .filter(|name| self.limiter.min(name) > 0)
            .map(|name| {
                let total = totals.get(name).copied().unwrap_or(0);
                (name.to_string(), total.saturating_sub(self.limiter.min(name)))
            })
            .collect();
        ResourcesLeft::new(left)
    }
}
