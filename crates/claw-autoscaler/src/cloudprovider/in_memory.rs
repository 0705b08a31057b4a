//! In-memory cloud provider.
//!
//! Used by tests and the simulator. Node groups are handles over shared
//! provider state; resizes create `Creating` instances that
//! [`InMemoryCloudProvider::provision_pending`] later turns into nodes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    CloudProvider, Instance, InstanceState, NodeGroup, NodeGroupCapabilities, PricingModel,
    ResourceLimiter,
};
use crate::config::NodeGroupAutoscalingOptions;
use crate::error::{AutoscalerError, Result};
use crate::types::{Node, NodeGroupId, NodeInfo, Pod, Resources, GIB, RESOURCE_GPU};

/// Provider operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOp {
    /// `increase_size`.
    IncreaseSize,
    /// `decrease_target_size`.
    DecreaseTargetSize,
    /// `delete_nodes`.
    DeleteNodes,
    /// `refresh`.
    Refresh,
}

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudCall {
    /// Target raised.
    IncreaseSize {
        /// Group.
        group: NodeGroupId,
        /// Delta.
        delta: usize,
    },
    /// Target lowered without deleting nodes.
    DecreaseTargetSize {
        /// Group.
        group: NodeGroupId,
        /// Delta.
        delta: usize,
    },
    /// Nodes deleted.
    DeleteNodes {
        /// Group.
        group: NodeGroupId,
        /// Node names.
        nodes: Vec<String>,
    },
}

/// Declarative description of a node group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupSpec {
    /// Group id.
    pub id: NodeGroupId,
    /// Minimum size.
    pub min_size: usize,
    /// Maximum size.
    pub max_size: usize,
    /// Initial target size.
    #[serde(default)]
    pub target_size: usize,
    /// Template for new nodes. Its name is replaced per instance.
    pub template: Option<Node>,
    /// Pods every new node starts with, such as DaemonSet pods.
    #[serde(default)]
    pub template_pods: Vec<Pod>,
    /// Features.
    #[serde(default)]
    pub capabilities: NodeGroupCapabilities,
    /// Per-group option overrides.
    #[serde(default)]
    pub options: Option<NodeGroupAutoscalingOptions>,
}

impl NodeGroupSpec {
    /// Creates a group description with a template node.
    #[must_use]
    pub fn new(id: impl Into<String>, min_size: usize, max_size: usize, template: Node) -> Self {
        Self {
            id: NodeGroupId::new(id),
            min_size,
            max_size,
            target_size: 0,
            template: Some(template),
            template_pods: Vec::new(),
            capabilities: NodeGroupCapabilities {
                scale_from_zero: true,
                ..NodeGroupCapabilities::default()
            },
            options: None,
        }
    }

    /// Sets the initial target size.
    #[must_use]
    pub const fn with_target(mut self, target: usize) -> Self {
        self.target_size = target;
        self
    }

    /// Adds a pod to the template.
    #[must_use]
    pub fn with_template_pod(mut self, pod: Pod) -> Self {
        self.template_pods.push(pod);
        self
    }

    /// Marks the group as atomic.
    #[must_use]
    pub const fn atomic(mut self) -> Self {
        self.capabilities.atomic_resize = true;
        self
    }

    /// Sets per-group option overrides.
    #[must_use]
    pub fn with_options(mut self, options: NodeGroupAutoscalingOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug)]
struct GroupState {
    spec: NodeGroupSpec,
    target: usize,
    instances: Vec<Instance>,
}

#[derive(Debug, Default)]
struct ProviderState {
    groups: BTreeMap<NodeGroupId, GroupState>,
    failures: HashMap<(NodeGroupId, FailureOp), String>,
    calls: Vec<CloudCall>,
    next_instance: u64,
    refreshes: u64,
}

impl ProviderState {
    fn group(&self, id: &NodeGroupId) -> Result<&GroupState> {
        self.groups
            .get(id)
            .ok_or_else(|| AutoscalerError::NodeGroupNotFound { id: id.to_string() })
    }

    fn group_mut(&mut self, id: &NodeGroupId) -> Result<&mut GroupState> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| AutoscalerError::NodeGroupNotFound { id: id.to_string() })
    }

    fn check_failure(&self, id: &NodeGroupId, op: FailureOp) -> Result<()> {
        match self.failures.get(&(id.clone(), op)) {
            Some(message) => Err(AutoscalerError::cloud_provider(message.clone())),
            None => Ok(()),
        }
    }
}

/// A cloud provider keeping every node group in memory.
#[derive(Debug, Clone)]
pub struct InMemoryCloudProvider {
    state: Arc<RwLock<ProviderState>>,
    limiter: Arc<RwLock<ResourceLimiter>>,
    pricing: Option<Arc<dyn PricingModel>>,
    gpu_label: String,
}

impl Default for InMemoryCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloudProvider {
    /// GPU label used by the in-memory provider.
    pub const GPU_LABEL: &'static str = "cloud.clawbernetes.io/gpu-type";

    /// Creates a provider without node groups or limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ProviderState::default())),
            limiter: Arc::new(RwLock::new(ResourceLimiter::default())),
            pricing: None,
            gpu_label: Self::GPU_LABEL.to_string(),
        }
    }

    /// Sets the resource limiter.
    #[must_use]
    pub fn with_resource_limiter(self, limiter: ResourceLimiter) -> Self {
        *self.limiter.write() = limiter;
        self
    }

    /// Sets the pricing model.
    #[must_use]
    pub fn with_pricing(mut self, pricing: Arc<dyn PricingModel>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Replaces the resource limiter.
    pub fn set_resource_limiter(&self, limiter: ResourceLimiter) {
        *self.limiter.write() = limiter;
    }

    /// Registers a node group.
    ///
    /// # Errors
    ///
    /// Returns a config error if the id is taken or the sizes are inconsistent.
    pub fn add_node_group(&self, spec: NodeGroupSpec) -> Result<()> {
        if spec.min_size > spec.max_size {
            return Err(AutoscalerError::config(format!(
                "node group {}: min size {} exceeds max size {}",
                spec.id, spec.min_size, spec.max_size
            )));
        }
        if spec.target_size > spec.max_size {
            return Err(AutoscalerError::config(format!(
                "node group {}: target size {} exceeds max size {}",
                spec.id, spec.target_size, spec.max_size
            )));
        }
        let mut state = self.state.write();
        if state.groups.contains_key(&spec.id) {
            return Err(AutoscalerError::config(format!(
                "node group {} already exists",
                spec.id
            )));
        }
        debug!(node_group = %spec.id, min = spec.min_size, max = spec.max_size, "registered node group");
        state.groups.insert(
            spec.id.clone(),
            GroupState {
                target: spec.target_size,
                spec,
                instances: Vec::new(),
            },
        );
        Ok(())
    }

    /// Records an existing node as a running instance of a group.
    ///
    /// The group's target is raised if needed so that it covers every instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the group does not exist.
    pub fn add_node(&self, group: &NodeGroupId, node: &Node) -> Result<()> {
        let mut state = self.state.write();
        let g = state.group_mut(group)?;
        g.instances.push(Instance {
            id: node.provider_id.clone(),
            state: InstanceState::Running,
        });
        g.target = g.target.max(g.instances.len());
        Ok(())
    }

    /// Makes an operation on a group fail until cleared.
    pub fn set_failure(&self, group: &NodeGroupId, op: FailureOp, message: impl Into<String>) {
        self.state
            .write()
            .failures
            .insert((group.clone(), op), message.into());
    }

    /// Clears an injected failure.
    pub fn clear_failure(&self, group: &NodeGroupId, op: FailureOp) {
        self.state.write().failures.remove(&(group.clone(), op));
    }

    /// Marks a creating instance as errored.
    ///
    /// # Errors
    ///
    /// Returns an error if the group or instance does not exist.
    pub fn mark_errored(
        &self,
        group: &NodeGroupId,
        instance_id: &str,
        class: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let g = state.group_mut(group)?;
        let instance = g
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| AutoscalerError::NodeNotFound {
                name: instance_id.to_string(),
            })?;
        instance.state = InstanceState::Errored {
            class: class.into(),
            message: message.into(),
        };
        Ok(())
    }

    /// Turns every `Creating` instance into a running node.
    ///
    /// Returns the new nodes together with the template pods they start with.
    pub fn provision_pending(&self, now: DateTime<Utc>) -> Vec<(Node, Vec<Pod>)> {
        let mut state = self.state.write();
        let mut provisioned = Vec::new();
        for g in state.groups.values_mut() {
            let Some(template) = g.spec.template.clone() else {
                continue;
            };
            for instance in &mut g.instances {
                if instance.state != InstanceState::Creating {
                    continue;
                }
                instance.state = InstanceState::Running;
                let node = instantiate(&template, &instance.id, now);
                let pods = g
                    .spec
                    .template_pods
                    .iter()
                    .map(|p| {
                        let mut pod = p.clone();
                        pod.name = format!("{}-{}", p.name, instance.id);
                        pod.on_node(instance.id.clone())
                    })
                    .collect();
                info!(node_group = %g.spec.id, node = %instance.id, "instance provisioned");
                provisioned.push((node, pods));
            }
        }
        provisioned
    }

    /// Returns the target size of a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group does not exist.
    pub fn target_size_of(&self, group: &NodeGroupId) -> Result<usize> {
        Ok(self.state.read().group(group)?.target)
    }

    /// Returns the mutating calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        self.state.read().calls.clone()
    }

    /// Number of `refresh` calls.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.state.read().refreshes
    }

    fn handle(&self, id: NodeGroupId) -> Arc<dyn NodeGroup> {
        Arc::new(InMemoryNodeGroup {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

fn instantiate(template: &Node, name: &str, now: DateTime<Utc>) -> Node {
    let mut node = template.clone();
    node.name = name.to_string();
    node.provider_id = name.to_string();
    node.labels
        .insert(crate::types::LABEL_HOSTNAME.to_string(), name.to_string());
    node.with_created_at(now)
}

impl CloudProvider for InMemoryCloudProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        let ids: Vec<NodeGroupId> = self.state.read().groups.keys().cloned().collect();
        ids.into_iter().map(|id| self.handle(id)).collect()
    }

    fn node_group_for_node(&self, node: &Node) -> Result<Option<Arc<dyn NodeGroup>>> {
        let owner = self
            .state
            .read()
            .groups
            .iter()
            .find(|(_, g)| g.instances.iter().any(|i| i.id == node.provider_id))
            .map(|(id, _)| id.clone());
        Ok(owner.map(|id| self.handle(id)))
    }

    fn pricing(&self) -> Option<Arc<dyn PricingModel>> {
        self.pricing.clone()
    }

    fn gpu_label(&self) -> &str {
        &self.gpu_label
    }

    fn resource_limiter(&self) -> Result<ResourceLimiter> {
        Ok(self.limiter.read().clone())
    }

    fn refresh(&self) -> Result<()> {
        let mut state = self.state.write();
        let failure = state
            .failures
            .iter()
            .find(|((_, op), _)| *op == FailureOp::Refresh)
            .map(|(_, message)| message.clone());
        if let Some(message) = failure {
            return Err(AutoscalerError::transient(message));
        }
        state.refreshes += 1;
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        debug!("in-memory cloud provider cleaned up");
        Ok(())
    }
}

/// Handle to a group of an [`InMemoryCloudProvider`].
struct InMemoryNodeGroup {
    id: NodeGroupId,
    state: Arc<RwLock<ProviderState>>,
}

impl fmt::Debug for InMemoryNodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNodeGroup")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl NodeGroup for InMemoryNodeGroup {
    fn id(&self) -> &NodeGroupId {
        &self.id
    }

    fn min_size(&self) -> usize {
        self.state
            .read()
            .groups
            .get(&self.id)
            .map_or(0, |g| g.spec.min_size)
    }

    fn max_size(&self) -> usize {
        self.state
            .read()
            .groups
            .get(&self.id)
            .map_or(0, |g| g.spec.max_size)
    }

    fn target_size(&self) -> Result<usize> {
        Ok(self.state.read().group(&self.id)?.target)
    }

    fn increase_size(&self, delta: usize) -> Result<()> {
        if delta == 0 {
            return Err(AutoscalerError::cloud_provider("size increase must be positive"));
        }
        let mut state = self.state.write();
        state.check_failure(&self.id, FailureOp::IncreaseSize)?;
        let first = state.next_instance;
        state.next_instance += delta as u64;
        let g = state.group_mut(&self.id)?;
        let new_target = g.target + delta;
        if new_target > g.spec.max_size {
            return Err(AutoscalerError::cloud_provider(format!(
                "size increase too large: desired {new_target}, max {}",
                g.spec.max_size
            )));
        }
        g.target = new_target;
        for n in 0..delta as u64 {
            g.instances.push(Instance {
                id: format!("{}-{}", self.id, first + n),
                state: InstanceState::Creating,
            });
        }
        state.calls.push(CloudCall::IncreaseSize {
            group: self.id.clone(),
            delta,
        });
        Ok(())
    }

    fn decrease_target_size(&self, delta: usize) -> Result<()> {
        let mut state = self.state.write();
        state.check_failure(&self.id, FailureOp::DecreaseTargetSize)?;
        let g = state.group_mut(&self.id)?;
        let unregistered = g
            .instances
            .iter()
            .filter(|i| !matches!(i.state, InstanceState::Running))
            .count();
        let registered = g.instances.len() - unregistered;
        if delta > g.target.saturating_sub(registered) {
            return Err(AutoscalerError::cloud_provider(format!(
                "attempt to delete existing nodes: target {}, registered {registered}, delta {delta}",
                g.target
            )));
        }
        g.target -= delta;
        let mut remaining = delta;
        g.instances.retain(|i| {
            if remaining > 0 && !matches!(i.state, InstanceState::Running) {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        state.calls.push(CloudCall::DecreaseTargetSize {
            group: self.id.clone(),
            delta,
        });
        Ok(())
    }

    fn delete_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut state = self.state.write();
        state.check_failure(&self.id, FailureOp::DeleteNodes)?;
        let g = state.group_mut(&self.id)?;
        for node in nodes {
            if !g.instances.iter().any(|i| i.id == node.provider_id) {
                return Err(AutoscalerError::cloud_provider(format!(
                    "node {} does not belong to node group {}",
                    node.name, self.id
                )));
            }
        }
        if g.target.saturating_sub(nodes.len()) < g.spec.min_size {
            return Err(AutoscalerError::cloud_provider(format!(
                "deleting {} nodes would take node group {} below its minimum size",
                nodes.len(),
                self.id
            )));
        }
        g.instances
            .retain(|i| !nodes.iter().any(|n| n.provider_id == i.id));
        g.target -= nodes.len();
        state.calls.push(CloudCall::DeleteNodes {
            group: self.id.clone(),
            nodes: nodes.iter().map(|n| n.name.clone()).collect(),
        });
        Ok(())
    }

    fn nodes(&self) -> Result<Vec<Instance>> {
        Ok(self.state.read().group(&self.id)?.instances.clone())
    }

    fn template_node_info(&self) -> Result<NodeInfo> {
        let state = self.state.read();
        let g = state.group(&self.id)?;
        let template = g.spec.template.as_ref().ok_or_else(|| {
            AutoscalerError::cloud_provider(format!("node group {} has no template", self.id))
        })?;
        let name = format!("template-node-for-{}", self.id);
        let node = instantiate(template, &name, template.created_at);
        let pods = g.spec.template_pods.iter().map(|p| {
            let mut pod = p.clone();
            pod.name = format!("{}-{name}", p.name);
            pod
        });
        Ok(NodeInfo::with_pods(node, pods))
    }

    fn exist(&self) -> bool {
        self.state.read().groups.contains_key(&self.id)
    }

    fn capabilities(&self) -> NodeGroupCapabilities {
        self.state
            .read()
            .groups
            .get(&self.id)
            .map(|g| g.spec.capabilities)
            .unwrap_or_default()
    }

    fn options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> Option<NodeGroupAutoscalingOptions> {
        self.state
            .read()
            .groups
            .get(&self.id)
            .and_then(|g| g.spec.options.clone())
    }
}

/// Linear pricing: a price per core-hour, per GiB-hour and per GPU-hour.
///
/// Instance types listed in `instance_prices` use a flat hourly price instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPricingModel {
    /// Price of one core for one hour.
    pub cpu_hour: f64,
    /// Price of one GiB of memory for one hour.
    pub gib_hour: f64,
    /// Price of one GPU for one hour.
    pub gpu_hour: f64,
    /// Flat hourly price per instance type label value.
    #[serde(default)]
    pub instance_prices: BTreeMap<String, f64>,
}

impl Default for StaticPricingModel {
    fn default() -> Self {
        Self {
            cpu_hour: 0.033,
            gib_hour: 0.0045,
            gpu_hour: 0.7,
            instance_prices: BTreeMap::new(),
        }
    }
}

impl StaticPricingModel {
    #[allow(clippy::cast_precision_loss)]
    fn hourly(&self, resources: &Resources) -> f64 {
        resources.cpu_millis as f64 / 1000.0 * self.cpu_hour
            + resources.memory_bytes as f64 / GIB as f64 * self.gib_hour
            + resources.get(RESOURCE_GPU) as f64 * self.gpu_hour
    }
}

#[allow(clippy::cast_precision_loss)]
fn hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds().max(0) as f64 / 3600.0
}

impl PricingModel for StaticPricingModel {
    fn node_price(&self, node: &Node, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64> {
        let hourly = node
            .labels
            .get(crate::types::LABEL_INSTANCE_TYPE)
            .and_then(|t| self.instance_prices.get(t))
            .copied()
            .unwrap_or_else(|| self.hourly(&node.capacity));
        Ok(hourly * hours(start, end))
    }

    fn pod_price(&self, pod: &Pod, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64> {
        Ok(self.hourly(&pod.requests) * hours(start, end))
    }
}
