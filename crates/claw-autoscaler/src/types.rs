//! Core types for the autoscaler.
//!
//! This module provides the cluster objects the decision engine reasons about:
//! - [`Resources`]: A resource vector (CPU, memory, storage, pod slots, extended)
//! - [`Node`] and [`Pod`]: The read-only view of cluster objects
//! - [`NodeInfo`]: A node plus the pods placed on it
//! - [`PodDisruptionBudget`] and [`Workload`]: Inputs to drainability checks
//! - [`NodeGroupId`]: Identity of an elastic node group

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Resource name for CPU.
pub const RESOURCE_CPU: &str = "cpu";
/// Resource name for memory.
pub const RESOURCE_MEMORY: &str = "memory";
/// Resource name for ephemeral storage.
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// Resource name for pod slots.
pub const RESOURCE_PODS: &str = "pods";
/// Default extended resource name for GPUs.
pub const RESOURCE_GPU: &str = "nvidia.com/gpu";

/// Well-known hostname label.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
/// Well-known zone label.
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// Well-known region label.
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";
/// Well-known instance type label.
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Annotation carried by mirror (static) pods.
pub const ANNOTATION_MIRROR_POD: &str = "kubernetes.io/config.mirror";

/// Namespace of cluster system components.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;
/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Unique identifier for a node group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeGroupId(String);

impl NodeGroupId {
    /// Creates a new node group ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeGroupId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A resource vector.
///
/// CPU is tracked in millicores, memory and storage in bytes, pods as a slot
/// count. Extended resources (GPUs and friends) are keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Ephemeral storage in bytes.
    pub ephemeral_storage_bytes: u64,
    /// Pod slots.
    pub pods: u64,
    /// Extended resources by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, u64>,
}

impl Resources {
    /// Creates a resource vector with CPU and memory set.
    #[must_use]
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            ..Self::default()
        }
    }

    /// Sets the pod slot count.
    #[must_use]
    pub const fn with_pods(mut self, pods: u64) -> Self {
        self.pods = pods;
        self
    }

    /// Sets ephemeral storage.
    #[must_use]
    pub const fn with_ephemeral_storage(mut self, bytes: u64) -> Self {
        self.ephemeral_storage_bytes = bytes;
        self
    }

    /// Sets an extended resource quantity.
    #[must_use]
    pub fn with_extended(mut self, name: impl Into<String>, quantity: u64) -> Self {
        self.extended.insert(name.into(), quantity);
        self
    }

    /// Sets the GPU count using the default GPU resource name.
    #[must_use]
    pub fn with_gpus(self, count: u64) -> Self {
        self.with_extended(RESOURCE_GPU, count)
    }

    /// Returns the GPU count.
    #[must_use]
    pub fn gpus(&self) -> u64 {
        self.get(RESOURCE_GPU)
    }

    /// Returns the quantity of a named resource.
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        match name {
            RESOURCE_CPU => self.cpu_millis,
            RESOURCE_MEMORY => self.memory_bytes,
            RESOURCE_EPHEMERAL_STORAGE => self.ephemeral_storage_bytes,
            RESOURCE_PODS => self.pods,
            other => self.extended.get(other).copied().unwrap_or(0),
        }
    }

    /// Returns true if every quantity is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0
            && self.memory_bytes == 0
            && self.ephemeral_storage_bytes == 0
            && self.pods == 0
            && self.extended.values().all(|q| *q == 0)
    }

    /// Subtracts `other`, flooring every quantity at zero.
    #[must_use]
    pub fn saturating_sub(&self, other: &Self) -> Self {
        let mut extended = self.extended.clone();
        for (name, quantity) in &other.extended {
            let entry = extended.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_sub(*quantity);
        }
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            ephemeral_storage_bytes: self
                .ephemeral_storage_bytes
                .saturating_sub(other.ephemeral_storage_bytes),
            pods: self.pods.saturating_sub(other.pods),
            extended,
        }
    }

    /// Returns the first resource for which `requested` exceeds `self`.
    ///
    /// Pod slots are not compared here.
    #[must_use]
    pub fn first_insufficient(&self, requested: &Self) -> Option<InsufficientResource> {
        let scalar = [
            (RESOURCE_CPU, self.cpu_millis, requested.cpu_millis),
            (RESOURCE_MEMORY, self.memory_bytes, requested.memory_bytes),
            (
                RESOURCE_EPHEMERAL_STORAGE,
                self.ephemeral_storage_bytes,
                requested.ephemeral_storage_bytes,
            ),
        ];
        for (name, available, wanted) in scalar {
            if wanted > available {
                return Some(InsufficientResource {
                    resource: name.to_string(),
                    requested: wanted,
                    available,
                });
            }
        }
        for (name, wanted) in &requested.extended {
            let available = self.extended.get(name).copied().unwrap_or(0);
            if *wanted > available {
                return Some(InsufficientResource {
                    resource: name.clone(),
                    requested: *wanted,
                    available,
                });
            }
        }
        None
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, other: &Resources) {
        self.cpu_millis = self.cpu_millis.saturating_add(other.cpu_millis);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        self.ephemeral_storage_bytes = self
            .ephemeral_storage_bytes
            .saturating_add(other.ephemeral_storage_bytes);
        self.pods = self.pods.saturating_add(other.pods);
        for (name, quantity) in &other.extended {
            let entry = self.extended.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_add(*quantity);
        }
    }
}

/// A resource that could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsufficientResource {
    /// Resource name.
    pub resource: String,
    /// Requested quantity.
    pub requested: u64,
    /// Available quantity.
    pub available: u64,
}

/// Taint effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled.
    NoSchedule,
    /// The scheduler avoids the node when possible.
    PreferNoSchedule,
    /// Running pods are evicted.
    NoExecute,
}

/// A node taint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value.
    #[serde(default)]
    pub value: String,
    /// Taint effect.
    pub effect: TaintEffect,
}

impl Taint {
    /// Creates a new taint.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

/// Toleration operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key and value must match.
    #[default]
    Equal,
    /// Key must match; value is ignored.
    Exists,
}

/// A pod toleration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Toleration {
    /// Taint key to tolerate. `None` with `Exists` tolerates everything.
    pub key: Option<String>,
    /// Match operator.
    pub operator: TolerationOperator,
    /// Value to match with `Equal`.
    pub value: String,
    /// Effect to match. `None` matches every effect.
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Tolerates any taint with the given key.
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            ..Self::default()
        }
    }

    /// Tolerates a taint with the given key, value and effect.
    #[must_use]
    pub fn equal(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Equal,
            value: value.into(),
            effect: Some(effect),
        }
    }

    /// Returns true if this toleration matches the taint.
    #[must_use]
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(key), TolerationOperator::Exists) => *key == taint.key,
            (Some(key), TolerationOperator::Equal) => {
                *key == taint.key && self.value == taint.value
            }
        }
    }
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    /// Node name.
    pub name: String,
    /// Cloud provider instance ID.
    pub provider_id: String,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
    /// Node annotations.
    pub annotations: BTreeMap<String, String>,
    /// Node taints.
    pub taints: Vec<Taint>,
    /// Total capacity.
    pub capacity: Resources,
    /// Capacity available to pods.
    pub allocatable: Resources,
    /// Ready condition.
    pub ready: bool,
    /// Cordoned.
    pub unschedulable: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last ready condition transition.
    pub ready_transition_at: DateTime<Utc>,
}

impl Node {
    /// Creates a ready node whose capacity equals `allocatable`.
    #[must_use]
    pub fn new(name: impl Into<String>, allocatable: Resources) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_HOSTNAME.to_string(), name.clone());
        Self {
            provider_id: name.clone(),
            name,
            labels,
            capacity: allocatable.clone(),
            allocatable,
            ready: true,
            ..Self::default()
        }
    }

    /// Sets a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Adds a taint.
    #[must_use]
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    /// Sets the provider ID.
    #[must_use]
    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    /// Overrides the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Resources) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the creation time. The ready transition moves with it.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.ready_transition_at = created_at;
        self
    }

    /// Marks the node as not ready since the given time.
    #[must_use]
    pub fn not_ready_since(mut self, since: DateTime<Utc>) -> Self {
        self.ready = false;
        self.ready_transition_at = since;
        self
    }

    /// Marks the node as cordoned.
    #[must_use]
    pub fn cordoned(mut self) -> Self {
        self.unschedulable = true;
        self
    }

    /// Returns true if the node carries a taint with this key.
    #[must_use]
    pub fn has_taint(&self, key: &str) -> bool {
        self.taints.iter().any(|t| t.key == key)
    }

    /// Returns the value of an annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Kind of the controller owning a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    /// ReplicaSet.
    ReplicaSet,
    /// ReplicationController.
    ReplicationController,
    /// StatefulSet.
    StatefulSet,
    /// DaemonSet.
    DaemonSet,
    /// Job.
    Job,
    /// Deployment.
    Deployment,
    /// Any other controller kind.
    Other(String),
}

impl OwnerKind {
    /// Returns true for controllers whose replacement logic is understood.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplicaSet => f.write_str("ReplicaSet"),
            Self::ReplicationController => f.write_str("ReplicationController"),
            Self::StatefulSet => f.write_str("StatefulSet"),
            Self::DaemonSet => f.write_str("DaemonSet"),
            Self::Job => f.write_str("Job"),
            Self::Deployment => f.write_str("Deployment"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// Reference to the controller owning a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Controller kind.
    pub kind: OwnerKind,
    /// Controller name, in the pod's namespace.
    pub name: String,
}

/// Source of a pod volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Node-local scratch space.
    EmptyDir,
    /// Host filesystem path.
    HostPath,
    /// Persistent volume claim.
    PersistentVolumeClaim,
    /// Config map projection.
    ConfigMap,
    /// Secret projection.
    Secret,
}

impl VolumeSource {
    /// Returns true if the volume lives on the node's own disk.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::EmptyDir | Self::HostPath)
    }
}

/// A pod volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Volume source.
    pub source: VolumeSource,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Not yet running.
    #[default]
    Pending,
    /// Running on a node.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// All containers exited, at least one with failure.
    Failed,
}

/// Node selector operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// Label value must be in the list.
    In,
    /// Label value must not be in the list.
    NotIn,
    /// Label must exist.
    Exists,
    /// Label must not exist.
    DoesNotExist,
}

/// A required node affinity term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: SelectorOperator,
    /// Values for `In` / `NotIn`.
    #[serde(default)]
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    /// Returns true if the labels satisfy this requirement.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// A pod as seen by the autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Total resource requests of all containers.
    pub requests: Resources,
    /// Required node labels.
    pub node_selector: BTreeMap<String, String>,
    /// Required node affinity terms, all of which must hold.
    pub node_affinity: Vec<NodeSelectorRequirement>,
    /// Tolerations.
    pub tolerations: Vec<Toleration>,
    /// Required anti-affinity against pods with these labels on the same node.
    pub anti_affinity: Option<BTreeMap<String, String>>,
    /// Host ports the pod binds.
    pub host_ports: Vec<u16>,
    /// Controlling owner.
    pub owner: Option<OwnerReference>,
    /// Scheduling priority.
    pub priority: i32,
    /// Node the pod is bound to.
    pub node_name: Option<String>,
    /// Node nominated by preemption, if any.
    pub nominated_node_name: Option<String>,
    /// Lifecycle phase.
    pub phase: PodPhase,
    /// The scheduler reported the pod as unschedulable.
    pub unschedulable: bool,
    /// Volumes.
    pub volumes: Vec<Volume>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deletion request time.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Termination grace period in seconds.
    pub termination_grace_period_secs: Option<u64>,
}

impl Pod {
    /// Default termination grace period.
    pub const DEFAULT_TERMINATION_GRACE_SECS: u64 = 30;

    /// Creates a pending pod with the given requests.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, requests: Resources) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            requests,
            ..Self::default()
        }
    }

    /// Returns the `namespace/name` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Sets a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets the controlling owner.
    #[must_use]
    pub fn with_owner(mut self, kind: OwnerKind, name: impl Into<String>) -> Self {
        self.owner = Some(OwnerReference {
            kind,
            name: name.into(),
        });
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Requires a node label.
    #[must_use]
    pub fn with_node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Adds a required node affinity term.
    #[must_use]
    pub fn with_node_affinity(mut self, requirement: NodeSelectorRequirement) -> Self {
        self.node_affinity.push(requirement);
        self
    }

    /// Adds a toleration.
    #[must_use]
    pub fn with_toleration(mut self, toleration: Toleration) -> Self {
        self.tolerations.push(toleration);
        self
    }

    /// Refuses to share a node with pods carrying these labels.
    #[must_use]
    pub fn with_anti_affinity(mut self, selector: BTreeMap<String, String>) -> Self {
        self.anti_affinity = Some(selector);
        self
    }

    /// Binds a host port.
    #[must_use]
    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_ports.push(port);
        self
    }

    /// Adds a volume.
    #[must_use]
    pub fn with_volume(mut self, name: impl Into<String>, source: VolumeSource) -> Self {
        self.volumes.push(Volume {
            name: name.into(),
            source,
        });
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the phase.
    #[must_use]
    pub const fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Binds the pod to a node and marks it running.
    #[must_use]
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self.phase = PodPhase::Running;
        self.unschedulable = false;
        self
    }

    /// Marks the pod as pending and rejected by the scheduler.
    #[must_use]
    pub fn unschedulable(mut self) -> Self {
        self.node_name = None;
        self.phase = PodPhase::Pending;
        self.unschedulable = true;
        self
    }

    /// Marks the pod as being deleted since the given time.
    #[must_use]
    pub const fn terminating_since(mut self, at: DateTime<Utc>) -> Self {
        self.deletion_timestamp = Some(at);
        self
    }

    /// Returns the controlling owner, if any.
    #[must_use]
    pub const fn controller(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }

    /// Returns true if a DaemonSet owns the pod.
    #[must_use]
    pub fn is_daemonset(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.kind == OwnerKind::DaemonSet)
    }

    /// Returns true for mirror (static) pods.
    #[must_use]
    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_MIRROR_POD)
    }

    /// Returns true once the pod has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Returns true if the pod has been terminating for longer than its
    /// grace period plus `extra`.
    #[must_use]
    pub fn is_long_terminating(&self, now: DateTime<Utc>, extra: ChronoDuration) -> bool {
        let Some(deleted_at) = self.deletion_timestamp else {
            return false;
        };
        let grace = self
            .termination_grace_period_secs
            .unwrap_or(Self::DEFAULT_TERMINATION_GRACE_SECS);
        let grace = ChronoDuration::seconds(i64::try_from(grace).unwrap_or(i64::MAX / 1000));
        now > deleted_at + grace + extra
    }

    /// Returns true for pods waiting for capacity.
    #[must_use]
    pub fn is_pending_unschedulable(&self) -> bool {
        self.node_name.is_none()
            && self.phase == PodPhase::Pending
            && self.unschedulable
            && self.nominated_node_name.is_none()
            && self.deletion_timestamp.is_none()
    }

    /// Returns true if the labels match every entry of the selector.
    #[must_use]
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// A node together with the pods placed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node.
    pub node: Node,
    pods: Vec<Pod>,
    requested: Resources,
}

impl NodeInfo {
    /// Creates a node info with no pods.
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self {
            node,
            pods: Vec::new(),
            requested: Resources::default(),
        }
    }

    /// Creates a node info with the given pods.
    #[must_use]
    pub fn with_pods(node: Node, pods: impl IntoIterator<Item = Pod>) -> Self {
        let mut info = Self::new(node);
        for pod in pods {
            info.add_pod(pod);
        }
        info
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Returns the pods on the node.
    #[must_use]
    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    /// Returns the summed requests of all pods, including pod slots.
    #[must_use]
    pub const fn requested(&self) -> &Resources {
        &self.requested
    }

    /// Returns allocatable minus requested.
    #[must_use]
    pub fn free(&self) -> Resources {
        self.node.allocatable.saturating_sub(&self.requested)
    }

    /// Places a pod on the node.
    pub fn add_pod(&mut self, mut pod: Pod) {
        self.requested += &pod.requests;
        self.requested.pods += 1;
        pod.node_name = Some(self.node.name.clone());
        self.pods.push(pod);
    }

    /// Removes a pod from the node.
    pub fn remove_pod(&mut self, namespace: &str, name: &str) -> Option<Pod> {
        let idx = self
            .pods
            .iter()
            .position(|p| p.namespace == namespace && p.name == name)?;
        let pod = self.pods.remove(idx);
        self.requested = self.requested.saturating_sub(&pod.requests);
        self.requested.pods = self.requested.pods.saturating_sub(1);
        Some(pod)
    }

    /// Returns pods that are neither DaemonSet nor mirror pods.
    pub fn workload_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| !p.is_daemonset() && !p.is_mirror())
    }
}

/// A pod disruption budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Label selector for member pods.
    pub selector: BTreeMap<String, String>,
    /// Voluntary disruptions currently allowed.
    #[serde(default)]
    pub disruptions_allowed: u32,
}

impl PodDisruptionBudget {
    /// Returns true if the pod is covered by this budget.
    #[must_use]
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.namespace == self.namespace
            && !self.selector.is_empty()
            && pod.matches_labels(&self.selector)
    }

    /// Returns the `namespace/name` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A replicated workload controller, as reported by the listers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Controller kind.
    pub kind: OwnerKind,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Desired replicas.
    pub replicas: u32,
}
