//! Autoscaler configuration.
//!
//! Options are grouped into sections that map onto TOML tables:
//! - top level: scan interval, cluster-wide node cap, expendable pod cutoff
//! - `[limits]`: cluster-wide resource ceilings and floors
//! - `[node_group_defaults]`: per-group scale-down thresholds and grace periods
//! - `[scale_up]`: estimator, expanders, balancing, binpacking deadlines
//! - `[scale_down]`: cooldowns, parallelism, drainability switches
//! - `[backoff]` and `[health]`
//!
//! Durations are written as whole seconds under `*_secs` keys.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AutoscalerError, Result};

/// Serde adapter writing a `Duration` as whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde adapter writing priority buckets with their priority as a string key.
mod priority_keys {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<i32, Vec<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let keyed: BTreeMap<String, &Vec<String>> =
            value.iter().map(|(k, v)| (k.to_string(), v)).collect();
        keyed.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<i32, Vec<String>>, D::Error> {
        let keyed = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        keyed
            .into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<i32>()
                    .map(|k| (k, v))
                    .map_err(|e| D::Error::custom(format!("invalid priority {k:?}: {e}")))
            })
            .collect()
    }
}

/// Estimator variants.
pub const ESTIMATOR_BINPACKING: &str = "binpacking";

/// Expander names recognised by the registry.
pub const KNOWN_EXPANDERS: &[&str] = &[
    "random",
    "most-pods",
    "least-waste",
    "least-nodes",
    "price",
    "priority",
];

/// GPU limit for one GPU type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuLimit {
    /// GPU type, as reported by the provider's GPU label.
    pub gpu_type: String,
    /// Minimum GPUs of this type in the cluster.
    pub min: u64,
    /// Maximum GPUs of this type in the cluster.
    pub max: u64,
}

/// Cluster-wide resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsOptions {
    /// Minimum cores in the cluster.
    pub min_cores_total: u64,
    /// Maximum cores in the cluster.
    pub max_cores_total: u64,
    /// Minimum memory in the cluster, in bytes.
    pub min_memory_total: u64,
    /// Maximum memory in the cluster, in bytes.
    pub max_memory_total: u64,
    /// Per-type GPU limits.
    pub gpu_total: Vec<GpuLimit>,
}

impl Default for ResourceLimitsOptions {
    fn default() -> Self {
        Self {
            min_cores_total: 0,
            max_cores_total: 320_000,
            min_memory_total: 0,
            max_memory_total: 6_400_000 * crate::types::GIB,
            gpu_total: Vec::new(),
        }
    }
}

/// Scale-down thresholds and grace periods that a node group may override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupAutoscalingOptions {
    /// Utilization below which a node is under-utilized.
    pub scale_down_utilization_threshold: f64,
    /// GPU utilization below which a GPU node is under-utilized.
    pub scale_down_gpu_utilization_threshold: f64,
    /// Grace before an under-utilized node is deleted.
    #[serde(rename = "scale_down_unneeded_time_secs", with = "secs")]
    pub scale_down_unneeded_time: Duration,
    /// Grace before an empty node is deleted.
    #[serde(rename = "scale_down_empty_unneeded_time_secs", with = "secs")]
    pub scale_down_empty_unneeded_time: Duration,
    /// Grace before an unready node is deleted.
    #[serde(rename = "scale_down_unready_time_secs", with = "secs")]
    pub scale_down_unready_time: Duration,
    /// Wait before an unprovisioned node is considered failed.
    #[serde(rename = "max_node_provision_time_secs", with = "secs")]
    pub max_node_provision_time: Duration,
    /// Treat the group as all-or-nothing.
    pub zero_or_max_node_scaling: bool,
    /// Exclude DaemonSet pods from utilization.
    pub ignore_daemonsets_utilization: bool,
}

impl Default for NodeGroupAutoscalingOptions {
    fn default() -> Self {
        Self {
            scale_down_utilization_threshold: 0.5,
            scale_down_gpu_utilization_threshold: 0.5,
            scale_down_unneeded_time: Duration::from_secs(600),
            scale_down_empty_unneeded_time: Duration::from_secs(600),
            scale_down_unready_time: Duration::from_secs(1200),
            max_node_provision_time: Duration::from_secs(900),
            zero_or_max_node_scaling: false,
            ignore_daemonsets_utilization: false,
        }
    }
}

/// Scale-up options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleUpOptions {
    /// Estimator variant.
    pub estimator_name: String,
    /// Expander chain, applied in order.
    pub expander_names: Vec<String>,
    /// Priority expander buckets: priority to group-id regexes.
    #[serde(with = "priority_keys")]
    pub priorities: BTreeMap<i32, Vec<String>>,
    /// Split scale-ups across similar node groups.
    pub balance_similar_node_groups: bool,
    /// If set, only these labels decide group similarity.
    pub balancing_labels: Vec<String>,
    /// Extra labels ignored when comparing groups.
    pub balancing_extra_ignored_labels: Vec<String>,
    /// Total binpacking budget for one scale-up.
    #[serde(rename = "max_binpacking_time_secs", with = "secs")]
    pub max_binpacking_time: Duration,
    /// Binpacking budget for a single node group.
    #[serde(rename = "max_node_group_binpacking_duration_secs", with = "secs")]
    pub max_node_group_binpacking_duration: Duration,
    /// Node groups estimated concurrently.
    pub binpacking_parallelism: usize,
    /// Nodes added in a single scale-up.
    pub max_nodes_per_scaleup: usize,
    /// Pods younger than this do not trigger scale-up.
    #[serde(rename = "new_pod_scale_up_delay_secs", with = "secs")]
    pub new_pod_scale_up_delay: Duration,
    /// Raise groups below their minimum size.
    pub enforce_node_group_min_size: bool,
}

impl Default for ScaleUpOptions {
    fn default() -> Self {
        Self {
            estimator_name: ESTIMATOR_BINPACKING.to_string(),
            expander_names: vec!["least-waste".to_string()],
            priorities: BTreeMap::new(),
            balance_similar_node_groups: false,
            balancing_labels: Vec::new(),
            balancing_extra_ignored_labels: Vec::new(),
            max_binpacking_time: Duration::from_secs(300),
            max_node_group_binpacking_duration: Duration::from_secs(10),
            binpacking_parallelism: 4,
            max_nodes_per_scaleup: 1000,
            new_pod_scale_up_delay: Duration::ZERO,
            enforce_node_group_min_size: false,
        }
    }
}

/// Scale-down options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleDownOptions {
    /// Global toggle.
    pub enabled: bool,
    /// Allow deleting unready nodes.
    pub unready_enabled: bool,
    /// Cooldown after a scale-up.
    #[serde(rename = "delay_after_add_secs", with = "secs")]
    pub delay_after_add: Duration,
    /// Cooldown after a deletion.
    #[serde(rename = "delay_after_delete_secs", with = "secs")]
    pub delay_after_delete: Duration,
    /// Cooldown after a failed deletion.
    #[serde(rename = "delay_after_failure_secs", with = "secs")]
    pub delay_after_failure: Duration,
    /// Simultaneous node deletions.
    pub max_scale_down_parallelism: usize,
    /// Simultaneous drains.
    pub max_drain_parallelism: usize,
    /// Budget for the removal simulation.
    #[serde(rename = "simulation_timeout_secs", with = "secs")]
    pub simulation_timeout: Duration,
    /// Time spent retrying one pod eviction.
    #[serde(rename = "max_pod_eviction_time_secs", with = "secs")]
    pub max_pod_eviction_time: Duration,
    /// Time spent draining one node.
    #[serde(rename = "max_node_drain_time_secs", with = "secs")]
    pub max_node_drain_time: Duration,
    /// Grace period granted to evicted pods.
    #[serde(rename = "max_graceful_termination_secs", with = "secs")]
    pub max_graceful_termination: Duration,
    /// Re-check interval for unremovable nodes.
    #[serde(rename = "unremovable_node_recheck_timeout_secs", with = "secs")]
    pub unremovable_node_recheck_timeout: Duration,
    /// Block nodes running non-DaemonSet kube-system pods without a PDB.
    pub skip_nodes_with_system_pods: bool,
    /// Block nodes running pods with local storage.
    pub skip_nodes_with_local_storage: bool,
    /// Block nodes running pods without a known controller.
    pub skip_nodes_with_custom_controller_pods: bool,
    /// Replicas below which a controller's pods block drain.
    pub min_replica_count: u32,
    /// Evict DaemonSet pods from drained nodes.
    pub daemonset_eviction_for_occupied_nodes: bool,
    /// Fraction of nodes simulated as non-empty removal candidates.
    pub candidates_pool_ratio: f64,
    /// Lower bound on the simulated candidate pool.
    pub candidates_pool_min_count: usize,
    /// Non-empty unneeded nodes kept as candidates.
    pub non_empty_candidates_count: usize,
}

impl Default for ScaleDownOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            unready_enabled: true,
            delay_after_add: Duration::from_secs(600),
            delay_after_delete: Duration::ZERO,
            delay_after_failure: Duration::from_secs(180),
            max_scale_down_parallelism: 10,
            max_drain_parallelism: 1,
            simulation_timeout: Duration::from_secs(30),
            max_pod_eviction_time: Duration::from_secs(120),
            max_node_drain_time: Duration::from_secs(600),
            max_graceful_termination: Duration::from_secs(600),
            unremovable_node_recheck_timeout: Duration::from_secs(300),
            skip_nodes_with_system_pods: true,
            skip_nodes_with_local_storage: true,
            skip_nodes_with_custom_controller_pods: true,
            min_replica_count: 0,
            daemonset_eviction_for_occupied_nodes: true,
            candidates_pool_ratio: 0.1,
            candidates_pool_min_count: 50,
            non_empty_candidates_count: 30,
        }
    }
}

/// Node group backoff options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffOptions {
    /// First backoff after a failure.
    #[serde(rename = "initial_secs", with = "secs")]
    pub initial: Duration,
    /// Upper bound for backoff.
    #[serde(rename = "max_secs", with = "secs")]
    pub max: Duration,
    /// Quiet period after which backoff restarts from `initial`.
    #[serde(rename = "reset_timeout_secs", with = "secs")]
    pub reset_timeout: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(300),
            max: Duration::from_secs(1800),
            reset_timeout: Duration::from_secs(3 * 3600),
        }
    }
}

/// Cluster health circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthOptions {
    /// Unready percentage above which the autoscaler halts.
    pub max_total_unready_percentage: f64,
    /// Unready nodes tolerated regardless of percentage.
    pub ok_total_unready_count: usize,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
        }
    }
}

/// Complete autoscaler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingOptions {
    /// Maximum delay between iterations.
    #[serde(rename = "scan_interval_secs", with = "secs")]
    pub scan_interval: Duration,
    /// Hard upper bound on total nodes. Zero disables the bound.
    pub max_nodes_total: usize,
    /// Pods below this priority never trigger scale-up or block scale-down.
    pub expendable_pods_priority_cutoff: i32,
    /// Cloud provider name.
    pub cloud_provider_name: String,
    /// Cluster-wide resource limits.
    pub limits: ResourceLimitsOptions,
    /// Defaults for per-group options.
    pub node_group_defaults: NodeGroupAutoscalingOptions,
    /// Scale-up options.
    pub scale_up: ScaleUpOptions,
    /// Scale-down options.
    pub scale_down: ScaleDownOptions,
    /// Backoff options.
    pub backoff: BackoffOptions,
    /// Health options.
    pub health: HealthOptions,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            max_nodes_total: 0,
            expendable_pods_priority_cutoff: -10,
            cloud_provider_name: "in-memory".to_string(),
            limits: ResourceLimitsOptions::default(),
            node_group_defaults: NodeGroupAutoscalingOptions::default(),
            scale_up: ScaleUpOptions::default(),
            scale_down: ScaleDownOptions::default(),
            backoff: BackoffOptions::default(),
            health: HealthOptions::default(),
        }
    }
}

impl AutoscalingOptions {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AutoscalerError::config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let options: Self = toml::from_str(content)
            .map_err(|e| AutoscalerError::config(format!("invalid TOML: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AutoscalerError::config(format!("cannot render TOML: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval.is_zero() {
            return Err(AutoscalerError::config("scan_interval must be positive"));
        }

        let defaults = &self.node_group_defaults;
        for (name, value) in [
            (
                "scale_down_utilization_threshold",
                defaults.scale_down_utilization_threshold,
            ),
            (
                "scale_down_gpu_utilization_threshold",
                defaults.scale_down_gpu_utilization_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AutoscalerError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.scale_down.max_scale_down_parallelism == 0 {
            return Err(AutoscalerError::config(
                "max_scale_down_parallelism must be at least 1",
            ));
        }
        if self.scale_down.max_drain_parallelism == 0 {
            return Err(AutoscalerError::config(
                "max_drain_parallelism must be at least 1",
            ));
        }
        if self.scale_up.binpacking_parallelism == 0 {
            return Err(AutoscalerError::config(
                "binpacking_parallelism must be at least 1",
            ));
        }
        if self.scale_up.max_nodes_per_scaleup == 0 {
            return Err(AutoscalerError::config(
                "max_nodes_per_scaleup must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.scale_down.candidates_pool_ratio) {
            return Err(AutoscalerError::config(
                "candidates_pool_ratio must be within [0, 1]",
            ));
        }

        let limits = &self.limits;
        if limits.min_cores_total > limits.max_cores_total {
            return Err(AutoscalerError::config(
                "min_cores_total cannot exceed max_cores_total",
            ));
        }
        if limits.min_memory_total > limits.max_memory_total {
            return Err(AutoscalerError::config(
                "min_memory_total cannot exceed max_memory_total",
            ));
        }
        let mut gpu_types = HashSet::new();
        for gpu in &limits.gpu_total {
            if gpu.gpu_type.is_empty() {
                return Err(AutoscalerError::config("gpu_total entry without gpu_type"));
            }
            if gpu.min > gpu.max {
                return Err(AutoscalerError::config(format!(
                    "gpu limit for {}: min cannot exceed max",
                    gpu.gpu_type
                )));
            }
            if !gpu_types.insert(gpu.gpu_type.as_str()) {
                return Err(AutoscalerError::config(format!(
                    "duplicate gpu limit for {}",
                    gpu.gpu_type
                )));
            }
        }

        if !(0.0..=100.0).contains(&self.health.max_total_unready_percentage) {
            return Err(AutoscalerError::config(
                "max_total_unready_percentage must be within [0, 100]",
            ));
        }

        if self.backoff.initial > self.backoff.max {
            return Err(AutoscalerError::config(
                "initial backoff cannot exceed max backoff",
            ));
        }

        if self.scale_up.estimator_name != ESTIMATOR_BINPACKING {
            return Err(AutoscalerError::config(format!(
                "unknown estimator: {}",
                self.scale_up.estimator_name
            )));
        }

        self.validate_expanders()
    }

    fn validate_expanders(&self) -> Result<()> {
        let names = &self.scale_up.expander_names;
        if names.is_empty() {
            return Err(AutoscalerError::config("expander_names cannot be empty"));
        }
        let mut seen = HashSet::new();
        for name in names {
            if !KNOWN_EXPANDERS.contains(&name.as_str()) {
                return Err(AutoscalerError::config(format!("unknown expander: {name}")));
            }
            if !seen.insert(name.as_str()) {
                return Err(AutoscalerError::config(format!(
                    "expander {name} listed more than once"
                )));
            }
        }
        if seen.contains("priority") && self.scale_up.priorities.is_empty() {
            return Err(AutoscalerError::config(
                "priority expander requires at least one priority bucket",
            ));
        }
        for patterns in self.scale_up.priorities.values() {
            for pattern in patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    AutoscalerError::config(format!("invalid priority regex {pattern:?}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Maximum number of nodes the removal simulation considers.
    #[must_use]
    pub fn scale_down_candidate_limit(&self, total_nodes: usize) -> usize {
        let sd = &self.scale_down;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let by_ratio = (total_nodes as f64 * sd.candidates_pool_ratio).ceil() as usize;
        by_ratio
            .max(sd.candidates_pool_min_count)
            .max(sd.non_empty_candidates_count)
    }

    /// Returns the cluster-wide minimum and maximum for a resource name.
    ///
    /// CPU is expressed in cores and memory in bytes.
    #[must_use]
    pub fn limits_for(&self, resource: &str) -> Option<(u64, u64)> {
        match resource {
            crate::types::RESOURCE_CPU => {
                Some((self.limits.min_cores_total, self.limits.max_cores_total))
            }
            crate::types::RESOURCE_MEMORY => {
                Some((self.limits.min_memory_total, self.limits.max_memory_total))
            }
            gpu => self
                .limits
                .gpu_total
                .iter()
                .find(|g| g.gpu_type == gpu)
                .map(|g| (g.min, g.max)),
        }
    }
}
