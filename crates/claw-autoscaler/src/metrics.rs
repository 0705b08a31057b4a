//! Prometheus metrics for the autoscaler.
//!
//! [`AutoscalerMetrics`] owns its own registry and is handed to components as
//! an `Arc`. Nothing is registered globally. Serving the encoded text over
//! HTTP is left to the embedding binary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::ErrorKind;

const PREFIX: &str = "cluster_autoscaler";

/// Node state label.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeStateLabels {
    /// `ready`, `unready` or `not_started`.
    pub state: String,
}

/// Reason label.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    /// Reason.
    pub reason: String,
}

/// Error class label, encoded as `type`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error class.
    pub r#type: String,
}

/// Skipped scale event labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SkippedLabels {
    /// `up` or `down`.
    pub direction: String,
    /// Why the event was skipped.
    pub reason: String,
}

/// Activity label.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActivityLabels {
    /// Loop activity.
    pub activity: String,
}

/// Function label for duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FunctionLabels {
    /// Measured function.
    pub function: String,
}

/// Loop activities whose last occurrence is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Any iteration.
    Main,
    /// Autoscaling work in an iteration.
    Autoscaling,
    /// A scale-up attempt.
    ScaleUp,
    /// A scale-down attempt.
    ScaleDown,
}

impl Activity {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Autoscaling => "autoscaling",
            Self::ScaleUp => "scaleUp",
            Self::ScaleDown => "scaleDown",
        }
    }
}

/// Measured loop phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionLabel {
    /// Whole iteration.
    Main,
    /// Cloud provider refresh.
    CloudProviderRefresh,
    /// Snapshot rebuild.
    UpdateState,
    /// Pod-list processors.
    FilterOutSchedulable,
    /// Scale-up.
    ScaleUp,
    /// Unneeded node search.
    FindUnneeded,
    /// Scale-down execution.
    ScaleDown,
}

impl FunctionLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::CloudProviderRefresh => "cloudProviderRefresh",
            Self::UpdateState => "updateClusterState",
            Self::FilterOutSchedulable => "filterOutSchedulable",
            Self::ScaleUp => "scaleUp",
            Self::FindUnneeded => "findUnneeded",
            Self::ScaleDown => "scaleDown",
        }
    }
}

fn duration_histogram() -> Histogram {
    // 10ms to ~5.5 minutes
    Histogram::new(exponential_buckets(0.01, 2.0, 16))
}

/// Observability context shared by the control loop and its components.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    registry: Arc<RwLock<Registry>>,
    cluster_safe_to_autoscale: Gauge,
    nodes_count: Family<NodeStateLabels, Gauge>,
    node_groups_count: Gauge,
    unschedulable_pods_count: Gauge,
    unneeded_nodes_count: Gauge,
    scaled_up_nodes: Counter,
    scaled_down_nodes: Family<ReasonLabels, Counter>,
    failed_scale_ups: Family<ReasonLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
    evicted_pods: Counter,
    skipped_scale_events: Family<SkippedLabels, Counter>,
    last_activity: Family<ActivityLabels, Gauge>,
    function_duration_seconds: Family<FunctionLabels, Histogram>,
}

impl std::fmt::Debug for AutoscalerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoscalerMetrics")
            .field("scaled_up_nodes", &self.scaled_up_nodes.get())
            .field("evicted_pods", &self.evicted_pods.get())
            .finish_non_exhaustive()
    }
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    /// Creates the metrics and registers them in a fresh registry.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(PREFIX);

        let cluster_safe_to_autoscale = Gauge::default();
        registry.register(
            "cluster_safe_to_autoscale",
            "Whether or not cluster is healthy enough for autoscaling. 1 if it is, 0 otherwise",
            cluster_safe_to_autoscale.clone(),
        );
        let nodes_count = Family::<NodeStateLabels, Gauge>::default();
        registry.register(
            "nodes_count",
            "Number of nodes in cluster",
            nodes_count.clone(),
        );
        let node_groups_count = Gauge::default();
        registry.register(
            "node_groups_count",
            "Number of node groups managed by the autoscaler",
            node_groups_count.clone(),
        );
        let unschedulable_pods_count = Gauge::default();
        registry.register(
            "unschedulable_pods_count",
            "Number of unschedulable pods in the cluster",
            unschedulable_pods_count.clone(),
        );
        let unneeded_nodes_count = Gauge::default();
        registry.register(
            "unneeded_nodes_count",
            "Number of nodes currently considered unneeded",
            unneeded_nodes_count.clone(),
        );
        let scaled_up_nodes = Counter::default();
        registry.register(
            "scaled_up_nodes",
            "Number of nodes added by the autoscaler",
            scaled_up_nodes.clone(),
        );
        let scaled_down_nodes = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "scaled_down_nodes",
            "Number of nodes removed by the autoscaler",
            scaled_down_nodes.clone(),
        );
        let failed_scale_ups = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "failed_scale_ups",
            "Number of times scale-up operation has failed",
            failed_scale_ups.clone(),
        );
        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "errors",
            "The number of errors encountered by the autoscaler",
            errors.clone(),
        );
        let evicted_pods = Counter::default();
        registry.register(
            "evicted_pods",
            "Number of pods evicted by the autoscaler",
            evicted_pods.clone(),
        );
        let skipped_scale_events = Family::<SkippedLabels, Counter>::default();
        registry.register(
            "skipped_scale_events",
            "Number of times scaling has been skipped",
            skipped_scale_events.clone(),
        );
        let last_activity = Family::<ActivityLabels, Gauge>::default();
        registry.register(
            "last_activity",
            "Last time certain part of the autoscaler logic executed",
            last_activity.clone(),
        );
        let function_duration_seconds =
            Family::<FunctionLabels, Histogram>::new_with_constructor(duration_histogram as fn() -> Histogram);
        registry.register(
            "function_duration_seconds",
            "Time taken by various parts of the autoscaler main loop",
            function_duration_seconds.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            cluster_safe_to_autoscale,
            nodes_count,
            node_groups_count,
            unschedulable_pods_count,
            unneeded_nodes_count,
            scaled_up_nodes,
            scaled_down_nodes,
            failed_scale_ups,
            errors,
            evicted_pods,
            skipped_scale_events,
            last_activity,
            function_duration_seconds,
        }
    }

    /// Records cluster health.
    pub fn update_cluster_safe_to_autoscale(&self, safe: bool) {
        self.cluster_safe_to_autoscale.set(i64::from(safe));
    }

    /// Records node counts by readiness.
    #[allow(clippy::cast_possible_wrap)]
    pub fn update_node_counts(&self, ready: usize, unready: usize, not_started: usize) {
        for (state, count) in [
            ("ready", ready),
            ("unready", unready),
            ("not_started", not_started),
        ] {
            self.nodes_count
                .get_or_create(&NodeStateLabels {
                    state: state.to_string(),
                })
                .set(count as i64);
        }
    }

    /// Records the number of node groups.
    #[allow(clippy::cast_possible_wrap)]
    pub fn update_node_groups_count(&self, count: usize) {
        self.node_groups_count.set(count as i64);
    }

    /// Records the number of unschedulable pods.
    #[allow(clippy::cast_possible_wrap)]
    pub fn update_unschedulable_pods_count(&self, count: usize) {
        self.unschedulable_pods_count.set(count as i64);
    }

    /// Records the number of unneeded nodes.
    #[allow(clippy::cast_possible_wrap)]
    pub fn update_unneeded_nodes_count(&self, count: usize) {
        self.unneeded_nodes_count.set(count as i64);
    }

    /// Counts nodes added.
    pub fn register_scale_up(&self, nodes: usize) {
        self.scaled_up_nodes.inc_by(nodes as u64);
    }

    /// Counts a removed node.
    pub fn register_scale_down(&self, reason: &str) {
        self.scaled_down_nodes
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Counts a failed scale-up.
    pub fn register_failed_scale_up(&self, reason: &str) {
        self.failed_scale_ups
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Counts an error by class.
    pub fn register_error(&self, kind: ErrorKind) {
        self.errors
            .get_or_create(&ErrorLabels {
                r#type: kind.as_str().to_string(),
            })
            .inc();
    }

    /// Counts an evicted pod.
    pub fn register_evicted_pod(&self) {
        self.evicted_pods.inc();
    }

    /// Counts a skipped scale event.
    pub fn register_skipped_scale_event(&self, direction: &str, reason: &str) {
        self.skipped_scale_events
            .get_or_create(&SkippedLabels {
                direction: direction.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Records when an activity last ran.
    pub fn update_last_time(&self, activity: Activity, now: DateTime<Utc>) {
        self.last_activity
            .get_or_create(&ActivityLabels {
                activity: activity.as_str().to_string(),
            })
            .set(now.timestamp());
    }

    /// Records how long a loop phase took.
    pub fn update_duration(&self, function: FunctionLabel, duration: Duration) {
        self.function_duration_seconds
            .get_or_create(&FunctionLabels {
                function: function.as_str().to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Nodes added so far.
    #[must_use]
    pub fn scaled_up_nodes(&self) -> u64 {
        self.scaled_up_nodes.get()
    }

    /// Nodes removed so far for a reason.
    #[must_use]
    pub fn scaled_down_nodes(&self, reason: &str) -> u64 {
        self.scaled_down_nodes
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .get()
    }

    /// Failed scale-ups so far for a reason.
    #[must_use]
    pub fn failed_scale_ups(&self, reason: &str) -> u64 {
        self.failed_scale_ups
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .get()
    }

    /// Errors so far for a class.
    #[must_use]
    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors
            .get_or_create(&ErrorLabels {
                r#type: kind.as_str().to_string(),
            })
            .get()
    }

    /// Pods evicted so far.
    #[must_use]
    pub fn evicted_pods(&self) -> u64 {
        self.evicted_pods.get()
    }

    /// Whether the last iteration found the cluster safe to autoscale.
    #[must_use]
    pub fn cluster_safe_to_autoscale(&self) -> bool {
        self.cluster_safe_to_autoscale.get() == 1
    }

    /// Encodes all metrics in the Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            tracing::error!("failed to encode autoscaler metrics");
            return String::new();
        }
        buffer
    }
}
