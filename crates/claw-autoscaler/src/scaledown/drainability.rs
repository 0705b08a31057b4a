//! Per-pod drainability rules.
//!
//! Each rule looks at one pod and either decides what draining the pod's
//! node means for it or defers to the next rule. The first decision wins;
//! a pod no rule decides on is drained.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::pdb::RemainingPdbTracker;
use crate::config::ScaleDownOptions;
use crate::types::{OwnerKind, Pod, Workload, SYSTEM_NAMESPACE};

/// `true` lets the pod be evicted whatever the other rules say; `false`
/// pins its node.
pub const ANNOTATION_SAFE_TO_EVICT: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Comma-separated local volume names that may be lost on eviction.
pub const ANNOTATION_SAFE_TO_EVICT_LOCAL_VOLUMES: &str =
    "cluster-autoscaler.kubernetes.io/safe-to-evict-local-volumes";

/// Extra time after the grace period before a terminating pod is ignored.
const LONG_TERMINATING_EXTRA_SECS: i64 = 300;

/// Why a pod prevents its node from being drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingPodReason {
    /// Annotated not safe to evict.
    NotSafeToEvictAnnotation,
    /// No controller would recreate the pod.
    NotReplicated,
    /// The owning controller does not exist.
    ControllerNotFound,
    /// The owning controller runs too few replicas.
    MinReplicasReached,
    /// A kube-system pod without a disruption budget.
    UnmovableKubeSystemPod,
    /// The pod uses node-local storage.
    LocalStorageRequested,
    /// A disruption budget allows no more disruptions.
    NotEnoughPdb,
    /// A rule failed.
    UnexpectedError,
}

impl fmt::Display for BlockingPodReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotSafeToEvictAnnotation => "not safe to evict annotation",
            Self::NotReplicated => "not replicated",
            Self::ControllerNotFound => "controller not found",
            Self::MinReplicasReached => "min replicas reached",
            Self::UnmovableKubeSystemPod => "unmovable kube-system pod",
            Self::LocalStorageRequested => "local storage requested",
            Self::NotEnoughPdb => "not enough pod disruption budget",
            Self::UnexpectedError => "unexpected error",
        };
        f.write_str(text)
    }
}

/// A pod that blocks draining, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingPod {
    /// `namespace/name` of the pod.
    pub pod: String,
    /// Reason.
    pub reason: BlockingPodReason,
}

impl BlockingPod {
    /// Creates a blocking pod entry.
    #[must_use]
    pub fn new(pod: &Pod, reason: BlockingPodReason) -> Self {
        Self {
            pod: pod.key(),
            reason,
        }
    }
}

impl fmt::Display for BlockingPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pod, self.reason)
    }
}

/// What draining a node means for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The rule has no opinion.
    Undefined,
    /// The pod is evicted and must be placed elsewhere.
    Drain,
    /// The pod is ignored.
    Skip,
    /// The pod pins the node.
    Block(BlockingPodReason),
}

/// Which pods pin their node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Block on kube-system pods without a disruption budget.
    pub skip_nodes_with_system_pods: bool,
    /// Block on pods with local storage.
    pub skip_nodes_with_local_storage: bool,
    /// Block on pods without a known controller.
    pub skip_nodes_with_custom_controller_pods: bool,
    /// Replicas below which a controller's pods block.
    pub min_replica_count: u32,
}

impl DeleteOptions {
    /// Extracts the drain options.
    #[must_use]
    pub const fn from_options(options: &ScaleDownOptions) -> Self {
        Self {
            skip_nodes_with_system_pods: options.skip_nodes_with_system_pods,
            skip_nodes_with_local_storage: options.skip_nodes_with_local_storage,
            skip_nodes_with_custom_controller_pods: options.skip_nodes_with_custom_controller_pods,
            min_replica_count: options.min_replica_count,
        }
    }
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self::from_options(&ScaleDownOptions::default())
    }
}

/// What rules may consult.
#[derive(Debug, Clone, Copy)]
pub struct DrainContext<'a> {
    /// Remaining disruption budgets.
    pub pdbs: &'a RemainingPdbTracker,
    /// Workload controllers.
    pub workloads: &'a [Workload],
    /// Options.
    pub options: &'a DeleteOptions,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

/// A drainability rule.
pub trait DrainabilityRule: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Decides what draining means for the pod.
    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome;
}

/// Mirror pods belong to the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorPodRule;

impl DrainabilityRule for MirrorPodRule {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn drainable(&self, _ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.is_mirror() {
            DrainOutcome::Skip
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// Pods stuck terminating well past their grace period are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongTerminatingRule;

impl DrainabilityRule for LongTerminatingRule {
    fn name(&self) -> &'static str {
        "long-terminating"
    }

    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.is_long_terminating(ctx.now, ChronoDuration::seconds(LONG_TERMINATING_EXTRA_SECS)) {
            DrainOutcome::Skip
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// `safe-to-evict=true` overrides every blocking rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeToEvictRule;

impl DrainabilityRule for SafeToEvictRule {
    fn name(&self) -> &'static str {
        "safe-to-evict"
    }

    fn drainable(&self, _ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.annotations.get(ANNOTATION_SAFE_TO_EVICT).map(String::as_str) == Some("true") {
            DrainOutcome::Drain
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// Finished pods hold nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPodRule;

impl DrainabilityRule for TerminalPodRule {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn drainable(&self, _ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.is_terminal() {
            DrainOutcome::Drain
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// DaemonSet pods go with their node.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonSetRule;

impl DrainabilityRule for DaemonSetRule {
    fn name(&self) -> &'static str {
        "daemonset"
    }

    fn drainable(&self, _ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.is_daemonset() {
            DrainOutcome::Drain
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// `safe-to-evict=false` pins the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotSafeToEvictRule;

impl DrainabilityRule for NotSafeToEvictRule {
    fn name(&self) -> &'static str {
        "not-safe-to-evict"
    }

    fn drainable(&self, _ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if pod.annotations.get(ANNOTATION_SAFE_TO_EVICT).map(String::as_str) == Some("false") {
            DrainOutcome::Block(BlockingPodReason::NotSafeToEvictAnnotation)
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// Pods must be recreated by a live controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicatedRule;

impl DrainabilityRule for ReplicatedRule {
    fn name(&self) -> &'static str {
        "replicated"
    }

    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        let custom_blocks = ctx.options.skip_nodes_with_custom_controller_pods;
        let Some(owner) = pod.controller() else {
            return if custom_blocks {
                DrainOutcome::Block(BlockingPodReason::NotReplicated)
            } else {
                DrainOutcome::Undefined
            };
        };
        if !owner.kind.is_known() {
            return if custom_blocks {
                DrainOutcome::Block(BlockingPodReason::NotReplicated)
            } else {
                DrainOutcome::Undefined
            };
        }
        let workload = ctx
            .workloads
            .iter()
            .find(|w| w.kind == owner.kind && w.namespace == pod.namespace && w.name == owner.name);
        let Some(workload) = workload else {
            trace!(pod = %pod.key(), controller = %owner.name, "controller not found");
            return DrainOutcome::Block(BlockingPodReason::ControllerNotFound);
        };
        let counts_replicas = matches!(
            owner.kind,
            OwnerKind::ReplicaSet | OwnerKind::ReplicationController
        );
        if counts_replicas && workload.replicas < ctx.options.min_replica_count {
            return DrainOutcome::Block(BlockingPodReason::MinReplicasReached);
        }
        DrainOutcome::Undefined
    }
}

/// kube-system pods move only under a disruption budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPodRule;

impl DrainabilityRule for SystemPodRule {
    fn name(&self) -> &'static str {
        "system"
    }

    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if ctx.options.skip_nodes_with_system_pods
            && pod.namespace == SYSTEM_NAMESPACE
            && ctx.pdbs.matching(pod).is_empty()
        {
            DrainOutcome::Block(BlockingPodReason::UnmovableKubeSystemPod)
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// Node-local volumes are lost on eviction unless explicitly allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorageRule;

impl DrainabilityRule for LocalStorageRule {
    fn name(&self) -> &'static str {
        "local-storage"
    }

    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        if !ctx.options.skip_nodes_with_local_storage {
            return DrainOutcome::Undefined;
        }
        let allowed: Vec<&str> = pod
            .annotations
            .get(ANNOTATION_SAFE_TO_EVICT_LOCAL_VOLUMES)
            .map(|v| v.split(',').map(str::trim).collect())
            .unwrap_or_default();
        let blocked = pod
            .volumes
            .iter()
            .any(|v| v.source.is_local() && !allowed.contains(&v.name.as_str()));
        if blocked {
            DrainOutcome::Block(BlockingPodReason::LocalStorageRequested)
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// Exhausted disruption budgets pin their pods.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdbRule;

impl DrainabilityRule for PdbRule {
    fn name(&self) -> &'static str {
        "pdb"
    }

    fn drainable(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        let exhausted = ctx
            .pdbs
            .matching(pod)
            .iter()
            .any(|pdb| ctx.pdbs.remaining(&pdb.key()).unwrap_or(0) == 0);
        if exhausted {
            DrainOutcome::Block(BlockingPodReason::NotEnoughPdb)
        } else {
            DrainOutcome::Undefined
        }
    }
}

/// An ordered rule set.
#[derive(Debug)]
pub struct DrainabilityRules {
    rules: Vec<Box<dyn DrainabilityRule>>,
}

impl Default for DrainabilityRules {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(MirrorPodRule),
                Box::new(LongTerminatingRule),
                Box::new(SafeToEvictRule),
                Box::new(TerminalPodRule),
                Box::new(DaemonSetRule),
                Box::new(NotSafeToEvictRule),
                Box::new(ReplicatedRule),
                Box::new(SystemPodRule),
                Box::new(LocalStorageRule),
                Box::new(PdbRule),
            ],
        }
    }
}

impl DrainabilityRules {
    /// The default rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a custom rule ahead of the existing ones.
    #[must_use]
    pub fn with_custom(mut self, rule: impl DrainabilityRule + 'static) -> Self {
        self.rules.insert(0, Box::new(rule));
        self
    }

    /// Rule names in evaluation order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Returns the first decision, or `Drain` if no rule decides.
    #[must_use]
    pub fn evaluate(&self, ctx: &DrainContext<'_>, pod: &Pod) -> DrainOutcome {
        for rule in &self.rules {
            let outcome = rule.drainable(ctx, pod);
            if outcome != DrainOutcome::Undefined {
                trace!(pod = %pod.key(), rule = rule.name(), ?outcome, "drainability decided");
                return outcome;
            }
        }
        DrainOutcome::Drain
    }
}

/// Pods a drain must relocate, and the DaemonSet pods it may evict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodsToMove {
    /// Pods that need a new home.
    pub pods: Vec<Pod>,
    /// DaemonSet pods, which need no new home.
    pub daemonset_pods: Vec<Pod>,
}

/// Classifies every pod on a node.
///
/// # Errors
///
/// Returns the first blocking pod.
pub fn pods_to_move<'p>(
    rules: &DrainabilityRules,
    ctx: &DrainContext<'_>,
    pods: impl IntoIterator<Item = &'p Pod>,
) -> Result<PodsToMove, BlockingPod> {
    let mut result = PodsToMove::default();
    for pod in pods {
        match rules.evaluate(ctx, pod) {
            DrainOutcome::Skip | DrainOutcome::Undefined => {}
            DrainOutcome::Drain if pod.is_daemonset() => result.daemonset_pods.push(pod.clone()),
            DrainOutcome::Drain if pod.is_terminal() => {}
            DrainOutcome::Drain => result.pods.push(pod.clone()),
            DrainOutcome::Block(reason) => return Err(BlockingPod::new(pod, reason)),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        PodDisruptionBudget, PodPhase, Resources, VolumeSource, ANNOTATION_MIRROR_POD,
    };
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn workloads() -> Vec<Workload> {
        vec![
            Workload {
                kind: OwnerKind::ReplicaSet,
                namespace: "default".into(),
                name: "web".into(),
                replicas: 3,
            },
            Workload {
                kind: OwnerKind::ReplicaSet,
                namespace: "kube-system".into(),
                name: "dns".into(),
                replicas: 2,
            },
        ]
    }

    fn web(name: &str) -> Pod {
        Pod::new("default", name, Resources::new(100, 0))
            .with_owner(OwnerKind::ReplicaSet, "web")
            .with_label("app", "web")
            .on_node("n1")
    }

    fn evaluate(pod: &Pod, options: &DeleteOptions, pdbs: &RemainingPdbTracker) -> DrainOutcome {
        let workloads = workloads();
        let ctx = DrainContext {
            pdbs,
            workloads: &workloads,
            options,
            now: Utc::now(),
        };
        DrainabilityRules::default().evaluate(&ctx, pod)
    }

    fn outcome(pod: &Pod) -> DrainOutcome {
        evaluate(pod, &DeleteOptions::default(), &RemainingPdbTracker::default())
    }

    fn web_pdb(allowed: u32) -> RemainingPdbTracker {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        let mut tracker = RemainingPdbTracker::default();
        tracker.set_pdbs(vec![PodDisruptionBudget {
            namespace: "default".into(),
            name: "web".into(),
            selector,
            disruptions_allowed: allowed,
        }]);
        tracker
    }

    #[test]
    fn replicated_pod_drains() {
        assert_eq!(outcome(&web("a")), DrainOutcome::Drain);
    }

    #[test]
    fn mirror_pod_skipped() {
        let pod = Pod::new("kube-system", "static", Resources::default())
            .with_annotation(ANNOTATION_MIRROR_POD, "x")
            .on_node("n1");
        assert_eq!(outcome(&pod), DrainOutcome::Skip);
    }

    #[test]
    fn long_terminating_pod_skipped() {
        let pod = web("a").terminating_since(Utc::now() - ChronoDuration::minutes(10));
        assert_eq!(outcome(&pod), DrainOutcome::Skip);
    }

    #[test]
    fn safe_to_evict_overrides_blockers() {
        let pod = Pod::new("default", "bare", Resources::default())
            .with_annotation(ANNOTATION_SAFE_TO_EVICT, "true")
            .on_node("n1");
        assert_eq!(outcome(&pod), DrainOutcome::Drain);
    }

    #[test]
    fn finished_pod_drains() {
        let pod = Pod::new("default", "done", Resources::default())
            .on_node("n1")
            .with_phase(PodPhase::Succeeded);
        assert_eq!(outcome(&pod), DrainOutcome::Drain);
    }

    #[test_case(
        web("a").with_annotation(ANNOTATION_SAFE_TO_EVICT, "false"),
        BlockingPodReason::NotSafeToEvictAnnotation;
        "annotation"
    )]
    #[test_case(
        Pod::new("default", "bare", Resources::default()).on_node("n1"),
        BlockingPodReason::NotReplicated;
        "no controller"
    )]
    #[test_case(
        Pod::new("default", "custom", Resources::default())
            .with_owner(OwnerKind::Other("Rollout".into()), "r")
            .on_node("n1"),
        BlockingPodReason::NotReplicated;
        "custom controller"
    )]
    #[test_case(
        Pod::new("default", "orphan", Resources::default())
            .with_owner(OwnerKind::ReplicaSet, "gone")
            .on_node("n1"),
        BlockingPodReason::ControllerNotFound;
        "missing controller"
    )]
    #[test_case(
        Pod::new("kube-system", "dns-1", Resources::default())
            .with_owner(OwnerKind::ReplicaSet, "dns")
            .on_node("n1"),
        BlockingPodReason::UnmovableKubeSystemPod;
        "system pod"
    )]
    #[test_case(
        web("a").with_volume("scratch", VolumeSource::EmptyDir),
        BlockingPodReason::LocalStorageRequested;
        "local storage"
    )]
    fn blocking_rules(pod: Pod, reason: BlockingPodReason) {
        assert_eq!(outcome(&pod), DrainOutcome::Block(reason));
    }

    #[test]
    fn daemonset_pod_drains_without_controller_lookup() {
        let pod = Pod::new("kube-system", "agent", Resources::default())
            .with_owner(OwnerKind::DaemonSet, "agent")
            .on_node("n1");
        assert_eq!(outcome(&pod), DrainOutcome::Drain);
    }

    #[test]
    fn allowed_local_volume_does_not_block() {
        let pod = web("a")
            .with_volume("scratch", VolumeSource::EmptyDir)
            .with_annotation(ANNOTATION_SAFE_TO_EVICT_LOCAL_VOLUMES, "scratch");
        assert_eq!(outcome(&pod), DrainOutcome::Drain);
    }

    #[test]
    fn min_replicas_blocks() {
        let options = DeleteOptions {
            min_replica_count: 5,
            ..DeleteOptions::default()
        };
        assert_eq!(
            evaluate(&web("a"), &options, &RemainingPdbTracker::default()),
            DrainOutcome::Block(BlockingPodReason::MinReplicasReached)
        );
    }

    #[test]
    fn relaxed_options_let_pods_drain() {
        let options = DeleteOptions {
            skip_nodes_with_system_pods: false,
            skip_nodes_with_local_storage: false,
            skip_nodes_with_custom_controller_pods: false,
            min_replica_count: 0,
        };
        let bare = Pod::new("default", "bare", Resources::default()).on_node("n1");
        assert_eq!(evaluate(&bare, &options, &RemainingPdbTracker::default()), DrainOutcome::Drain);
        let local = web("a").with_volume("scratch", VolumeSource::HostPath);
        assert_eq!(evaluate(&local, &options, &RemainingPdbTracker::default()), DrainOutcome::Drain);
    }

    #[test]
    fn exhausted_pdb_blocks() {
        let options = DeleteOptions::default();
        assert_eq!(
            evaluate(&web("a"), &options, &web_pdb(0)),
            DrainOutcome::Block(BlockingPodReason::NotEnoughPdb)
        );
        assert_eq!(evaluate(&web("a"), &options, &web_pdb(1)), DrainOutcome::Drain);
    }

    #[derive(Debug)]
    struct NeverDrain;

    impl DrainabilityRule for NeverDrain {
        fn name(&self) -> &'static str {
            "never"
        }

        fn drainable(&self, _ctx: &DrainContext<'_>, _pod: &Pod) -> DrainOutcome {
            DrainOutcome::Block(BlockingPodReason::UnexpectedError)
        }
    }

    #[test]
    fn custom_rules_run_first() {
        let rules = DrainabilityRules::new().with_custom(NeverDrain);
        assert_eq!(rules.names()[0], "never");
        let pdbs = RemainingPdbTracker::default();
        let workloads = workloads();
        let options = DeleteOptions::default();
        let ctx = DrainContext {
            pdbs: &pdbs,
            workloads: &workloads,
            options: &options,
            now: Utc::now(),
        };
        let pod = Pod::new("kube-system", "static", Resources::default())
            .with_annotation(ANNOTATION_MIRROR_POD, "x");
        assert_eq!(
            rules.evaluate(&ctx, &pod),
            DrainOutcome::Block(BlockingPodReason::UnexpectedError)
        );
    }

    #[test]
    fn pods_to_move_splits_daemonsets_and_stops_at_blocker() {
        let pdbs = RemainingPdbTracker::default();
        let workloads = workloads();
        let options = DeleteOptions::default();
        let ctx = DrainContext {
            pdbs: &pdbs,
            workloads: &workloads,
            options: &options,
            now: Utc::now(),
        };
        let ds = Pod::new("kube-system", "agent", Resources::default())
            .with_owner(OwnerKind::DaemonSet, "agent")
            .on_node("n1");
        let pods = [web("a"), ds, web("b")];
        let moved = pods_to_move(&DrainabilityRules::default(), &ctx, pods.iter()).expect("drainable");
        assert_eq!(moved.pods.len(), 2);
        assert_eq!(moved.daemonset_pods.len(), 1);

        let bare = Pod::new("default", "bare", Resources::default()).on_node("n1");
        let blocked = pods_to_move(&DrainabilityRules::default(), &ctx, [web("a"), bare].iter())
            .unwrap_err();
        assert_eq!(blocked.pod, "default/bare");
        assert_eq!(blocked.reason, BlockingPodReason::NotReplicated);
        assert_eq!(blocked.to_string(), "default/bare (not replicated)");
    }
}
