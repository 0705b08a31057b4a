//! Scheduler-framework adapter.
//!
//! The autoscaler never decides placement policy itself. It asks a
//! [`Scheduler`] whether a pod fits a node of the current snapshot and gets
//! back either success or a [`PredicateFailure`] describing the reason.
//! [`PredicateChecker`] implements the predicates that matter for capacity
//! planning: resources, pod slots, node selectors and affinity, taints,
//! cordons, host ports and hostname anti-affinity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::snapshot::ClusterSnapshot;
use crate::types::{NodeInfo, Pod, TaintEffect};

/// Why a pod does not fit a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateFailure {
    /// The node is not in the snapshot.
    NodeNotFound {
        /// Node name.
        node: String,
    },
    /// A resource request exceeds what is free on the node.
    InsufficientResource {
        /// Resource name.
        resource: String,
        /// Requested quantity.
        requested: u64,
        /// Free quantity.
        available: u64,
    },
    /// Every pod slot is taken.
    TooManyPods,
    /// Node selector or required affinity does not match.
    NodeSelectorMismatch,
    /// The node carries a taint the pod does not tolerate.
    TaintNotTolerated {
        /// Taint key.
        taint_key: String,
    },
    /// The node is cordoned.
    NodeUnschedulable,
    /// A requested host port is already bound.
    HostPortConflict {
        /// Port number.
        port: u16,
    },
    /// Anti-affinity with a pod already on the node.
    AntiAffinityConflict {
        /// Key of the conflicting pod.
        pod: String,
    },
}

impl fmt::Display for PredicateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node } => write!(f, "node {node} not found"),
            Self::InsufficientResource { resource, .. } => write!(f, "Insufficient {resource}"),
            Self::TooManyPods => f.write_str("Too many pods"),
            Self::NodeSelectorMismatch => f.write_str("node(s) didn't match node selector"),
            Self::TaintNotTolerated { taint_key } => {
                write!(f, "node(s) had untolerated taint {{{taint_key}}}")
            }
            Self::NodeUnschedulable => f.write_str("node(s) were unschedulable"),
            Self::HostPortConflict { port } => {
                write!(f, "node(s) didn't have free port {port}")
            }
            Self::AntiAffinityConflict { .. } => {
                f.write_str("node(s) didn't match pod anti-affinity rules")
            }
        }
    }
}

/// Decides whether a pod fits a node of a snapshot.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Checks every predicate for `pod` on `node_name`.
    ///
    /// # Errors
    ///
    /// Returns the first failing predicate.
    fn check_predicates(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateFailure>;

    /// Returns the first node, in name order, that passes `filter` and fits the pod.
    fn fits_any_node(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        filter: &dyn Fn(&NodeInfo) -> bool,
    ) -> Option<String> {
        snapshot
            .list_node_infos()
            .into_iter()
            .filter(|info| filter(info))
            .find(|info| self.check_predicates(snapshot, pod, info.name()).is_ok())
            .map(|info| info.name().to_string())
    }
}

/// Default predicate implementation.
#[derive(Debug, Clone, Default)]
pub struct PredicateChecker;

impl PredicateChecker {
    /// Creates a predicate checker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Checks a pod against a node info directly.
    ///
    /// # Errors
    ///
    /// Returns the first failing predicate.
    pub fn check_node_info(&self, pod: &Pod, info: &NodeInfo) -> Result<(), PredicateFailure> {
        let node = &info.node;

        if node.unschedulable {
            return Err(PredicateFailure::NodeUnschedulable);
        }

        let selector_ok = pod
            .node_selector
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v))
            && pod.node_affinity.iter().all(|req| req.matches(&node.labels));
        if !selector_ok {
            return Err(PredicateFailure::NodeSelectorMismatch);
        }

        for taint in &node.taints {
            if taint.effect == TaintEffect::PreferNoSchedule {
                continue;
            }
            if !pod.tolerations.iter().any(|t| t.tolerates(taint)) {
                return Err(PredicateFailure::TaintNotTolerated {
                    taint_key: taint.key.clone(),
                });
            }
        }

        let allocatable = &node.allocatable;
        if allocatable.pods > 0 && info.requested().pods >= allocatable.pods {
            return Err(PredicateFailure::TooManyPods);
        }
        if let Some(short) = info.free().first_insufficient(&pod.requests) {
            return Err(PredicateFailure::InsufficientResource {
                resource: short.resource,
                requested: short.requested,
                available: short.available,
            });
        }

        for existing in info.pods() {
            if let Some(port) = pod
                .host_ports
                .iter()
                .find(|port| existing.host_ports.contains(port))
            {
                return Err(PredicateFailure::HostPortConflict { port: *port });
            }
            let ours = pod
                .anti_affinity
                .as_ref()
                .is_some_and(|sel| existing.matches_labels(sel));
            let theirs = existing
                .anti_affinity
                .as_ref()
                .is_some_and(|sel| pod.matches_labels(sel));
            if ours || theirs {
                return Err(PredicateFailure::AntiAffinityConflict {
                    pod: existing.key(),
                });
            }
        }

        Ok(())
    }
}

impl Scheduler for PredicateChecker {
    fn check_predicates(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateFailure> {
        let info = snapshot
            .get_node_info(node_name)
            .map_err(|_| PredicateFailure::NodeNotFound {
                node: node_name.to_string(),
            })?;
        let result = self.check_node_info(pod, info);
        if let Err(reason) = &result {
            trace!(pod = %pod.key(), node = node_name, %reason, "predicate failed");
        }
        result
    }
}

/// Outcome of placing a batch of pods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingOutcome {
    /// Pods placed, with their nodes.
    pub scheduled: Vec<(Pod, String)>,
    /// Pods that fit nowhere.
    pub unschedulable: Vec<Pod>,
}

/// Places pods into a snapshot, remembering where each pod last landed.
///
/// Hints make repeated simulations over a mostly unchanged cluster cheap:
/// the hinted node is tried before scanning every node.
#[derive(Debug, Clone)]
pub struct HintingSimulator {
    scheduler: Arc<dyn Scheduler>,
    hints: HashMap<String, String>,
}

impl HintingSimulator {
    /// Creates a simulator over a scheduler.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            hints: HashMap::new(),
        }
    }

    /// Returns the underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Places each pod on the first acceptable node it fits, in order.
    ///
    /// With `break_on_failure`, stops at the first pod that fits nowhere and
    /// reports only that pod as unschedulable.
    pub fn try_schedule_pods(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        pods: Vec<Pod>,
        is_node_acceptable: &dyn Fn(&NodeInfo) -> bool,
        break_on_failure: bool,
    ) -> SchedulingOutcome {
        let mut outcome = SchedulingOutcome::default();
        for pod in pods {
            let key = pod.key();
            let node = match self.hinted_node(&*snapshot, &pod, &key, is_node_acceptable) {
                Some(node) => Some(node),
                None => self
                    .scheduler
                    .fits_any_node(&*snapshot, &pod, is_node_acceptable),
            };
            match node {
                Some(node) if snapshot.add_pod(pod.clone(), &node).is_ok() => {
                    self.hints.insert(key, node.clone());
                    outcome.scheduled.push((pod, node));
                }
                _ => {
                    outcome.unschedulable.push(pod);
                    if break_on_failure {
                        break;
                    }
                }
            }
        }
        outcome
    }

    fn hinted_node(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        key: &str,
        is_node_acceptable: &dyn Fn(&NodeInfo) -> bool,
    ) -> Option<String> {
        let hint = self.hints.get(key)?;
        let info = snapshot.get_node_info(hint).ok()?;
        if !is_node_acceptable(info) {
            return None;
        }
        self.scheduler
            .check_predicates(snapshot, pod, hint)
            .ok()
            .map(|()| hint.clone())
    }

    /// Forgets hints for pods that no longer exist.
    pub fn drop_old_hints(&mut self, live_pod_keys: &std::collections::HashSet<String>) {
        self.hints.retain(|key, _| live_pod_keys.contains(key));
    }
}
