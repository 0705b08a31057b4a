//! Node removal simulation.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use super::drainability::{pods_to_move, DrainContext, DrainabilityRules, PodsToMove};
use crate::scheduler::{HintingSimulator, Scheduler};
use crate::snapshot::ClusterSnapshot;
use crate::status::UnremovableReason;
use crate::types::{NodeGroupId, NodeInfo, Pod};

/// A node that can be removed, and what removing it entails.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeToBeRemoved {
    /// Node name.
    pub node: String,
    /// Owning group.
    pub group: NodeGroupId,
    /// Pods that must land elsewhere.
    pub pods_to_reschedule: Vec<Pod>,
    /// DaemonSet pods on the node.
    pub daemonset_pods: Vec<Pod>,
    /// Utilization at simulation time.
    pub utilization: f64,
    /// Disruption budgets do not allow evicting every pod at once.
    pub is_risky: bool,
}

impl NodeToBeRemoved {
    /// Returns true if no pod has to move.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pods_to_reschedule.is_empty()
    }
}

/// Simulates draining nodes into the rest of the cluster.
#[derive(Debug)]
pub struct RemovalSimulator {
    hinting: HintingSimulator,
    rules: DrainabilityRules,
}

impl RemovalSimulator {
    /// Creates a simulator.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>, rules: DrainabilityRules) -> Self {
        Self {
            hinting: HintingSimulator::new(scheduler),
            rules,
        }
    }

    /// The drainability rules in use.
    #[must_use]
    pub const fn rules(&self) -> &DrainabilityRules {
        &self.rules
    }

    /// Checks whether `node` could be removed, relocating its pods onto
    /// `destinations`.
    ///
    /// On success the relocation stays in the snapshot, so later
    /// simulations see the moved pods. On failure the snapshot is left as
    /// it was.
    ///
    /// # Errors
    ///
    /// Returns why the node cannot be removed.
    pub fn simulate_node_removal(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        node: &str,
        ctx: &DrainContext<'_>,
        destinations: &HashSet<String>,
    ) -> Result<PodsToMove, UnremovableReason> {
        let info = snapshot
            .get_node_info(node)
            .map_err(|e| UnremovableReason::UnexpectedError(e.to_string()))?;
        let moved = pods_to_move(&self.rules, ctx, info.pods().iter())
            .map_err(UnremovableReason::BlockedByPod)?;
        if moved.pods.is_empty() {
            trace!(node, "nothing to relocate");
            return Ok(moved);
        }

        snapshot.fork();
        for pod in &moved.pods {
            if let Err(e) = snapshot.remove_pod(&pod.namespace, &pod.name) {
                snapshot.revert();
                return Err(UnremovableReason::UnexpectedError(e.to_string()));
            }
        }
        let acceptable = |info: &NodeInfo| {
            info.name() != node && destinations.contains(info.name())
        };
        let outcome = self
            .hinting
            .try_schedule_pods(snapshot, moved.pods.clone(), &acceptable, true);
        if let Some(stuck) = outcome.unschedulable.first() {
            debug!(node, pod = %stuck.key(), "no place to move pod");
            snapshot.revert();
            return Err(UnremovableReason::NoPlaceToMovePods);
        }
        snapshot.commit();
        trace!(node, moved = outcome.scheduled.len(), "pods relocated");
        Ok(moved)
    }

    /// Forgets placement hints for pods that no longer exist.
    pub fn drop_old_hints(&mut self, live_pod_keys: &HashSet<String>) {
        self.hinting.drop_old_hints(live_pod_keys);
    }
}
