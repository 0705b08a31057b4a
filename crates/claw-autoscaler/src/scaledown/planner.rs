//! Scale-down planning: which nodes are unneeded, and which of them may go
//! now.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::deletion_tracker::NodeDeletionTracker;
use super::drainability::{DeleteOptions, DrainContext, DrainabilityRules};
use super::eligibility::{EligibilityChecker, UtilizationInfo};
use super::ordering::{sort_by_risk, CandidateOrdering};
use super::pdb::RemainingPdbTracker;
use super::simulator::{NodeToBeRemoved, RemovalSimulator};
use super::to_chrono;
use super::unneeded::{Removable, RemovalContext, UnneededNodes, UnremovableNodes};
use crate::clusterstate::ClusterStateRegistry;
use crate::config::AutoscalingOptions;
use crate::scheduler::Scheduler;
use crate::snapshot::ClusterSnapshot;
use crate::status::{UnremovableNode, UnremovableReason};
use crate::types::{Pod, PodDisruptionBudget, Workload};

/// Keeps the unneeded and unremovable node sets up to date and picks
/// nodes to delete.
#[derive(Debug)]
pub struct ScaleDownPlanner {
    options: AutoscalingOptions,
    delete_options: DeleteOptions,
    simulator: RemovalSimulator,
    eligibility: EligibilityChecker,
    deletions: Arc<NodeDeletionTracker>,
    unneeded: UnneededNodes,
    unremovable: UnremovableNodes,
    previous: HashSet<String>,
    utilization: BTreeMap<String, UtilizationInfo>,
}

impl ScaleDownPlanner {
    /// Creates a planner.
    #[must_use]
    pub fn new(
        options: &AutoscalingOptions,
        scheduler: Arc<dyn Scheduler>,
        rules: DrainabilityRules,
        deletions: Arc<NodeDeletionTracker>,
    ) -> Self {
        Self {
            options: options.clone(),
            delete_options: DeleteOptions::from_options(&options.scale_down),
            simulator: RemovalSimulator::new(scheduler, rules),
            eligibility: EligibilityChecker::new(),
            deletions,
            unneeded: UnneededNodes::new(),
            unremovable: UnremovableNodes::new(),
            previous: HashSet::new(),
            utilization: BTreeMap::new(),
        }
    }

    /// Re-evaluates every candidate against the current snapshot.
    ///
    /// Pods of a candidate may only be relocated onto `destinations`.
    /// Relocations are simulated in a fork that is reverted before
    /// returning, so the snapshot is unchanged afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn update_cluster_state(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        cluster_state: &ClusterStateRegistry,
        candidates: &[String],
        destinations: &[String],
        pdbs: Vec<PodDisruptionBudget>,
        workloads: &[Workload],
        now: DateTime<Utc>,
    ) {
        let infos = snapshot.list_node_infos();
        let live: HashSet<String> = infos.iter().map(|i| i.name().to_string()).collect();
        let live_pods: HashSet<String> = infos
            .iter()
            .flat_map(|i| i.pods().iter().map(Pod::key))
            .collect();
        self.unremovable.update(&live, now);
        self.simulator.drop_old_hints(&live_pods);

        let being_deleted: HashSet<String> =
            self.deletions.deletions_in_progress().into_iter().collect();
        let candidates: Vec<String> = candidates
            .iter()
            .filter(|c| !being_deleted.contains(*c))
            .cloned()
            .collect();

        let eligibility = self.eligibility.filter_out_unremovable(
            snapshot,
            &candidates,
            cluster_state,
            &self.unremovable,
            now,
        );
        for node in eligibility.ineligible {
            self.unremovable.add(node);
        }
        self.utilization = eligibility.utilization;

        let mut eligible = eligibility.eligible;
        // finish what was started before looking at new nodes
        eligible.sort_by_key(|n| !self.unneeded.contains(n));

        let mut destinations: HashSet<String> = destinations
            .iter()
            .filter(|n| live.contains(*n) && !being_deleted.contains(*n))
            .cloned()
            .collect();
        let limit = self.unneeded_limit(live.len());
        let deadline = self.options.scale_down.simulation_timeout;
        let recheck = to_chrono(self.options.scale_down.unremovable_node_recheck_timeout);
        let mut pdb_tracker = RemainingPdbTracker::new(pdbs);
        let mut removable = Vec::new();
        let started = Instant::now();

        snapshot.fork();
        let mut timed_out = Vec::new();
        let mut remaining = eligible.into_iter();
        while let Some(name) = remaining.next() {
            if started.elapsed() >= deadline {
                debug!(node = %name, "scale-down simulation timed out");
                timed_out.push(name);
                timed_out.extend(remaining.by_ref());
                break;
            }
            if removable.len() >= limit {
                debug!(limit, "unneeded node limit reached");
                break;
            }
            let Some(group) = cluster_state.node_group_of(&name).cloned() else {
                continue;
            };
            let ctx = DrainContext {
                pdbs: &pdb_tracker,
                workloads,
                options: &self.delete_options,
                now,
            };
            match self
                .simulator
                .simulate_node_removal(snapshot, &name, &ctx, &destinations)
            {
                Ok(moved) => {
                    let check = pdb_tracker.can_remove_pods(&moved.pods);
                    pdb_tracker.remove_pods(&moved.pods);
                    destinations.remove(&name);
                    removable.push(NodeToBeRemoved {
                        utilization: self.utilization.get(&name).map_or(0.0, |u| u.result),
                        node: name,
                        group,
                        pods_to_reschedule: moved.pods,
                        daemonset_pods: moved.daemonset_pods,
                        is_risky: !check.in_parallel,
                    });
                }
                Err(reason) => {
                    debug!(node = %name, %reason, "node is not removable");
                    self.unremovable
                        .add_timeout(UnremovableNode { node: name, reason }, now + recheck);
                }
            }
        }
        for name in timed_out {
            self.unremovable.add(UnremovableNode {
                node: name,
                reason: UnremovableReason::SimulationTimeout,
            });
        }
        snapshot.revert();

        self.previous = self.unneeded.names().into_iter().collect();
        self.unneeded.update(removable, now);
        info!(
            unneeded = self.unneeded.len(),
            unremovable = self.unremovable.as_list().len(),
            "scale-down candidates updated"
        );
    }

    /// Upper bound on nodes found unneeded per iteration: what can be
    /// deleted within one unneeded grace period, plus a buffer.
    fn unneeded_limit(&self, total_nodes: usize) -> usize {
        let n = self.options.scale_down.max_scale_down_parallelism;
        let mut limit = self.unneeded.len() + 2 * n;
        let interval = self.options.scan_interval;
        let unneeded_time = self.options.node_group_defaults.scale_down_unneeded_time;
        if !interval.is_zero() && interval < unneeded_time {
            let updates = usize::try_from(unneeded_time.as_nanos() / interval.as_nanos())
                .unwrap_or(usize::MAX);
            limit = limit.min(n.saturating_mul(updates).saturating_add(n));
        }
        limit.min(self.options.scale_down_candidate_limit(total_nodes))
    }

    /// Unneeded nodes that may be deleted now, in deletion order.
    #[must_use]
    pub fn nodes_to_delete(&self, ctx: &RemovalContext<'_>, now: DateTime<Utc>) -> Removable {
        let mut removable = self.unneeded.removable_at(ctx, now);
        let scaled_up: Vec<_> = ctx
            .cluster_state
            .scale_up_requests()
            .into_iter()
            .map(|r| r.group.clone())
            .collect();
        let ordering = CandidateOrdering::default_chain(self.previous.iter().cloned(), scaled_up);
        ordering.sort(&mut removable.empty);
        ordering.sort(&mut removable.drain);
        sort_by_risk(&mut removable.drain);
        removable
    }

    /// Forgets every unneeded node.
    pub fn clean_up_unneeded_nodes(&mut self) {
        self.unneeded.clear();
    }

    /// Nodes currently unneeded.
    #[must_use]
    pub fn unneeded_nodes(&self) -> Vec<&NodeToBeRemoved> {
        self.unneeded.as_list()
    }

    /// Names of nodes currently unneeded.
    #[must_use]
    pub fn unneeded_names(&self) -> Vec<String> {
        self.unneeded.names()
    }

    /// Nodes found unremovable in the last update.
    #[must_use]
    pub fn unremovable_nodes(&self) -> Vec<UnremovableNode> {
        self.unremovable.as_list()
    }

    /// Utilization of the candidates checked in the last update.
    #[must_use]
    pub const fn utilization(&self) -> &BTreeMap<String, UtilizationInfo> {
        &self.utilization
    }
}
