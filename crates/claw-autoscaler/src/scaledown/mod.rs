//! Scale-down: finding unneeded nodes and removing them.
//!
//! The [`planner::ScaleDownPlanner`] keeps track of which nodes could be
//! removed and since when; the [`actuator::ScaleDownActuator`] deletes the
//! ones whose grace period has passed, within the parallelism budgets.

pub mod actuator;
pub mod budgets;
pub mod deletion_tracker;
pub mod drainability;
pub mod eligibility;
pub mod ordering;
pub mod pdb;
pub mod planner;
pub mod simulator;
pub mod unneeded;

pub use actuator::{DeletionPlan, ScaleDownActuator};
pub use budgets::{node_group_views, BudgetProcessor, NodeGroupView};
pub use deletion_tracker::NodeDeletionTracker;
pub use drainability::{
    BlockingPod, BlockingPodReason, DeleteOptions, DrainOutcome, DrainabilityRule,
    DrainabilityRules,
};
pub use eligibility::{calculate_utilization, UtilizationInfo};
pub use ordering::{CandidateComparator, CandidateOrdering};
pub use pdb::RemainingPdbTracker;
pub use planner::ScaleDownPlanner;
pub use simulator::{NodeToBeRemoved, RemovalSimulator};
pub use unneeded::{Removable, RemovalContext, UnneededNodes, UnremovableNodes};

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
