//! Remaining pod disruption budgets for one iteration.
//!
//! The tracker starts each iteration from the budgets' reported
//! `disruptions_allowed` and is decremented as the simulation and the
//! executor commit to evicting pods.

use std::collections::BTreeMap;

use tracing::trace;

use super::drainability::{BlockingPod, BlockingPodReason};
use crate::types::{Pod, PodDisruptionBudget};

/// Result of checking a set of pods against the remaining budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbCheck {
    /// Every pod may be evicted, at least one at a time.
    pub can_remove: bool,
    /// Every pod may be evicted at once.
    pub in_parallel: bool,
    /// The first pod whose budget is exhausted.
    pub blocking: Option<BlockingPod>,
}

/// Disruption budgets and the disruptions each still allows.
#[derive(Debug, Clone, Default)]
pub struct RemainingPdbTracker {
    pdbs: Vec<PodDisruptionBudget>,
    remaining: BTreeMap<String, u32>,
}

impl RemainingPdbTracker {
    /// Creates a tracker over the given budgets.
    #[must_use]
    pub fn new(pdbs: Vec<PodDisruptionBudget>) -> Self {
        let mut tracker = Self::default();
        tracker.set_pdbs(pdbs);
        tracker
    }

    /// Replaces the budgets and resets the remaining counts.
    pub fn set_pdbs(&mut self, pdbs: Vec<PodDisruptionBudget>) {
        self.remaining = pdbs
            .iter()
            .map(|p| (p.key(), p.disruptions_allowed))
            .collect();
        self.pdbs = pdbs;
    }

    /// Every tracked budget.
    #[must_use]
    pub fn pdbs(&self) -> &[PodDisruptionBudget] {
        &self.pdbs
    }

    /// Budgets covering the pod.
    #[must_use]
    pub fn matching(&self, pod: &Pod) -> Vec<&PodDisruptionBudget> {
        self.pdbs.iter().filter(|p| p.matches(pod)).collect()
    }

    /// Disruptions a budget still allows.
    #[must_use]
    pub fn remaining(&self, key: &str) -> Option<u32> {
        self.remaining.get(key).copied()
    }

    /// Checks whether the pods may be evicted under the remaining budgets.
    #[must_use]
    pub fn can_remove_pods(&self, pods: &[Pod]) -> PdbCheck {
        let mut needed: BTreeMap<String, u32> = BTreeMap::new();
        for pod in pods {
            for pdb in self.matching(pod) {
                let key = pdb.key();
                if self.remaining(&key).unwrap_or(0) == 0 {
                    return PdbCheck {
                        can_remove: false,
                        in_parallel: false,
                        blocking: Some(BlockingPod::new(pod, BlockingPodReason::NotEnoughPdb)),
                    };
                }
                *needed.entry(key).or_default() += 1;
            }
        }
        let in_parallel = needed
            .iter()
            .all(|(key, count)| self.remaining(key).unwrap_or(0) >= *count);
        PdbCheck {
            can_remove: true,
            in_parallel,
            blocking: None,
        }
    }

    /// Charges the pods against their budgets.
    pub fn remove_pods(&mut self, pods: &[Pod]) {
        for pod in pods {
            let keys: Vec<String> = self.matching(pod).iter().map(|p| p.key()).collect();
            for key in keys {
                if let Some(left) = self.remaining.get_mut(&key) {
                    *left = left.saturating_sub(1);
                }
            }
        }
    }

    /// Charges a single pod if every budget covering it has room.
    ///
    /// Returns `false`, charging nothing, otherwise.
    pub fn try_remove_pod(&mut self, pod: &Pod) -> bool {
        let keys: Vec<String> = self.matching(pod).iter().map(|p| p.key()).collect();
        if keys.iter().any(|k| self.remaining(k).unwrap_or(0) == 0) {
            trace!(pod = %pod.key(), "disruption budget exhausted");
            return false;
        }
        for key in keys {
            if let Some(left) = self.remaining.get_mut(&key) {
                *left -= 1;
            }
        }
        true
    }
}
