//! Order in which removable nodes are deleted.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use super::simulator::NodeToBeRemoved;
use crate::types::NodeGroupId;

/// Compares two deletion candidates; `Less` is deleted first.
pub trait CandidateComparator: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Orders two candidates.
    fn compare(&self, a: &NodeToBeRemoved, b: &NodeToBeRemoved) -> Ordering;
}

/// Empty nodes go first.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyFirst;

impl CandidateComparator for EmptyFirst {
    fn name(&self) -> &'static str {
        "empty-first"
    }

    fn compare(&self, a: &NodeToBeRemoved, b: &NodeToBeRemoved) -> Ordering {
        b.is_empty().cmp(&a.is_empty())
    }
}

/// Last iteration's candidates go first.
#[derive(Debug, Clone, Default)]
pub struct PreviousCandidates {
    previous: HashSet<String>,
}

impl PreviousCandidates {
    /// Prefers the given nodes.
    #[must_use]
    pub fn new(previous: impl IntoIterator<Item = String>) -> Self {
        Self {
            previous: previous.into_iter().collect(),
        }
    }
}

impl CandidateComparator for PreviousCandidates {
    fn name(&self) -> &'static str {
        "previous-candidates"
    }

    fn compare(&self, a: &NodeToBeRemoved, b: &NodeToBeRemoved) -> Ordering {
        let a_prev = self.previous.contains(&a.node);
        let b_prev = self.previous.contains(&b.node);
        b_prev.cmp(&a_prev)
    }
}

/// Nodes of groups with a scale-up in flight go last.
#[derive(Debug, Clone, Default)]
pub struct RecentScaleUpDemotion {
    scaled_up: HashSet<NodeGroupId>,
}

impl RecentScaleUpDemotion {
    /// Demotes nodes of the given groups.
    #[must_use]
    pub fn new(scaled_up: impl IntoIterator<Item = NodeGroupId>) -> Self {
        Self {
            scaled_up: scaled_up.into_iter().collect(),
        }
    }
}

impl CandidateComparator for RecentScaleUpDemotion {
    fn name(&self) -> &'static str {
        "recent-scale-up-demotion"
    }

    fn compare(&self, a: &NodeToBeRemoved, b: &NodeToBeRemoved) -> Ordering {
        let a_recent = self.scaled_up.contains(&a.group);
        let b_recent = self.scaled_up.contains(&b.group);
        a_recent.cmp(&b_recent)
    }
}

/// Less utilized nodes go first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByUtilization;

impl CandidateComparator for ByUtilization {
    fn name(&self) -> &'static str {
        "utilization"
    }

    fn compare(&self, a: &NodeToBeRemoved, b: &NodeToBeRemoved) -> Ordering {
        a.utilization.total_cmp(&b.utilization)
    }
}

/// A chain of comparators; later ones break ties of earlier ones.
#[derive(Debug, Default)]
pub struct CandidateOrdering {
    comparators: Vec<Box<dyn CandidateComparator>>,
}

impl CandidateOrdering {
    /// An empty chain, which keeps the input order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty nodes, then previous candidates, then nodes of groups not
    /// scaling up, then by utilization.
    #[must_use]
    pub fn default_chain(
        previous: impl IntoIterator<Item = String>,
        scaled_up: impl IntoIterator<Item = NodeGroupId>,
    ) -> Self {
        Self::new()
            .then(EmptyFirst)
            .then(PreviousCandidates::new(previous))
            .then(RecentScaleUpDemotion::new(scaled_up))
            .then(ByUtilization)
    }

    /// Appends a comparator.
    #[must_use]
    pub fn then(mut self, comparator: impl CandidateComparator + 'static) -> Self {
        self.comparators.push(Box::new(comparator));
        self
    }

    /// Sorts the candidates in place. Ties keep their input order.
    pub fn sort(&self, nodes: &mut [NodeToBeRemoved]) {
        nodes.sort_by(|a, b| {
            self.comparators
                .iter()
                .map(|c| c.compare(a, b))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }
}

/// Moves risky nodes behind the others, keeping the order within each part.
pub fn sort_by_risk(nodes: &mut [NodeToBeRemoved]) {
    nodes.sort_by_key(|n| n.is_risky);
}
