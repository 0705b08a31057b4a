//! Similar node groups and splitting a scale-up across them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::ScaleUpOptions;
use crate::error::{AutoscalerError, Result};
use crate::status::ScaleUpInfo;
use crate::types::{
    NodeGroupId, NodeInfo, Resources, LABEL_HOSTNAME, LABEL_REGION, LABEL_ZONE, RESOURCE_CPU,
    RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY, RESOURCE_PODS,
};

/// Capacity memory may differ by this ratio, as kernels reserve different amounts.
pub const MAX_CAPACITY_MEMORY_DIFFERENCE_RATIO: f64 = 0.015;
/// Allocatable resources may differ by this ratio.
pub const MAX_ALLOCATABLE_DIFFERENCE_RATIO: f64 = 0.05;
/// Free resources may differ by this ratio.
pub const MAX_FREE_DIFFERENCE_RATIO: f64 = 0.05;

/// Labels that always differ between otherwise identical groups.
const BASIC_IGNORED_LABELS: &[&str] = &[
    LABEL_HOSTNAME,
    LABEL_ZONE,
    LABEL_REGION,
    "failure-domain.beta.kubernetes.io/zone",
    "failure-domain.beta.kubernetes.io/region",
    "beta.kubernetes.io/instance-type",
];

fn named(resources: &Resources) -> BTreeMap<String, u64> {
    let mut map: BTreeMap<String, u64> = resources
        .extended
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    map.insert(RESOURCE_CPU.to_string(), resources.cpu_millis);
    map.insert(RESOURCE_MEMORY.to_string(), resources.memory_bytes);
    map.insert(RESOURCE_EPHEMERAL_STORAGE.to_string(), resources.ephemeral_storage_bytes);
    map.insert(RESOURCE_PODS.to_string(), resources.pods);
    map.retain(|_, v| *v > 0);
    map
}

#[allow(clippy::cast_precision_loss)]
fn within_tolerance(a: u64, b: u64, ratio: f64) -> bool {
    let larger = a.max(b) as f64;
    let smaller = a.min(b) as f64;
    larger - smaller <= larger * ratio
}

fn maps_within_tolerance(a: &BTreeMap<String, u64>, b: &BTreeMap<String, u64>, ratio: f64) -> bool {
    a.len() == b.len()
        && a.iter().all(|(name, qa)| {
            b.get(name)
                .is_some_and(|qb| within_tolerance(*qa, *qb, ratio))
        })
}

/// Decides whether two node groups are interchangeable.
#[derive(Debug, Clone, Default)]
pub struct NodeInfoComparator {
    balancing_labels: Vec<String>,
    ignored_labels: BTreeSet<String>,
}

impl NodeInfoComparator {
    /// Builds a comparator from the scale-up options.
    ///
    /// With `balancing_labels` set, only those labels are compared. Otherwise
    /// every label except the topology labels and
    /// `balancing_extra_ignored_labels` must match.
    #[must_use]
    pub fn from_options(options: &ScaleUpOptions) -> Self {
        let ignored_labels = BASIC_IGNORED_LABELS
            .iter()
            .map(ToString::to_string)
            .chain(options.balancing_extra_ignored_labels.iter().cloned())
            .collect();
        Self {
            balancing_labels: options.balancing_labels.clone(),
            ignored_labels,
        }
    }

    fn labels_match(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        let (la, lb) = (&a.node.labels, &b.node.labels);
        if !self.balancing_labels.is_empty() {
            return self
                .balancing_labels
                .iter()
                .all(|key| la.get(key).is_some() && la.get(key) == lb.get(key));
        }
        let keep = |labels: &BTreeMap<String, String>| -> BTreeMap<String, String> {
            labels
                .iter()
                .filter(|(k, _)| !self.ignored_labels.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        keep(la) == keep(lb)
    }

    fn capacity_matches(a: &NodeInfo, b: &NodeInfo) -> bool {
        let (ca, cb) = (named(&a.node.capacity), named(&b.node.capacity));
        if ca.len() != cb.len() {
            return false;
        }
        ca.iter().all(|(name, qa)| {
            let Some(qb) = cb.get(name) else {
                return false;
            };
            if name == RESOURCE_MEMORY {
                within_tolerance(*qa, *qb, MAX_CAPACITY_MEMORY_DIFFERENCE_RATIO)
            } else {
                qa == qb
            }
        })
    }

    /// Returns true if the two templates are similar.
    #[must_use]
    pub fn similar(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        Self::capacity_matches(a, b)
            && maps_within_tolerance(
                &named(&a.node.allocatable),
                &named(&b.node.allocatable),
                MAX_ALLOCATABLE_DIFFERENCE_RATIO,
            )
            && maps_within_tolerance(&named(&a.free()), &named(&b.free()), MAX_FREE_DIFFERENCE_RATIO)
            && self.labels_match(a, b)
    }

    /// Groups among `candidates` similar to `group`, in id order.
    #[must_use]
    pub fn find_similar(
        &self,
        group: &NodeGroupId,
        templates: &BTreeMap<NodeGroupId, NodeInfo>,
        candidates: impl IntoIterator<Item = NodeGroupId>,
    ) -> Vec<NodeGroupId> {
        let Some(reference) = templates.get(group) else {
            return Vec::new();
        };
        let mut similar: Vec<NodeGroupId> = candidates
            .into_iter()
            .filter(|id| id != group)
            .filter(|id| templates.get(id).is_some_and(|t| self.similar(reference, t)))
            .collect();
        similar.sort();
        similar.dedup();
        similar
    }
}

/// Splits `new_nodes` across groups so their sizes end up as even as
/// possible, never exceeding a group's maximum.
///
/// Each round adds a node to the smallest group that still has room, ties
/// broken by id. Only groups that grow are returned, in id order. When the
/// groups cannot absorb every node, as many as fit are placed.
///
/// # Errors
///
/// Returns an internal error if `new_nodes` is zero or no group has room.
pub fn balance_scale_up_between_groups(groups: &[ScaleUpInfo], new_nodes: usize) -> Result<Vec<ScaleUpInfo>> {
    if new_nodes == 0 {
        return Err(AutoscalerError::internal("cannot balance a scale-up of zero nodes"));
    }
    let mut infos: Vec<ScaleUpInfo> = groups
        .iter()
        .filter(|g| g.current_size < g.max_size)
        .cloned()
        .map(|mut g| {
            g.new_size = g.current_size;
            g
        })
        .collect();
    if infos.is_empty() {
        return Err(AutoscalerError::internal("no node group can be scaled up"));
    }
    infos.sort_by(|a, b| a.group.cmp(&b.group));

    let capacity: usize = infos.iter().map(|g| g.max_size - g.current_size).sum();
    let mut remaining = new_nodes.min(capacity);
    if remaining < new_nodes {
        debug!(requested = new_nodes, capacity, "similar groups cannot absorb the full scale-up");
    }
    while remaining > 0 {
        let Some(smallest) = infos
            .iter_mut()
            .filter(|g| g.new_size < g.max_size)
            .min_by_key(|g| g.new_size)
        else {
            break;
        };
        smallest.new_size += 1;
        remaining -= 1;
    }
    infos.retain(|g| g.new_size > g.current_size);
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, Pod, GIB, MIB};
    use proptest::prelude::*;

    fn template(name: &str, cpu: u64, mem: u64) -> NodeInfo {
        NodeInfo::new(
            Node::new(name, Resources::new(cpu, mem).with_pods(110))
                .with_label(LABEL_ZONE, name)
                .with_label("pool", "general"),
        )
    }

    fn info(group: &str, current: usize, max: usize) -> ScaleUpInfo {
        ScaleUpInfo {
            group: NodeGroupId::new(group),
            current_size: current,
            new_size: current,
            max_size: max,
        }
    }

    mod similarity_tests {
        use super::*;

        #[test]
        fn zones_differ_but_groups_are_similar() {
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            assert!(cmp.similar(&template("a", 2000, 4 * GIB), &template("b", 2000, 4 * GIB)));
        }

        #[test]
        fn small_memory_difference_tolerated() {
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            let a = template("a", 2000, 4000 * MIB);
            let b = template("b", 2000, 3960 * MIB);
            assert!(cmp.similar(&a, &b));
            let c = template("c", 2000, 3000 * MIB);
            assert!(!cmp.similar(&a, &c));
        }

        #[test]
        fn cpu_must_match_exactly() {
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            assert!(!cmp.similar(&template("a", 2000, 4 * GIB), &template("b", 2010, 4 * GIB)));
        }

        #[test]
        fn differing_label_breaks_similarity_unless_ignored() {
            let a = template("a", 2000, 4 * GIB);
            let mut b = template("b", 2000, 4 * GIB);
            b.node.labels.insert("pool".into(), "batch".into());
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            assert!(!cmp.similar(&a, &b));

            let options = ScaleUpOptions {
                balancing_extra_ignored_labels: vec!["pool".into()],
                ..ScaleUpOptions::default()
            };
            assert!(NodeInfoComparator::from_options(&options).similar(&a, &b));
        }

        #[test]
        fn balancing_labels_only() {
            let a = template("a", 2000, 4 * GIB).node.with_label("team", "x");
            let b = template("b", 8000, 4 * GIB).node.with_label("team", "x");
            let options = ScaleUpOptions {
                balancing_labels: vec!["team".into()],
                ..ScaleUpOptions::default()
            };
            let cmp = NodeInfoComparator::from_options(&options);
            // Capacity still has to match.
            assert!(!cmp.similar(&NodeInfo::new(a.clone()), &NodeInfo::new(b)));
            let c = template("c", 2000, 4 * GIB).node.with_label("team", "x");
            assert!(cmp.similar(&NodeInfo::new(a), &NodeInfo::new(c)));
        }

        #[test]
        fn free_resources_compared() {
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            let a = template("a", 2000, 4 * GIB);
            let mut b = template("b", 2000, 4 * GIB);
            b.add_pod(Pod::new("kube-system", "agent", Resources::new(500, 0)));
            assert!(!cmp.similar(&a, &b));
        }

        #[test]
        fn find_similar_excludes_self() {
            let cmp = NodeInfoComparator::from_options(&ScaleUpOptions::default());
            let templates: BTreeMap<NodeGroupId, NodeInfo> = [
                (NodeGroupId::new("a"), template("a", 2000, 4 * GIB)),
                (NodeGroupId::new("b"), template("b", 2000, 4 * GIB)),
                (NodeGroupId::new("c"), template("c", 4000, 8 * GIB)),
            ]
            .into_iter()
            .collect();
            let similar = cmp.find_similar(&NodeGroupId::new("a"), &templates, templates.keys().cloned());
            assert_eq!(similar, vec![NodeGroupId::new("b")]);
        }
    }

    mod balance_tests {
        use super::*;

        #[test]
        fn evens_out_sizes() {
            let groups = [info("a", 1, 10), info("b", 3, 10), info("c", 0, 10)];
            let result = balance_scale_up_between_groups(&groups, 5).expect("balance");
            let sizes: Vec<(&str, usize)> =
                result.iter().map(|i| (i.group.as_str(), i.new_size)).collect();
            assert_eq!(sizes, vec![("a", 3), ("b", 3), ("c", 3)]);
        }

        #[test]
        fn respects_max() {
            let groups = [info("a", 0, 1), info("b", 0, 10)];
            let result = balance_scale_up_between_groups(&groups, 6).expect("balance");
            assert_eq!(result[0].new_size, 1);
            assert_eq!(result[1].new_size, 5);
        }

        #[test]
        fn remainder_goes_to_lowest_id() {
            let groups = [info("b", 2, 10), info("a", 2, 10)];
            let result = balance_scale_up_between_groups(&groups, 1).expect("balance");
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].group.as_str(), "a");
        }

        #[test]
        fn full_groups_rejected() {
            assert!(balance_scale_up_between_groups(&[info("a", 3, 3)], 1).is_err());
            assert!(balance_scale_up_between_groups(&[info("a", 0, 3)], 0).is_err());
        }
    }

    proptest! {
        #[test]
        fn balanced_sizes_stay_within_bounds(
            sizes in proptest::collection::vec((0usize..20, 0usize..20), 1..6),
            new_nodes in 1usize..50,
        ) {
            let groups: Vec<ScaleUpInfo> = sizes
                .iter()
                .enumerate()
                .map(|(i, (current, extra))| info(&format!("g{i}"), *current, current + extra))
                .collect();
            let capacity: usize = groups.iter().map(|g| g.max_size - g.current_size).sum();
            match balance_scale_up_between_groups(&groups, new_nodes) {
                Ok(result) => {
                    let added: usize = result.iter().map(|r| r.new_size - r.current_size).sum();
                    prop_assert_eq!(added, new_nodes.min(capacity));
                    for r in &result {
                        prop_assert!(r.new_size <= r.max_size);
                        prop_assert!(r.new_size > r.current_size);
                    }
                    // Groups that grew end within one node of each other unless capped.
                    let uncapped: Vec<usize> = result
                        .iter()
                        .filter(|r| r.new_size < r.max_size)
                        .map(|r| r.new_size)
                        .collect();
                    if let (Some(lo), Some(hi)) = (uncapped.iter().min(), uncapped.iter().max()) {
                        prop_assert!(hi - lo <= 1);
                    }
                }
                Err(_) => prop_assert_eq!(capacity, 0),
            }
        }
    }
}
