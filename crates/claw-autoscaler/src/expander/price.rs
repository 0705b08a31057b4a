use std::fmt;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use super::{Filter, NodeInfos, ScaleUpOption};
use crate::cloudprovider::PricingModel;
use crate::error::Result;
use crate::kube::ClusterSource;
use crate::types::{Node, Resources, GIB, RESOURCE_GPU};

/// Added to both sides of the price ratio so free pods do not divide by zero.
const STABILIZATION_PRICE: f64 = 1e-6;

/// Replaces the shape penalty when GPU nodes would host pods asking for none.
const GPU_UNFITNESS_OVERRIDE: f64 = 1000.0;

/// Node count at which the shape penalty is mostly suppressed.
const UNFITNESS_SUPPRESSION_SCALE: f64 = 15.0;

/// Supplies the node shape the cluster would ideally grow with.
pub trait PreferredNodeProvider: Send + Sync + fmt::Debug {
    /// Returns the preferred node.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be inspected.
    fn preferred_node(&self) -> Result<Node>;
}

/// Prefers bigger nodes as the cluster grows.
#[derive(Debug)]
pub struct SimplePreferredNodeProvider {
    cluster: Arc<dyn ClusterSource>,
}

impl SimplePreferredNodeProvider {
    /// Creates a provider reading the node count from `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterSource>) -> Self {
        Self { cluster }
    }

    /// Preferred core count for a cluster of `nodes` nodes.
    #[must_use]
    pub const fn preferred_cores(nodes: usize) -> u64 {
        match nodes {
            0..=2 => 1,
            3..=6 => 2,
            7..=20 => 4,
            21..=60 => 8,
            61..=200 => 16,
            201..=600 => 32,
            601..=1800 => 64,
            _ => 128,
        }
    }
}

impl PreferredNodeProvider for SimplePreferredNodeProvider {
    fn preferred_node(&self) -> Result<Node> {
        let count = self.cluster.list_nodes()?.len();
        let cores = Self::preferred_cores(count);
        let resources = Resources::new(cores * 1000, cores * 4 * GIB);
        Ok(Node::new("preferred-node", resources.clone()).with_capacity(resources))
    }
}

/// Keeps the cheapest option per pod helped.
///
/// The cost is `node_price × count / Σ pod_price`, scaled by how far the
/// group's node shape is from the preferred node. The shape penalty fades as
/// the option adds more nodes. Options whose prices are unavailable are
/// skipped.
#[derive(Debug)]
pub struct PriceFilter {
    pricing: Arc<dyn PricingModel>,
    preferred: Box<dyn PreferredNodeProvider>,
}

#[allow(clippy::cast_precision_loss)]
fn unfitness(preferred: &Node, candidate: &Node) -> f64 {
    let pref = preferred.capacity.cpu_millis.max(1) as f64;
    let cand = candidate.capacity.cpu_millis.max(1) as f64;
    (pref / cand).max(cand / pref)
}

#[allow(clippy::cast_precision_loss)]
fn suppressed_unfitness(unfitness: f64, node_count: usize) -> f64 {
    let count = node_count as f64;
    (unfitness - 1.0) * (1.0 - ((count - 1.0) / UNFITNESS_SUPPRESSION_SCALE).tanh()) + 1.0
}

impl PriceFilter {
    /// Creates a price filter.
    #[must_use]
    pub fn new(pricing: Arc<dyn PricingModel>, preferred: Box<dyn PreferredNodeProvider>) -> Self {
        Self { pricing, preferred }
    }

    fn score(&self, option: &ScaleUpOption, node_infos: &NodeInfos, preferred: &Node) -> Option<f64> {
        let template = node_infos.get(&option.group)?;
        let node = &template.node;
        let start = Utc::now();
        let end = start + ChronoDuration::hours(1);

        let node_price = match self.pricing.node_price(node, start, end) {
            Ok(price) => price,
            Err(e) => {
                warn!(node_group = %option.group, error = %e, "failed to price node");
                return None;
            }
        };
        let mut pods_price = 0.0;
        for pod in &option.pods {
            match self.pricing.pod_price(pod, start, end) {
                Ok(price) => pods_price += price,
                Err(e) => {
                    warn!(node_group = %option.group, pod = %pod.key(), error = %e, "failed to price pod");
                    return None;
                }
            }
        }

        let pods_want_gpu = option.pods.iter().any(|p| p.requests.get(RESOURCE_GPU) > 0);
        let mut fit = unfitness(preferred, node);
        if node.allocatable.gpus() > 0 && !pods_want_gpu {
            fit = GPU_UNFITNESS_OVERRIDE;
        }
        #[allow(clippy::cast_precision_loss)]
        let total_node_price = node_price * option.node_count as f64;
        let ratio = (total_node_price + STABILIZATION_PRICE) / (pods_price + STABILIZATION_PRICE);
        let score = suppressed_unfitness(fit, option.node_count) * ratio;
        debug!(node_group = %option.group, score, unfitness = fit, "price score");
        Some(score)
    }
}

impl Filter for PriceFilter {
    fn name(&self) -> &'static str {
        super::PRICE
    }

    fn best_options(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        let preferred = match self.preferred.preferred_node() {
            Ok(node) => node,
            Err(e) => {
                warn!(error = %e, "failed to compute preferred node");
                return Vec::new();
            }
        };
        let scored: Vec<(f64, &ScaleUpOption)> = options
            .iter()
            .filter_map(|o| self.score(o, node_infos, &preferred).map(|s| (s, o)))
            .collect();
        let Some(best) = scored.iter().map(|(s, _)| *s).min_by(f64::total_cmp) else {
            return Vec::new();
        };
        scored
            .into_iter()
            .filter(|(s, _)| (s - best).abs() < 1e-9)
            .map(|(_, o)| o.clone())
            .collect()
    }
}
