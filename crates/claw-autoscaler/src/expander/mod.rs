//! Expanders choose one scale-up option among several viable ones.
//!
//! An expander is a chain: a list of [`Filter`]s, each narrowing the option
//! set, followed by a final [`Strategy`]. The chain stops as soon as a filter
//! leaves a single option. Expanders are selected by name at start-up
//! through [`build_strategy`].

mod leastnodes;
mod leastwaste;
mod mostpods;
mod price;
mod priority;
mod random;

pub use leastnodes::LeastNodesFilter;
pub use leastwaste::LeastWasteFilter;
pub use mostpods::MostPodsFilter;
pub use price::{PreferredNodeProvider, PriceFilter, SimplePreferredNodeProvider};
pub use priority::PriorityFilter;
pub use random::RandomStrategy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cloudprovider::PricingModel;
use crate::config::AutoscalingOptions;
use crate::error::{AutoscalerError, Result};
use crate::events::EventRecorder;
use crate::kube::ClusterSource;
use crate::types::{NodeGroupId, NodeInfo, Pod};

/// Expander name: uniform random choice.
pub const RANDOM: &str = "random";
/// Expander name: most pods helped.
pub const MOST_PODS: &str = "most-pods";
/// Expander name: least idle capacity.
pub const LEAST_WASTE: &str = "least-waste";
/// Expander name: fewest new nodes.
pub const LEAST_NODES: &str = "least-nodes";
/// Expander name: cheapest per pod.
pub const PRICE: &str = "price";
/// Expander name: configured group priorities.
pub const PRIORITY: &str = "priority";

/// Templates of the node groups under consideration.
pub type NodeInfos = BTreeMap<NodeGroupId, NodeInfo>;

/// A possible scale-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleUpOption {
    /// Group to grow.
    pub group: NodeGroupId,
    /// Nodes to add.
    pub node_count: usize,
    /// Pods that would become schedulable.
    pub pods: Vec<Pod>,
    /// Groups similar enough to share the increase.
    pub similar_groups: Vec<NodeGroupId>,
}

impl ScaleUpOption {
    /// Creates an option.
    #[must_use]
    pub const fn new(group: NodeGroupId, node_count: usize, pods: Vec<Pod>) -> Self {
        Self {
            group,
            node_count,
            pods,
            similar_groups: Vec::new(),
        }
    }
}

impl fmt::Display for ScaleUpOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} node(s) for {} pod(s)",
            self.group,
            self.node_count,
            self.pods.len()
        )
    }
}

/// Narrows the option set.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Returns the best options. An empty input yields an empty output.
    fn best_options(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Vec<ScaleUpOption>;
}

/// Picks a single option.
pub trait Strategy: Send + Sync + fmt::Debug {
    /// Returns the chosen option, or `None` for an empty input.
    fn best_option(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Option<ScaleUpOption>;
}

/// Filters applied in order, then a final strategy.
#[derive(Debug)]
pub struct ChainStrategy {
    filters: Vec<Box<dyn Filter>>,
    fallback: Box<dyn Strategy>,
}

impl ChainStrategy {
    /// Creates a chain.
    #[must_use]
    pub fn new(filters: Vec<Box<dyn Filter>>, fallback: Box<dyn Strategy>) -> Self {
        Self { filters, fallback }
    }

    /// Names of the filters, in order.
    #[must_use]
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

impl Strategy for ChainStrategy {
    fn best_option(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Option<ScaleUpOption> {
        let mut remaining = options.to_vec();
        for filter in &self.filters {
            remaining = filter.best_options(&remaining, node_infos);
            debug!(filter = filter.name(), remaining = remaining.len(), "expander filter applied");
            if remaining.len() == 1 {
                return remaining.pop();
            }
            if remaining.is_empty() {
                return None;
            }
        }
        self.fallback.best_option(&remaining, node_infos)
    }
}

/// Collaborators some expanders need.
#[derive(Debug, Clone)]
pub struct ExpanderContext {
    /// Pricing model, required by `price`.
    pub pricing: Option<Arc<dyn PricingModel>>,
    /// Node lister, used by `price` to size the preferred node.
    pub cluster: Arc<dyn ClusterSource>,
    /// Event sink, used by `priority`.
    pub events: Arc<dyn EventRecorder>,
}

/// Builds the expander chain named by `options.scale_up.expander_names`.
///
/// Every name except `random` becomes a filter, in order; random choice is
/// always the final strategy.
///
/// # Errors
///
/// Returns a configuration error for unknown names, a `price` expander
/// without a pricing model, or invalid priority patterns.
pub fn build_strategy(options: &AutoscalingOptions, ctx: &ExpanderContext) -> Result<ChainStrategy> {
    let mut filters: Vec<Box<dyn Filter>> = Vec::new();
    for name in &options.scale_up.expander_names {
        let filter: Box<dyn Filter> = match name.as_str() {
            RANDOM => continue,
            MOST_PODS => Box::new(MostPodsFilter),
            LEAST_WASTE => Box::new(LeastWasteFilter),
            LEAST_NODES => Box::new(LeastNodesFilter),
            PRICE => {
                let pricing = ctx.pricing.clone().ok_or_else(|| {
                    AutoscalerError::config("price expander requires a pricing model")
                })?;
                let preferred = SimplePreferredNodeProvider::new(Arc::clone(&ctx.cluster));
                Box::new(PriceFilter::new(pricing, Box::new(preferred)))
            }
            PRIORITY => Box::new(PriorityFilter::new(
                &options.scale_up.priorities,
                Arc::clone(&ctx.events),
            )?),
            other => {
                return Err(AutoscalerError::config(format!("unknown expander: {other}")));
            }
        };
        filters.push(filter);
    }
    Ok(ChainStrategy::new(filters, Box::new(RandomStrategy)))
}


#[cfg(test)]
mod tests {
    use super::test_util::{infos, option};
    use super::*;
    use crate::cloudprovider::StaticPricingModel;
    use crate::events::InMemoryEventRecorder;
    use crate::kube::InMemoryCluster;

    fn ctx(pricing: bool) -> ExpanderContext {
        ExpanderContext {
            pricing: pricing.then(|| Arc::new(StaticPricingModel::default()) as Arc<dyn PricingModel>),
            cluster: Arc::new(InMemoryCluster::new()),
            events: Arc::new(InMemoryEventRecorder::new()),
        }
    }

    #[test]
    fn chain_stops_when_one_option_left() {
        let chain = ChainStrategy::new(
            vec![Box::new(MostPodsFilter), Box::new(LeastNodesFilter)],
            Box::new(RandomStrategy),
        );
        let options = vec![option("a", 1, 3), option("b", 1, 5), option("c", 2, 5)];
        let best = chain.best_option(&options, &NodeInfos::new()).expect("option");
        assert_eq!(best.group.as_str(), "b");
    }

    #[test]
    fn chain_on_empty_input() {
        let chain = ChainStrategy::new(vec![Box::new(MostPodsFilter)], Box::new(RandomStrategy));
        assert!(chain.best_option(&[], &NodeInfos::new()).is_none());
    }

    #[test]
    fn ties_fall_through_to_random() {
        let chain = ChainStrategy::new(vec![Box::new(LeastNodesFilter)], Box::new(RandomStrategy));
        let options = vec![option("a", 1, 1), option("b", 1, 1), option("c", 3, 1)];
        let infos = infos(&[("a", 1000, 1000), ("b", 1000, 1000), ("c", 1000, 1000)]);
        for _ in 0..20 {
            let best = chain.best_option(&options, &infos).expect("option");
            assert_ne!(best.group.as_str(), "c");
        }
    }

    #[test]
    fn build_from_names() {
        let mut options = AutoscalingOptions::default();
        options.scale_up.expander_names = vec![
            PRIORITY.to_string(),
            LEAST_WASTE.to_string(),
            RANDOM.to_string(),
        ];
        options
            .scale_up
            .priorities
            .insert(10, vec![".*".to_string()]);
        let chain = build_strategy(&options, &ctx(false)).expect("chain");
        assert_eq!(chain.filter_names(), vec![PRIORITY, LEAST_WASTE]);
    }

    #[test]
    fn price_requires_pricing_model() {
        let mut options = AutoscalingOptions::default();
        options.scale_up.expander_names = vec![PRICE.to_string()];
        let err = build_strategy(&options, &ctx(false)).unwrap_err();
        assert!(err.to_string().contains("pricing model"));
        assert!(build_strategy(&options, &ctx(true)).is_ok());
    }
}
