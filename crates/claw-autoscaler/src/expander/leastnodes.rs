use super::{Filter, NodeInfos, ScaleUpOption};

/// Keeps the options that add the fewest nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastNodesFilter;

impl Filter for LeastNodesFilter {
    fn name(&self) -> &'static str {
        super::LEAST_NODES
    }

    fn best_options(&self, options: &[ScaleUpOption], _node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        let Some(least) = options.iter().map(|o| o.node_count).min() else {
            return Vec::new();
        };
        options
            .iter()
            .filter(|o| o.node_count == least)
            .cloned()
            .collect()
    }
}
