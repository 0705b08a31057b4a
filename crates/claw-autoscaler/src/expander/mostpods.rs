use super::{Filter, NodeInfos, ScaleUpOption};

/// Keeps the options that help the most pods.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostPodsFilter;

impl Filter for MostPodsFilter {
    fn name(&self) -> &'static str {
        super::MOST_PODS
    }

    fn best_options(&self, options: &[ScaleUpOption], _node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        let Some(most) = options.iter().map(|o| o.pods.len()).max() else {
            return Vec::new();
        };
        options
            .iter()
            .filter(|o| o.pods.len() == most)
            .cloned()
            .collect()
    }
}
