use rand::seq::SliceRandom;

use super::{Filter, NodeInfos, ScaleUpOption, Strategy};

/// Uniform random choice. The baseline and the final fallback of every chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn best_option(&self, options: &[ScaleUpOption], _node_infos: &NodeInfos) -> Option<ScaleUpOption> {
        options.choose(&mut rand::thread_rng()).cloned()
    }
}

impl Filter for RandomStrategy {
    fn name(&self) -> &'static str {
        super::RANDOM
    }

    fn best_options(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        self.best_option(options, node_infos).into_iter().collect()
    }
}
