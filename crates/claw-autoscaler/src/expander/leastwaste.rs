use tracing::debug;

use super::{Filter, NodeInfos, ScaleUpOption};
use crate::types::Resources;

/// Keeps the options leaving the least idle CPU and memory on the new nodes.
///
/// Waste is `(available - requested) / available`, summed over CPU and
/// memory. Options without a template are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastWasteFilter;

#[allow(clippy::cast_precision_loss)]
fn wasted(available: u64, requested: u64) -> f64 {
    if available == 0 {
        return 0.0;
    }
    (available as f64 - requested as f64) / available as f64
}

impl LeastWasteFilter {
    fn score(option: &ScaleUpOption, node_infos: &NodeInfos) -> Option<f64> {
        let template = node_infos.get(&option.group)?;
        let count = u64::try_from(option.node_count).unwrap_or(u64::MAX);
        let alloc = &template.node.allocatable;
        let mut requested = Resources::default();
        for pod in &option.pods {
            requested += &pod.requests;
        }
        let cpu = wasted(alloc.cpu_millis.saturating_mul(count), requested.cpu_millis);
        let mem = wasted(alloc.memory_bytes.saturating_mul(count), requested.memory_bytes);
        Some(cpu + mem)
    }
}

impl Filter for LeastWasteFilter {
    fn name(&self) -> &'static str {
        super::LEAST_WASTE
    }

    fn best_options(&self, options: &[ScaleUpOption], node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        let scored: Vec<(f64, &ScaleUpOption)> = options
            .iter()
            .filter_map(|o| Self::score(o, node_infos).map(|s| (s, o)))
            .collect();
        let Some(least) = scored.iter().map(|(s, _)| *s).min_by(f64::total_cmp) else {
            return Vec::new();
        };
        scored
            .into_iter()
            .filter(|(s, o)| {
                debug!(group = %o.group, waste = s, "least-waste score");
                (s - least).abs() < 1e-9
            })
            .map(|(_, o)| o.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::test_util::infos;
    use crate::expander::ScaleUpOption;
    use crate::types::{NodeGroupId, Pod, GIB};

    fn option(group: &str, nodes: usize, cpu: u64, mem: u64) -> ScaleUpOption {
        ScaleUpOption::new(
            NodeGroupId::new(group),
            nodes,
            vec![Pod::new("default", "p", Resources::new(cpu, mem))],
        )
    }

    #[test]
    fn prefers_tighter_fit() {
        let infos = infos(&[("small", 1000, GIB), ("large", 4000, 4 * GIB)]);
        let options = vec![
            option("small", 1, 800, GIB / 2),
            option("large", 1, 800, GIB / 2),
        ];
        let best = LeastWasteFilter.best_options(&options, &infos);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].group.as_str(), "small");
    }

    #[test]
    fn equal_scores_are_kept() {
        let infos = infos(&[("a", 1000, GIB), ("b", 1000, GIB)]);
        let options = vec![option("a", 1, 500, GIB / 2), option("b", 1, 500, GIB / 2)];
        assert_eq!(LeastWasteFilter.best_options(&options, &infos).len(), 2);
    }

    #[test]
    fn missing_template_dropped() {
        let infos = infos(&[("a", 1000, GIB)]);
        let options = vec![option("a", 1, 500, GIB / 2), option("ghost", 1, 999, GIB)];
        let best = LeastWasteFilter.best_options(&options, &infos);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].group.as_str(), "a");
    }
}
