use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use super::{Filter, NodeInfos, ScaleUpOption};
use crate::error::{AutoscalerError, Result};
use crate::events::{Event, EventObject, EventRecorder, REASON_PRIORITY_NOT_MATCHED};
use crate::types::NodeGroupId;

/// Keeps the options whose group matches the highest-priority bucket.
///
/// Patterns are unanchored regexes over the group id. A group matching
/// several buckets takes the highest. If no option matches any bucket, every
/// option is kept. Unmatched groups are reported once each with a warning
/// event.
#[derive(Debug)]
pub struct PriorityFilter {
    buckets: Vec<(i32, Vec<Regex>)>,
    events: Arc<dyn EventRecorder>,
    reported: Mutex<HashSet<NodeGroupId>>,
}

impl PriorityFilter {
    /// Compiles the priority buckets.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a pattern does not compile.
    pub fn new(priorities: &BTreeMap<i32, Vec<String>>, events: Arc<dyn EventRecorder>) -> Result<Self> {
        let mut buckets = Vec::with_capacity(priorities.len());
        // Highest priority first.
        for (priority, patterns) in priorities.iter().rev() {
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        AutoscalerError::config(format!("invalid priority regex {p:?}: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            buckets.push((*priority, compiled));
        }
        Ok(Self {
            buckets,
            events,
            reported: Mutex::new(HashSet::new()),
        })
    }

    fn priority_of(&self, group: &NodeGroupId) -> Option<i32> {
        self.buckets
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(group.as_str())))
            .map(|(priority, _)| *priority)
    }

    fn report_unmatched(&self, group: &NodeGroupId) {
        if !self.reported.lock().insert(group.clone()) {
            return;
        }
        warn!(node_group = %group, "node group matches no priority bucket");
        self.events.record(Event::warning(
            EventObject::NodeGroup(group.clone()),
            REASON_PRIORITY_NOT_MATCHED,
            format!("node group {group} does not match any priority expander pattern"),
        ));
    }
}

impl Filter for PriorityFilter {
    fn name(&self) -> &'static str {
        super::PRIORITY
    }

    fn best_options(&self, options: &[ScaleUpOption], _node_infos: &NodeInfos) -> Vec<ScaleUpOption> {
        let mut best: Option<i32> = None;
        let mut kept = Vec::new();
        for option in options {
            let Some(priority) = self.priority_of(&option.group) else {
                self.report_unmatched(&option.group);
                continue;
            };
            debug!(node_group = %option.group, priority, "priority matched");
            match best {
                Some(b) if priority < b => {}
                Some(b) if priority == b => kept.push(option.clone()),
                _ => {
                    best = Some(priority);
                    kept.clear();
                    kept.push(option.clone());
                }
            }
        }
        if kept.is_empty() {
            return options.to_vec();
        }
        kept
    }
}
