//! Default pod-list processors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info};

use super::{PodListProcessor, PodLists, ProcessorContext};
use crate::error::Result;
use crate::scheduler::{HintingSimulator, Scheduler};

/// Per-pod annotation lengthening the scale-up delay, in seconds.
pub const ANNOTATION_POD_SCALE_UP_DELAY: &str =
    "cluster-autoscaler.kubernetes.io/pod-scale-up-delay";

/// Drops pods whose priority is below the expendable cutoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOutExpendable;

impl PodListProcessor for FilterOutExpendable {
    fn name(&self) -> &'static str {
        "filter-out-expendable"
    }

    fn process(&mut self, ctx: &mut ProcessorContext<'_>, mut pods: PodLists) -> Result<PodLists> {
        let cutoff = ctx.options.expendable_pods_priority_cutoff;
        pods.unschedulable.retain(|p| {
            let keep = p.priority >= cutoff;
            if !keep {
                debug!(pod = %p.key(), priority = p.priority, "ignoring expendable pod");
            }
            keep
        });
        Ok(pods)
    }
}

/// Treats pods of nodes still being drained as pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentlyDrainedNodes;

impl PodListProcessor for CurrentlyDrainedNodes {
    fn name(&self) -> &'static str {
        "currently-drained-nodes"
    }

    fn process(&mut self, ctx: &mut ProcessorContext<'_>, mut pods: PodLists) -> Result<PodLists> {
        let known: HashSet<String> = pods.unschedulable.iter().map(crate::types::Pod::key).collect();
        for pod in ctx.draining_pods.drain(..) {
            if pod.is_daemonset() || pod.is_mirror() || known.contains(&pod.key()) {
                continue;
            }
            let mut pending = pod.unschedulable();
            pending.nominated_node_name = None;
            pods.unschedulable.push(pending);
        }
        Ok(pods)
    }
}

/// Pending DaemonSet pods never trigger a scale-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOutDaemonSetPods;

impl PodListProcessor for FilterOutDaemonSetPods {
    fn name(&self) -> &'static str {
        "filter-out-daemonset-pods"
    }

    fn process(&mut self, _ctx: &mut ProcessorContext<'_>, mut pods: PodLists) -> Result<PodLists> {
        pods.unschedulable.retain(|p| !p.is_daemonset());
        Ok(pods)
    }
}

/// Places pending pods that fit existing or upcoming nodes.
///
/// Placed pods move to the scheduled list and stay in the snapshot, so later
/// stages see the capacity as taken.
#[derive(Debug, Clone)]
pub struct FilterOutSchedulable {
    simulator: HintingSimulator,
}

impl FilterOutSchedulable {
    /// Creates the processor.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            simulator: HintingSimulator::new(scheduler),
        }
    }
}

impl PodListProcessor for FilterOutSchedulable {
    fn name(&self) -> &'static str {
        "filter-out-schedulable"
    }

    fn process(&mut self, ctx: &mut ProcessorContext<'_>, pods: PodLists) -> Result<PodLists> {
        let PodLists {
            unschedulable,
            mut scheduled,
        } = pods;
        let live: HashSet<String> = unschedulable.iter().map(crate::types::Pod::key).collect();
        self.simulator.drop_old_hints(&live);

        let mut ordered = unschedulable;
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key().cmp(&b.key())));
        let outcome =
            self.simulator
                .try_schedule_pods(&mut *ctx.snapshot, ordered, &|_| true, false);
        if !outcome.scheduled.is_empty() {
            info!(
                count = outcome.scheduled.len(),
                "pods fit existing or upcoming nodes and are not considered for scale-up"
            );
        }
        scheduled.extend(outcome.scheduled.into_iter().map(|(pod, node)| pod.on_node(node)));
        Ok(PodLists::new(outcome.unschedulable, scheduled))
    }
}

/// Holds back pods younger than the scale-up delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOutYoungPods;

impl FilterOutYoungPods {
    fn delay_for(pod: &crate::types::Pod, global: Duration) -> Duration {
        let annotated = pod
            .annotations
            .get(ANNOTATION_POD_SCALE_UP_DELAY)
            .and_then(|v| v.trim().trim_end_matches('s').parse::<u64>().ok())
            .map(Duration::from_secs);
        match annotated {
            Some(d) if d > global => d,
            _ => global,
        }
    }
}

impl PodListProcessor for FilterOutYoungPods {
    fn name(&self) -> &'static str {
        "filter-out-young-pods"
    }

    fn process(&mut self, ctx: &mut ProcessorContext<'_>, pods: PodLists) -> Result<PodLists> {
        let global = ctx.options.scale_up.new_pod_scale_up_delay;
        let now = ctx.now;
        let (old, young): (Vec<_>, Vec<_>) = pods.unschedulable.into_iter().partition(|p| {
            let delay = ChronoDuration::from_std(Self::delay_for(p, global))
                .unwrap_or(ChronoDuration::MAX);
            now - p.created_at >= delay
        });
        if !young.is_empty() {
            debug!(count = young.len(), "pods too young for scale-up");
            if old.is_empty() {
                ctx.scale_down_disabled = true;
            }
        }
        ctx.awaiting_evaluation.extend(young);
        Ok(PodLists::new(old, pods.scheduled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoscalingOptions;
    use crate::scheduler::PredicateChecker;
    use crate::snapshot::{BasicSnapshot, ClusterSnapshot};
    use crate::types::{Node, OwnerKind, Pod, Resources, MIB};
    use chrono::{DateTime, Utc};
    use test_case::test_case;

    fn pod(name: &str, cpu: u64) -> Pod {
        Pod::new("default", name, Resources::new(cpu, 10 * MIB)).unschedulable()
    }

    fn run(
        processor: &mut dyn PodListProcessor,
        snapshot: &mut dyn ClusterSnapshot,
        options: &AutoscalingOptions,
        now: DateTime<Utc>,
        pods: Vec<Pod>,
    ) -> (PodLists, Vec<Pod>, bool) {
        let mut ctx = ProcessorContext::new(snapshot, options, now);
        let out = processor
            .process(&mut ctx, PodLists::new(pods, Vec::new()))
            .expect("process");
        (out, ctx.awaiting_evaluation, ctx.scale_down_disabled)
    }

    #[test]
    fn expendable_pods_dropped() {
        let mut snapshot = BasicSnapshot::new();
        let options = AutoscalingOptions::default();
        let pods = vec![pod("low", 100).with_priority(-20), pod("normal", 100)];
        let (out, _, _) = run(&mut FilterOutExpendable, &mut snapshot, &options, Utc::now(), pods);
        let names: Vec<&str> = out.unschedulable.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["normal"]);
    }

    #[test]
    fn daemonset_pods_dropped() {
        let mut snapshot = BasicSnapshot::new();
        let options = AutoscalingOptions::default();
        let pods = vec![pod("ds", 100).with_owner(OwnerKind::DaemonSet, "fluentd"), pod("web", 100)];
        let (out, _, _) = run(&mut FilterOutDaemonSetPods, &mut snapshot, &options, Utc::now(), pods);
        assert_eq!(out.unschedulable.len(), 1);
        assert_eq!(out.unschedulable[0].name, "web");
    }

    #[test]
    fn drained_node_pods_become_pending() {
        let mut snapshot = BasicSnapshot::new();
        let options = AutoscalingOptions::default();
        let mut ctx = ProcessorContext::new(&mut snapshot, &options, Utc::now());
        ctx.draining_pods = vec![
            Pod::new("default", "moved", Resources::new(100, 0)).on_node("n1"),
            Pod::new("kube-system", "ds", Resources::new(100, 0))
                .with_owner(OwnerKind::DaemonSet, "ds")
                .on_node("n1"),
        ];
        let out = CurrentlyDrainedNodes
            .process(&mut ctx, PodLists::default())
            .expect("process");
        assert_eq!(out.unschedulable.len(), 1);
        assert!(out.unschedulable[0].node_name.is_none());
    }

    #[test]
    fn schedulable_pods_move_to_scheduled_by_priority() {
        let mut snapshot = BasicSnapshot::new();
        snapshot
            .add_node(Node::new("n1", Resources::new(1000, 1000 * MIB).with_pods(110)))
            .expect("node");
        let options = AutoscalingOptions::default();
        let pods = vec![pod("low", 600), pod("high", 600).with_priority(100)];
        let mut processor = FilterOutSchedulable::new(Arc::new(PredicateChecker::new()));
        let (out, _, _) = run(&mut processor, &mut snapshot, &options, Utc::now(), pods);
        assert_eq!(out.scheduled.len(), 1);
        assert_eq!(out.scheduled[0].name, "high");
        assert_eq!(out.scheduled[0].node_name.as_deref(), Some("n1"));
        assert_eq!(out.unschedulable.len(), 1);
        assert_eq!(out.unschedulable[0].name, "low");
        assert_eq!(snapshot.get_node_info("n1").expect("n1").pods().len(), 1);
    }

    #[test_case(0, None, false ; "no delay")]
    #[test_case(60, None, true ; "global delay holds back")]
    #[test_case(0, Some("120"), true ; "annotation lengthens")]
    #[test_case(300, Some("10"), true ; "annotation cannot shorten")]
    fn young_pods(global_secs: u64, annotation: Option<&str>, held: bool) {
        let mut snapshot = BasicSnapshot::new();
        let mut options = AutoscalingOptions::default();
        options.scale_up.new_pod_scale_up_delay = Duration::from_secs(global_secs);
        let now = Utc::now();
        let mut p = pod("p", 100).with_created_at(now - ChronoDuration::seconds(30));
        if let Some(value) = annotation {
            p = p.with_annotation(ANNOTATION_POD_SCALE_UP_DELAY, value);
        }
        let (out, awaiting, sd_disabled) =
            run(&mut FilterOutYoungPods, &mut snapshot, &options, now, vec![p]);
        assert_eq!(out.unschedulable.is_empty(), held);
        assert_eq!(awaiting.len(), usize::from(held));
        assert_eq!(sd_disabled, held);
    }
}
