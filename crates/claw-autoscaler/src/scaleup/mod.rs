//! Scale-up orchestration.
//!
//! For every node group that may grow, the pending pods are checked against
//! the group's template and binpacked onto template copies. The resulting
//! options go through the expander, are capped by the cluster-wide node
//! count and resource ceilings, optionally split across similar groups, and
//! finally applied through the cloud provider.

mod balancing;
mod limits;
mod templates;

pub use balancing::{
    balance_scale_up_between_groups, NodeInfoComparator, MAX_ALLOCATABLE_DIFFERENCE_RATIO,
    MAX_CAPACITY_MEMORY_DIFFERENCE_RATIO, MAX_FREE_DIFFERENCE_RATIO,
};
pub use limits::{node_resources, ResourceManager, ResourceMap, ResourcesLeft};
pub use templates::{inject_upcoming_nodes, sanitize_node_info, template_node_infos};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::cloudprovider::{CloudProvider, NodeGroup};
use crate::clusterstate::{ClusterStateRegistry, FAILURE_CLOUD_PROVIDER};
use crate::config::AutoscalingOptions;
use crate::error::{AutoscalerError, Result};
use crate::estimator::{BinpackingEstimator, EstimationLimiter};
use crate::events::{
    Event, EventObject, EventRecorder, REASON_FAILED_TO_SCALE_UP_GROUP, REASON_SCALED_UP_GROUP,
};
use crate::expander::{NodeInfos, ScaleUpOption, Strategy};
use crate::metrics::AutoscalerMetrics;
use crate::scheduler::Scheduler;
use crate::snapshot::ClusterSnapshot;
use crate::status::{NoScaleUpInfo, ScaleUpInfo, ScaleUpResult, ScaleUpStatus, SkipReason};
use crate::types::{Node, NodeGroupId, NodeInfo, Pod, RESOURCE_CPU, RESOURCE_MEMORY};

/// Everything one scale-up attempt reads or updates.
#[derive(Debug)]
pub struct ScaleUpContext<'a> {
    /// Cloud provider.
    pub provider: &'a dyn CloudProvider,
    /// Cluster-state registry; records resizes and failures.
    pub cluster_state: &'a mut ClusterStateRegistry,
    /// Current snapshot, including upcoming nodes and already placed pods.
    pub snapshot: &'a dyn ClusterSnapshot,
    /// Options.
    pub options: &'a AutoscalingOptions,
    /// Template per node group.
    pub templates: &'a NodeInfos,
    /// Registered nodes.
    pub nodes: &'a [Node],
    /// Iteration time.
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Candidate {
    group: Arc<dyn NodeGroup>,
    target: usize,
    template: NodeInfo,
    atomic: bool,
}

impl Candidate {
    fn headroom(&self) -> usize {
        self.group.max_size().saturating_sub(self.target)
    }
}

/// A resize plan that stopped part way; `applied` steps took effect.
#[derive(Debug)]
struct ExecutionFailure {
    applied: Vec<ScaleUpInfo>,
    group: NodeGroupId,
    error: AutoscalerError,
}

#[derive(Debug)]
struct GroupEvaluation {
    group: NodeGroupId,
    option: Option<ScaleUpOption>,
    fitting: Vec<String>,
    rejected: BTreeMap<String, String>,
    template_error: bool,
}

/// Runs on a blocking worker with its own copy of the snapshot.
fn evaluate_group(
    estimator: &BinpackingEstimator,
    scheduler: &dyn Scheduler,
    mut snapshot: Box<dyn ClusterSnapshot>,
    candidate: &Candidate,
    pods: &[Pod],
    mut limiter: EstimationLimiter,
) -> GroupEvaluation {
    let id = candidate.group.id().clone();
    let template = &candidate.template;
    let mut evaluation = GroupEvaluation {
        group: id.clone(),
        option: None,
        fitting: Vec::new(),
        rejected: BTreeMap::new(),
        template_error: false,
    };

    snapshot.fork();
    if let Err(e) = snapshot.add_node_info(template.clone()) {
        warn!(node_group = %id, error = %e, "failed to simulate template node");
        snapshot.revert();
        evaluation.template_error = true;
        return evaluation;
    }
    let mut fitting = Vec::new();
    for pod in pods {
        match scheduler.check_predicates(&*snapshot, pod, template.name()) {
            Ok(()) => fitting.push(pod.clone()),
            Err(failure) => {
                debug!(node_group = %id, pod = %pod.key(), reason = %failure, "pod does not fit template");
                evaluation.rejected.insert(pod.key(), failure.to_string());
            }
        }
    }
    snapshot.revert();

    evaluation.fitting = fitting.iter().map(Pod::key).collect();
    if fitting.is_empty() {
        return evaluation;
    }
    let estimate = estimator.estimate(
        &fitting,
        template,
        candidate.headroom(),
        &mut *snapshot,
        &mut limiter,
    );
    if estimate.node_count == 0 || estimate.scheduled_pods.is_empty() {
        return evaluation;
    }
    let node_count = if candidate.atomic {
        candidate.headroom()
    } else {
        estimate.node_count
    };
    evaluation.option = Some(ScaleUpOption::new(id, node_count, estimate.scheduled_pods));
    evaluation
}

fn skip_metric_reason(resource: &str) -> String {
    match resource {
        RESOURCE_CPU => "cpu_limit".to_string(),
        RESOURCE_MEMORY => "memory_limit".to_string(),
        other => format!("{other}_limit"),
    }
}

/// Pods that no evaluated group could take, with every group's reason.
fn remaining_pods(
    pods: &[Pod],
    evaluations: &[GroupEvaluation],
    skipped: &BTreeMap<NodeGroupId, SkipReason>,
) -> Vec<NoScaleUpInfo> {
    let fitting: HashSet<&str> = evaluations
        .iter()
        .flat_map(|e| e.fitting.iter().map(String::as_str))
        .collect();
    pods.iter()
        .filter(|p| !fitting.contains(p.key().as_str()))
        .map(|pod| {
            let key = pod.key();
            let mut info = NoScaleUpInfo::new(pod.clone());
            for evaluation in evaluations {
                if let Some(reason) = evaluation.rejected.get(&key) {
                    info.rejected
                        .insert(evaluation.group.clone(), vec![reason.clone()]);
                }
            }
            for (group, reason) in skipped {
                info.skipped.insert(group.clone(), vec![reason.to_string()]);
            }
            info
        })
        .collect()
}

/// Pods some group could take but that the chosen option does not cover.
fn awaiting_evaluation(pods: &[Pod], evaluations: &[GroupEvaluation], chosen: &[Pod]) -> Vec<Pod> {
    let fitting: HashSet<&str> = evaluations
        .iter()
        .flat_map(|e| e.fitting.iter().map(String::as_str))
        .collect();
    let chosen: HashSet<String> = chosen.iter().map(Pod::key).collect();
    pods.iter()
        .filter(|p| {
            let key = p.key();
            fitting.contains(key.as_str()) && !chosen.contains(&key)
        })
        .cloned()
        .collect()
}

fn is_atomic(group: &dyn NodeGroup, cluster_state: &ClusterStateRegistry) -> bool {
    group.capabilities().atomic_resize
        || cluster_state
            .node_group_options(group.id())
            .zero_or_max_node_scaling
}

/// Decides and executes scale-ups.
#[derive(Debug)]
pub struct ScaleUpOrchestrator {
    estimator: BinpackingEstimator,
    scheduler: Arc<dyn Scheduler>,
    strategy: Box<dyn Strategy>,
    comparator: NodeInfoComparator,
    events: Arc<dyn EventRecorder>,
    metrics: AutoscalerMetrics,
}

impl ScaleUpOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        strategy: Box<dyn Strategy>,
        options: &AutoscalingOptions,
        events: Arc<dyn EventRecorder>,
        metrics: AutoscalerMetrics,
    ) -> Self {
        Self {
            estimator: BinpackingEstimator::new(Arc::clone(&scheduler)),
            scheduler,
            strategy,
            comparator: NodeInfoComparator::from_options(&options.scale_up),
            events,
            metrics,
        }
    }

    /// Why a group may not grow right now, if it may not.
    fn readiness_skip(ctx: &ScaleUpContext<'_>, group: &dyn NodeGroup) -> Option<SkipReason> {
        if !group.exist() {
            return Some(SkipReason::NotExist);
        }
        if ctx
            .cluster_state
            .is_node_group_safe_to_scale_up(group.id(), ctx.now)
        {
            return None;
        }
        if ctx.cluster_state.is_node_group_healthy(group.id()) {
            warn!(node_group = %group.id(), "node group not ready for scale-up: backoff");
            Some(SkipReason::Backoff)
        } else {
            warn!(node_group = %group.id(), "node group not ready for scale-up: unhealthy");
            Some(SkipReason::NotReady)
        }
    }

    fn resource_skip(&self, left: &ResourcesLeft, manager: &ResourceManager, candidate: &Candidate) -> Option<SkipReason> {
        let delta = manager.delta_for_node(&candidate.template);
        let exceeded = left.exceeded(&delta);
        if !exceeded.is_empty() {
            debug!(node_group = %candidate.group.id(), ?exceeded, "maximal resource limit exceeded");
            for resource in &exceeded {
                self.metrics
                    .register_skipped_scale_event("up", &skip_metric_reason(resource));
            }
            return Some(SkipReason::MaxResourceLimitReached(exceeded));
        }
        if candidate.atomic {
            let needed = candidate.headroom();
            if left.max_nodes(&delta, needed) < needed {
                return Some(SkipReason::AtomicScaleUpImpossible);
            }
        }
        None
    }

    /// Current node count as seen by the `max_nodes_total` cap.
    fn current_node_count(ctx: &ScaleUpContext<'_>) -> usize {
        ctx.nodes.len() + ctx.cluster_state.upcoming_nodes().values().sum::<usize>()
    }

    /// Caps a resize to the cluster-wide node limit.
    fn capped_node_count(&self, ctx: &ScaleUpContext<'_>, wanted: usize, current: usize) -> usize {
        let max_total = ctx.options.max_nodes_total;
        if max_total == 0 || wanted + current <= max_total {
            return wanted;
        }
        info!(max_nodes_total = max_total, "capping scale-up to max cluster size");
        self.metrics
            .register_skipped_scale_event("up", "max_nodes_total");
        max_total.saturating_sub(current)
    }

    /// Attempts a scale-up that helps `pods`.
    ///
    /// Provider resize failures are reported in the status with result
    /// `Error`; they back the group off but do not fail the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource totals cannot be computed or a
    /// binpacking worker fails.
    pub async fn scale_up(&self, ctx: &mut ScaleUpContext<'_>, pods: Vec<Pod>) -> Result<ScaleUpStatus> {
        if pods.is_empty() {
            debug!("no unschedulable pods");
            return Ok(ScaleUpStatus::with_result(ScaleUpResult::NotNeeded));
        }
        for pod in pods.iter().take(20) {
            debug!(pod = %pod.key(), "pod is unschedulable");
        }

        let manager = ResourceManager::from_provider(ctx.provider, ctx.options)?;
        let totals = manager.scale_up_totals(ctx.provider, ctx.templates, ctx.nodes)?;
        let left = manager.left_for_scale_up(&totals);

        let mut skipped: BTreeMap<NodeGroupId, SkipReason> = BTreeMap::new();
        let mut candidates = Vec::new();
        let mut groups: BTreeMap<NodeGroupId, Arc<dyn NodeGroup>> = BTreeMap::new();
        let mut all_groups = ctx.provider.node_groups();
        all_groups.sort_by(|a, b| a.id().cmp(b.id()));
        for group in all_groups {
            let id = group.id().clone();
            groups.insert(id.clone(), Arc::clone(&group));
            if let Some(reason) = Self::readiness_skip(ctx, &*group) {
                skipped.insert(id, reason);
                continue;
            }
            let target = match group.target_size() {
                Ok(target) => target,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "failed to read target size");
                    skipped.insert(id, SkipReason::NotReady);
                    continue;
                }
            };
            if target >= group.max_size() {
                debug!(node_group = %id, "max size reached");
                skipped.insert(id, SkipReason::MaxLimitReached);
                continue;
            }
            let Some(template) = ctx.templates.get(&id) else {
                skipped.insert(id, SkipReason::MissingTemplate);
                continue;
            };
            let candidate = Candidate {
                atomic: is_atomic(&*group, ctx.cluster_state),
                group,
                target,
                template: template.clone(),
            };
            if let Some(reason) = self.resource_skip(&left, &manager, &candidate) {
                skipped.insert(id, reason);
                continue;
            }
            candidates.push(candidate);
        }

        let evaluations = self.evaluate(ctx, &candidates, &pods).await?;
        let mut options = Vec::new();
        for evaluation in &evaluations {
            match &evaluation.option {
                Some(option) => options.push(option.clone()),
                None if evaluation.template_error => {
                    skipped.insert(evaluation.group.clone(), SkipReason::MissingTemplate);
                }
                None if !evaluation.fitting.is_empty() => {
                    skipped.insert(evaluation.group.clone(), SkipReason::NotFit);
                }
                None => debug!(node_group = %evaluation.group, "no pod fits the template"),
            }
        }

        if options.is_empty() {
            info!("no expansion options");
            return Ok(ScaleUpStatus {
                result: ScaleUpResult::NoOptionsAvailable,
                pods_remain_unschedulable: remaining_pods(&pods, &evaluations, &skipped),
                ..ScaleUpStatus::default()
            });
        }

        let Some(mut best) = self.strategy.best_option(&options, ctx.templates) else {
            return Ok(ScaleUpStatus {
                result: ScaleUpResult::NoOptionsAvailable,
                pods_remain_unschedulable: remaining_pods(&pods, &evaluations, &skipped),
                ..ScaleUpStatus::default()
            });
        };
        info!(node_group = %best.group, nodes = best.node_count, pods = best.pods.len(), "best option to resize");

        let Some(candidate) = candidates.iter().find(|c| *c.group.id() == best.group) else {
            return Err(AutoscalerError::internal(format!(
                "expander chose unknown node group {}",
                best.group
            )));
        };

        let wanted = best.node_count;
        let mut new_nodes = self.capped_node_count(ctx, wanted, Self::current_node_count(ctx));
        let delta = manager.delta_for_node(&candidate.template);
        new_nodes = left.max_nodes(&delta, new_nodes);
        if new_nodes == 0 || (candidate.atomic && new_nodes < wanted) {
            let reason = if new_nodes == 0 {
                SkipReason::MaxNodesTotalReached
            } else {
                SkipReason::AtomicScaleUpImpossible
            };
            info!(node_group = %best.group, %reason, "chosen option cannot be applied");
            skipped.insert(best.group.clone(), reason.clone());
            let mut remaining = remaining_pods(&pods, &evaluations, &skipped);
            let mut covered: HashSet<String> = remaining.iter().map(|r| r.pod.key()).collect();
            for pod in &pods {
                if covered.insert(pod.key()) {
                    let mut info = NoScaleUpInfo::new(pod.clone());
                    info.skipped.insert(best.group.clone(), vec![reason.to_string()]);
                    remaining.push(info);
                }
            }
            return Ok(ScaleUpStatus {
                result: ScaleUpResult::NoOptionsAvailable,
                pods_remain_unschedulable: remaining,
                ..ScaleUpStatus::default()
            });
        }

        let mut targets = vec![ScaleUpInfo {
            group: best.group.clone(),
            current_size: candidate.target,
            new_size: candidate.target,
            max_size: candidate.group.max_size(),
        }];
        if ctx.options.scale_up.balance_similar_node_groups && !candidate.atomic {
            best.similar_groups = self.similar_groups(ctx, &best, &options, &candidates);
            for id in &best.similar_groups {
                if let Some(similar) = candidates.iter().find(|c| c.group.id() == id) {
                    targets.push(ScaleUpInfo {
                        group: id.clone(),
                        current_size: similar.target,
                        new_size: similar.target,
                        max_size: similar.group.max_size(),
                    });
                }
            }
            if targets.len() > 1 {
                let names: Vec<String> = targets.iter().map(|t| t.group.to_string()).collect();
                info!(groups = %names.join(", "), "splitting scale-up between similar node groups");
            }
        }

        let plan = balance_scale_up_between_groups(&targets, new_nodes)?;
        info!(plan = ?plan.iter().map(ToString::to_string).collect::<Vec<_>>(), "final scale-up plan");
        let awaiting = awaiting_evaluation(&pods, &evaluations, &best.pods);
        let remaining = remaining_pods(&pods, &evaluations, &skipped);
        match self.execute_scale_ups(ctx, &groups, &plan) {
            Ok(()) => Ok(ScaleUpStatus {
                result: ScaleUpResult::Successful,
                scale_up_infos: plan,
                pods_triggered_scale_up: best.pods,
                pods_remain_unschedulable: remaining,
                pods_awaiting_evaluation: awaiting,
                ..ScaleUpStatus::default()
            }),
            Err(failure) => Ok(ScaleUpStatus {
                result: ScaleUpResult::Error,
                error: Some(failure.error.to_string()),
                scale_up_infos: failure.applied,
                failed_resize_groups: vec![failure.group],
                pods_triggered_scale_up: best.pods,
                ..ScaleUpStatus::default()
            }),
        }
    }

    /// Similar groups that can take every pod of the chosen option.
    fn similar_groups(
        &self,
        ctx: &ScaleUpContext<'_>,
        best: &ScaleUpOption,
        options: &[ScaleUpOption],
        candidates: &[Candidate],
    ) -> Vec<NodeGroupId> {
        let wanted: HashSet<String> = best.pods.iter().map(Pod::key).collect();
        let eligible = options
            .iter()
            .filter(|o| {
                let keys: HashSet<String> = o.pods.iter().map(Pod::key).collect();
                wanted.is_subset(&keys)
            })
            .filter(|o| {
                candidates
                    .iter()
                    .any(|c| *c.group.id() == o.group && !c.atomic)
            })
            .filter(|o| ctx.cluster_state.is_node_group_safe_to_scale_up(&o.group, ctx.now))
            .map(|o| o.group.clone());
        self.comparator.find_similar(&best.group, ctx.templates, eligible)
    }

    async fn evaluate(
        &self,
        ctx: &ScaleUpContext<'_>,
        candidates: &[Candidate],
        pods: &[Pod],
    ) -> Result<Vec<GroupEvaluation>> {
        let scale_up = &ctx.options.scale_up;
        let global_deadline =
            (!scale_up.max_binpacking_time.is_zero()).then(|| Instant::now() + scale_up.max_binpacking_time);
        let jobs = candidates.iter().map(|candidate| {
            let estimator = self.estimator.clone();
            let scheduler = Arc::clone(&self.scheduler);
            let snapshot = ctx.snapshot.boxed_clone();
            let candidate = candidate.clone();
            let pods = pods.to_vec();
            let limiter = EstimationLimiter::new(
                scale_up.max_nodes_per_scaleup,
                scale_up.max_node_group_binpacking_duration,
                global_deadline,
            );
            tokio::task::spawn_blocking(move || {
                evaluate_group(&estimator, &*scheduler, snapshot, &candidate, &pods, limiter)
            })
        });
        let results: Vec<_> = futures::stream::iter(jobs)
            .buffer_unordered(scale_up.binpacking_parallelism.max(1))
            .collect()
            .await;
        let mut evaluations = Vec::with_capacity(results.len());
        for result in results {
            let evaluation = result
                .map_err(|e| AutoscalerError::internal(format!("binpacking worker failed: {e}")))?;
            evaluations.push(evaluation);
        }
        evaluations.sort_by(|a, b| a.group.cmp(&b.group));
        Ok(evaluations)
    }

    /// Raises every group below its minimum size up to it, within the
    /// resource ceilings and the cluster-wide node cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource totals cannot be computed.
    pub fn scale_up_to_node_group_min_size(&self, ctx: &mut ScaleUpContext<'_>) -> Result<ScaleUpStatus> {
        let manager = ResourceManager::from_provider(ctx.provider, ctx.options)?;
        let totals = manager.scale_up_totals(ctx.provider, ctx.templates, ctx.nodes)?;
        let mut left = manager.left_for_scale_up(&totals);
        let mut current = Self::current_node_count(ctx);

        let mut plan = Vec::new();
        let mut groups: BTreeMap<NodeGroupId, Arc<dyn NodeGroup>> = BTreeMap::new();
        let mut all_groups = ctx.provider.node_groups();
        all_groups.sort_by(|a, b| a.id().cmp(b.id()));
        for group in all_groups {
            let id = group.id().clone();
            if !group.exist() {
                continue;
            }
            let Ok(target) = group.target_size() else {
                warn!(node_group = %id, "failed to read target size");
                continue;
            };
            if target >= group.min_size() {
                continue;
            }
            if let Some(reason) = Self::readiness_skip(ctx, &*group) {
                warn!(node_group = %id, %reason, "cannot scale up to min size");
                continue;
            }
            let Some(template) = ctx.templates.get(&id) else {
                warn!(node_group = %id, "no template, cannot scale up to min size");
                continue;
            };
            let delta = manager.delta_for_node(template);
            let exceeded = left.exceeded(&delta);
            if !exceeded.is_empty() {
                warn!(node_group = %id, ?exceeded, "resource limits prevent scale-up to min size");
                continue;
            }
            let wanted = group.min_size() - target;
            let count = left.max_nodes(&delta, wanted);
            let count = self.capped_node_count(ctx, count, current);
            if count == 0 {
                continue;
            }
            left.consume(&delta, count);
            current += count;
            plan.push(ScaleUpInfo {
                group: id.clone(),
                current_size: target,
                new_size: target + count,
                max_size: group.max_size(),
            });
            groups.insert(id, group);
        }

        if plan.is_empty() {
            debug!("scale-up to min size not needed");
            return Ok(ScaleUpStatus::with_result(ScaleUpResult::NotNeeded));
        }
        info!(plan = ?plan.iter().map(ToString::to_string).collect::<Vec<_>>(), "scale-up to min size plan");
        match self.execute_scale_ups(ctx, &groups, &plan) {
            Ok(()) => Ok(ScaleUpStatus {
                result: ScaleUpResult::Successful,
                scale_up_infos: plan,
                ..ScaleUpStatus::default()
            }),
            Err(failure) => Ok(ScaleUpStatus {
                result: ScaleUpResult::Error,
                error: Some(failure.error.to_string()),
                scale_up_infos: failure.applied,
                failed_resize_groups: vec![failure.group],
                ..ScaleUpStatus::default()
            }),
        }
    }

    fn execute_scale_ups(
        &self,
        ctx: &mut ScaleUpContext<'_>,
        groups: &BTreeMap<NodeGroupId, Arc<dyn NodeGroup>>,
        plan: &[ScaleUpInfo],
    ) -> std::result::Result<(), ExecutionFailure> {
        let mut applied = Vec::new();
        for step in plan {
            let increase = step.new_size.saturating_sub(step.current_size);
            if increase == 0 {
                continue;
            }
            let Some(group) = groups.get(&step.group) else {
                let error = AutoscalerError::NodeGroupNotFound {
                    id: step.group.to_string(),
                };
                return Err(ExecutionFailure {
                    applied,
                    group: step.group.clone(),
                    error,
                });
            };
            info!(node_group = %step.group, new_size = step.new_size, "scale-up: setting group size");
            if let Err(e) = group.increase_size(increase) {
                warn!(node_group = %step.group, error = %e, "scale-up failed");
                self.events.record(Event::warning(
                    EventObject::NodeGroup(step.group.clone()),
                    REASON_FAILED_TO_SCALE_UP_GROUP,
                    format!("Scale-up failed for group {}: {e}", step.group),
                ));
                self.metrics.register_error(e.kind());
                ctx.cluster_state.register_failed_scale_up(
                    &step.group,
                    FAILURE_CLOUD_PROVIDER,
                    &e.to_string(),
                    ctx.now,
                );
                return Err(ExecutionFailure {
                    applied,
                    group: step.group.clone(),
                    error: e,
                });
            }
            ctx.cluster_state
                .register_scale_up(&step.group, increase, ctx.now);
            self.metrics.register_scale_up(increase);
            self.events.record(Event::normal(
                EventObject::NodeGroup(step.group.clone()),
                REASON_SCALED_UP_GROUP,
                format!(
                    "Scale-up: group {} size set to {} instead of {} (max: {})",
                    step.group, step.new_size, step.current_size, step.max_size
                ),
            ));
            applied.push(step.clone());
        }
        Ok(())
    }
}
