//! One iteration of the control loop.
//!
//! [`Autoscaler::run_once`] refreshes the provider, rebuilds the snapshot,
//! runs the pod-list processors, attempts a scale-up, updates the unneeded
//! node set, deletes what may go, and publishes the status document.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::cloudprovider::{CloudProvider, InstanceState};
use crate::clusterstate::ClusterStateRegistry;
use crate::config::AutoscalingOptions;
use crate::error::Result;
use crate::events::{Event, EventObject, EventRecorder, REASON_CLUSTER_UNHEALTHY};
use crate::expander::{build_strategy, ExpanderContext, NodeInfos};
use crate::kube::{ClusterSource, KubeClient};
use crate::metrics::{Activity, AutoscalerMetrics, FunctionLabel};
use crate::processors::{
    EventingScaleUpStatusProcessor, PodListPipeline, PodLists, ProcessorContext,
    ScaleUpStatusProcessor,
};
use crate::scaledown::{
    node_group_views, to_chrono, DeletionPlan, DrainabilityRules, NodeDeletionTracker,
    RemovalContext, ScaleDownActuator, ScaleDownPlanner,
};
use crate::scaleup::{
    inject_upcoming_nodes, template_node_infos, ResourceManager, ScaleUpContext,
    ScaleUpOrchestrator,
};
use crate::scheduler::{PredicateChecker, Scheduler};
use crate::snapshot::{ClusterSnapshot, SnapshotKind};
use crate::status::{
    ClusterAutoscalerStatus, ScaleDownResult, ScaleDownStatus, ScaleUpResult, ScaleUpStatus,
};
use crate::types::{Node, Pod, PodDisruptionBudget, Resources, Workload};

/// What one iteration did.
#[derive(Debug, Clone, Default)]
pub struct IterationSummary {
    /// Scale-up stage result.
    pub scale_up: ScaleUpStatus,
    /// Scale-down stage result.
    pub scale_down: ScaleDownStatus,
}

impl IterationSummary {
    /// Returns true if the iteration resized a group or started deletions.
    #[must_use]
    pub fn scaled(&self) -> bool {
        self.scale_up.scaled_up() || self.scale_down.result == ScaleDownResult::NodeDeleteStarted
    }
}

/// The cluster autoscaler.
#[derive(Debug)]
pub struct Autoscaler<K: KubeClient> {
    options: AutoscalingOptions,
    provider: Arc<dyn CloudProvider>,
    source: Arc<dyn ClusterSource>,
    scheduler: Arc<dyn Scheduler>,
    snapshot: Box<dyn ClusterSnapshot>,
    cluster_state: ClusterStateRegistry,
    pipeline: PodListPipeline,
    scale_up: ScaleUpOrchestrator,
    status_processor: Box<dyn ScaleUpStatusProcessor>,
    planner: ScaleDownPlanner,
    actuator: ScaleDownActuator<K>,
    deletions: Arc<NodeDeletionTracker>,
    events: Arc<dyn EventRecorder>,
    metrics: AutoscalerMetrics,
    last_scale_up: Option<DateTime<Utc>>,
    paused: BTreeSet<String>,
    last_status: Option<ClusterAutoscalerStatus>,
}

impl<K: KubeClient> Autoscaler<K> {
    /// Creates an autoscaler with the default predicate checker, pod-list
    /// pipeline and drainability rules.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the options are invalid or the
    /// expander chain cannot be built.
    pub fn new(
        options: AutoscalingOptions,
        provider: Arc<dyn CloudProvider>,
        source: Arc<dyn ClusterSource>,
        kube: Arc<K>,
        events: Arc<dyn EventRecorder>,
        metrics: AutoscalerMetrics,
    ) -> Result<Self> {
        options.validate()?;
        let scheduler: Arc<dyn Scheduler> = Arc::new(PredicateChecker::new());
        let strategy = build_strategy(
            &options,
            &ExpanderContext {
                pricing: provider.pricing(),
                cluster: Arc::clone(&source),
                events: Arc::clone(&events),
            },
        )?;
        let deletions = Arc::new(NodeDeletionTracker::new());
        info!(
            provider = provider.name(),
            expanders = ?strategy.filter_names(),
            "creating cluster autoscaler"
        );
        Ok(Self {
            cluster_state: ClusterStateRegistry::new(
                Arc::clone(&provider),
                &options,
                Arc::clone(&events),
                metrics.clone(),
            ),
            pipeline: PodListPipeline::default_pipeline(Arc::clone(&scheduler)),
            scale_up: ScaleUpOrchestrator::new(
                Arc::clone(&scheduler),
                Box::new(strategy),
                &options,
                Arc::clone(&events),
                metrics.clone(),
            ),
            status_processor: Box::new(EventingScaleUpStatusProcessor::new(Arc::clone(&events))),
            planner: ScaleDownPlanner::new(
                &options,
                Arc::clone(&scheduler),
                DrainabilityRules::default(),
                Arc::clone(&deletions),
            ),
            actuator: ScaleDownActuator::new(
                kube,
                Arc::clone(&provider),
                Arc::clone(&deletions),
                &options.scale_down,
                Arc::clone(&events),
                metrics.clone(),
            ),
            snapshot: SnapshotKind::default().create(),
            scheduler,
            deletions,
            options,
            provider,
            source,
            events,
            metrics,
            last_scale_up: None,
            paused: BTreeSet::new(),
            last_status: None,
        })
    }

    /// Uses a different snapshot implementation.
    #[must_use]
    pub fn with_snapshot_kind(mut self, kind: SnapshotKind) -> Self {
        self.snapshot = kind.create();
        self
    }

    /// Replaces the drainability rules.
    #[must_use]
    pub fn with_drainability_rules(mut self, rules: DrainabilityRules) -> Self {
        self.planner = ScaleDownPlanner::new(
            &self.options,
            Arc::clone(&self.scheduler),
            rules,
            Arc::clone(&self.deletions),
        );
        self
    }

    /// Replaces the pod-list pipeline.
    #[must_use]
    pub fn with_pod_list_pipeline(mut self, pipeline: PodListPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Replaces the scale-up status processor.
    #[must_use]
    pub fn with_status_processor(mut self, processor: Box<dyn ScaleUpStatusProcessor>) -> Self {
        self.status_processor = processor;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn options(&self) -> &AutoscalingOptions {
        &self.options
    }

    /// Observability context.
    #[must_use]
    pub const fn metrics(&self) -> &AutoscalerMetrics {
        &self.metrics
    }

    /// Cluster-state registry.
    #[must_use]
    pub const fn cluster_state(&self) -> &ClusterStateRegistry {
        &self.cluster_state
    }

    /// Scale-down planner.
    #[must_use]
    pub const fn planner(&self) -> &ScaleDownPlanner {
        &self.planner
    }

    /// Deletion tracker.
    #[must_use]
    pub const fn deletion_tracker(&self) -> &Arc<NodeDeletionTracker> {
        &self.deletions
    }

    /// Status document of the last iteration.
    #[must_use]
    pub const fn status(&self) -> Option<&ClusterAutoscalerStatus> {
        self.last_status.as_ref()
    }

    /// Suppresses deletions until every pause reason is resumed.
    pub fn pause_scale_down(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(%reason, "scale-down paused");
        self.paused.insert(reason);
    }

    /// Withdraws one pause reason.
    pub fn resume_scale_down(&mut self, reason: &str) {
        if self.paused.remove(reason) {
            info!(%reason, "scale-down resumed");
        }
    }

    /// Active pause reasons.
    #[must_use]
    pub fn scale_down_pause_reasons(&self) -> Vec<&str> {
        self.paused.iter().map(String::as_str).collect()
    }

    /// Releases provider resources.
    ///
    /// # Errors
    ///
    /// Returns the provider's cleanup error.
    pub fn cleanup(&self) -> Result<()> {
        self.provider.cleanup()
    }

    /// Runs one iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be refreshed, the cluster
    /// cannot be listed, or the snapshot cannot be built. Scaling failures
    /// are reported in the summary instead.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<IterationSummary> {
        let started = Instant::now();
        self.metrics.update_last_time(Activity::Main, now);
        let result = self.iterate(now).await;
        if let Err(e) = &result {
            warn!(error = %e, "autoscaler iteration failed");
            self.metrics.register_error(e.kind());
        }
        self.metrics.update_duration(FunctionLabel::Main, started.elapsed());
        result
    }

    async fn iterate(&mut self, now: DateTime<Utc>) -> Result<IterationSummary> {
        let step = Instant::now();
        self.provider.refresh()?;
        self.metrics
            .update_duration(FunctionLabel::CloudProviderRefresh, step.elapsed());

        let step = Instant::now();
        let nodes = self.source.list_nodes()?;
        let pods = self.source.list_pods()?;
        let pdbs = self.source.list_pdbs()?;
        let workloads = self.source.list_workloads()?;
        self.cluster_state.update(&nodes, now)?;
        let readiness = self.cluster_state.total_readiness().counts();
        self.metrics
            .update_node_counts(readiness.ready, readiness.unready, readiness.not_started);
        self.metrics
            .update_node_groups_count(self.provider.node_groups().len());

        let scheduled: Vec<Pod> = pods.iter().filter(|p| p.node_name.is_some()).cloned().collect();
        self.snapshot.clear();
        self.snapshot.set_cluster_state(nodes.clone(), scheduled.clone())?;
        let templates =
            template_node_infos(&*self.provider, &*self.snapshot, &self.cluster_state, &nodes);
        self.metrics
            .update_duration(FunctionLabel::UpdateState, step.elapsed());

        let mut summary = IterationSummary::default();
        if self.fix_node_group_sizes(now) {
            info!("node group sizes fixed, skipping the rest of the iteration");
            self.publish(&summary, now);
            return Ok(summary);
        }
        if !self.cluster_state.is_cluster_healthy() {
            warn!(
                unready = readiness.unready,
                ready = readiness.ready,
                "cluster is not ready for autoscaling"
            );
            self.events.record(Event::warning(
                EventObject::Autoscaler,
                REASON_CLUSTER_UNHEALTHY,
                format!(
                    "cluster has {} unready nodes out of {}",
                    readiness.unready, readiness.registered
                ),
            ));
            self.planner.clean_up_unneeded_nodes();
            self.metrics.update_cluster_safe_to_autoscale(false);
            self.publish(&summary, now);
            return Ok(summary);
        }
        self.metrics.update_cluster_safe_to_autoscale(true);

        let injected = inject_upcoming_nodes(
            &mut *self.snapshot,
            &self.cluster_state.upcoming_nodes(),
            &templates,
        )?;
        if !injected.is_empty() {
            debug!(count = injected.len(), "upcoming nodes added to snapshot");
        }

        let step = Instant::now();
        let draining: HashSet<String> = self.deletions.draining_nodes().into_iter().collect();
        let draining_pods: Vec<Pod> = pods
            .iter()
            .filter(|p| p.node_name.as_ref().is_some_and(|n| draining.contains(n)))
            .cloned()
            .collect();
        let unschedulable: Vec<Pod> = pods
            .iter()
            .filter(|p| p.is_pending_unschedulable())
            .cloned()
            .collect();
        let (lists, scale_down_disabled, awaiting) = {
            let mut ctx = ProcessorContext::new(&mut *self.snapshot, &self.options, now);
            ctx.draining_pods = draining_pods;
            let lists = self
                .pipeline
                .process(&mut ctx, PodLists::new(unschedulable, scheduled));
            (
                lists,
                ctx.scale_down_disabled,
                std::mem::take(&mut ctx.awaiting_evaluation),
            )
        };
        self.metrics
            .update_duration(FunctionLabel::FilterOutSchedulable, step.elapsed());
        self.metrics
            .update_unschedulable_pods_count(lists.unschedulable.len());

        let step = Instant::now();
        summary.scale_up = self.run_scale_up(&nodes, &templates, lists.unschedulable, now).await;
        summary.scale_up.pods_awaiting_evaluation = awaiting;
        self.status_processor.process(&summary.scale_up);
        self.metrics
            .update_duration(FunctionLabel::ScaleUp, step.elapsed());
        if summary.scale_up.scaled_up() {
            self.last_scale_up = Some(now);
            self.metrics.update_last_time(Activity::ScaleUp, now);
        }

        if self.options.scale_down.enabled {
            summary.scale_down = self
                .run_scale_down(
                    &nodes,
                    pdbs,
                    &workloads,
                    summary.scale_up.scaled_up(),
                    scale_down_disabled,
                    now,
                )
                .await;
        }

        self.publish(&summary, now);
        Ok(summary)
    }

    async fn run_scale_up(
        &mut self,
        nodes: &[Node],
        templates: &NodeInfos,
        pods: Vec<Pod>,
        now: DateTime<Utc>,
    ) -> ScaleUpStatus {
        let mut ctx = ScaleUpContext {
            provider: &*self.provider,
            cluster_state: &mut self.cluster_state,
            snapshot: &*self.snapshot,
            options: &self.options,
            templates,
            nodes,
            now,
        };
        let result = if !pods.is_empty() {
            self.scale_up.scale_up(&mut ctx, pods).await
        } else if self.options.scale_up.enforce_node_group_min_size {
            self.scale_up.scale_up_to_node_group_min_size(&mut ctx)
        } else {
            Ok(ScaleUpStatus::with_result(ScaleUpResult::NotNeeded))
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "scale-up failed");
            self.metrics.register_error(e.kind());
            ScaleUpStatus {
                error: Some(e.to_string()),
                ..ScaleUpStatus::with_result(ScaleUpResult::Error)
            }
        })
    }

    async fn run_scale_down(
        &mut self,
        nodes: &[Node],
        pdbs: Vec<PodDisruptionBudget>,
        workloads: &[Workload],
        scaled_up: bool,
        disabled_by_pods: bool,
        now: DateTime<Utc>,
    ) -> ScaleDownStatus {
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let step = Instant::now();
        self.planner.update_cluster_state(
            &mut *self.snapshot,
            &self.cluster_state,
            &names,
            &names,
            pdbs.clone(),
            workloads,
            now,
        );
        self.metrics
            .update_duration(FunctionLabel::FindUnneeded, step.elapsed());
        self.metrics
            .update_unneeded_nodes_count(self.planner.unneeded_nodes().len());

        if scaled_up {
            debug!("scale-up ran in this iteration, skipping scale-down");
            return ScaleDownStatus::with_result(ScaleDownResult::NotTried);
        }
        if let Some(reason) = self.scale_down_cooldown(names.is_empty(), disabled_by_pods, now) {
            debug!(reason, "scale-down in cooldown");
            self.metrics.register_skipped_scale_event("down", reason);
            return ScaleDownStatus {
                unremovable_nodes: self.planner.unremovable_nodes(),
                ..ScaleDownStatus::with_result(ScaleDownResult::InCooldown)
            };
        }

        let step = Instant::now();
        self.metrics.update_last_time(Activity::ScaleDown, now);
        let resources = match ResourceManager::from_provider(&*self.provider, &self.options) {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "cannot read resource limits");
                self.metrics.register_error(e.kind());
                return ScaleDownStatus {
                    error: Some(e.to_string()),
                    ..ScaleDownStatus::with_result(ScaleDownResult::Error)
                };
            }
        };
        let removable = self.planner.nodes_to_delete(
            &RemovalContext {
                provider: &*self.provider,
                cluster_state: &self.cluster_state,
                snapshot: &*self.snapshot,
                deletions: &self.deletions,
                resources: &resources,
                unready_enabled: self.options.scale_down.unready_enabled,
            },
            now,
        );

        let mut status = if removable.empty.is_empty() && removable.drain.is_empty() {
            let result = if self.planner.unneeded_nodes().is_empty() {
                ScaleDownResult::NoUnneeded
            } else {
                ScaleDownResult::NoNodeDeleted
            };
            ScaleDownStatus::with_result(result)
        } else {
            let plan = DeletionPlan {
                empty: removable.empty,
                drain: removable.drain,
                pdbs,
                groups: node_group_views(&*self.provider, &self.cluster_state),
            };
            match self.actuator.start_deletion(&*self.snapshot, plan, now).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "failed to start scale-down");
                    ScaleDownStatus {
                        error: Some(e.to_string()),
                        ..ScaleDownStatus::with_result(ScaleDownResult::Error)
                    }
                }
            }
        };
        status.unremovable_nodes.extend(removable.unremovable);
        status
            .unremovable_nodes
            .extend(self.planner.unremovable_nodes());
        self.deletions
            .clear_results_not_newer_than(now - ChronoDuration::hours(1));
        self.metrics
            .update_duration(FunctionLabel::ScaleDown, step.elapsed());
        status
    }

    /// Why deletions are suppressed this iteration, if they are.
    fn scale_down_cooldown(
        &self,
        no_candidates: bool,
        disabled_by_pods: bool,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        let sd = &self.options.scale_down;
        let within = |at: Option<DateTime<Utc>>, delay| {
            at.is_some_and(|at| at + to_chrono(delay) > now)
        };
        if !self.paused.is_empty() {
            Some("paused")
        } else if disabled_by_pods {
            Some("young_pods")
        } else if no_candidates {
            Some("no_candidates")
        } else if within(self.last_scale_up, sd.delay_after_add) {
            Some("delay_after_add")
        } else if within(self.deletions.last_failure_time(), sd.delay_after_failure) {
            Some("delay_after_failure")
        } else if within(self.deletions.last_delete_time(), sd.delay_after_delete) {
            Some("delay_after_delete")
        } else {
            None
        }
    }

    /// Lowers targets that ran ahead of registered nodes and deletes
    /// instances that failed to start. Returns true if anything changed.
    fn fix_node_group_sizes(&mut self, now: DateTime<Utc>) -> bool {
        let mut fixed = false;
        for (group, delta) in self.cluster_state.incorrect_node_group_sizes(now) {
            warn!(node_group = %group.id(), delta, "decreasing target size of node group");
            match group.decrease_target_size(delta) {
                Ok(()) => fixed = true,
                Err(e) => {
                    warn!(node_group = %group.id(), error = %e, "failed to decrease target size");
                    self.metrics.register_error(e.kind());
                }
            }
        }
        for (group, instance) in self.cluster_state.errored_instances() {
            let InstanceState::Errored { class, message } = &instance.state else {
                continue;
            };
            self.cluster_state
                .register_failed_scale_up(group.id(), class, message, now);
            let placeholder = Node::new(instance.id.clone(), Resources::default());
            match group.delete_nodes(std::slice::from_ref(&placeholder)) {
                Ok(()) => {
                    info!(node_group = %group.id(), instance = %instance.id, "deleted errored instance");
                    fixed = true;
                }
                Err(e) => {
                    warn!(node_group = %group.id(), instance = %instance.id, error = %e, "failed to delete errored instance");
                    self.metrics.register_error(e.kind());
                }
            }
        }
        fixed
    }

    fn publish(&mut self, summary: &IterationSummary, now: DateTime<Utc>) {
        self.cluster_state.record_results(
            summary.scale_up.result,
            summary.scale_down.result,
            self.planner.unneeded_names(),
        );
        self.last_status = Some(self.cluster_state.status(now));
        self.metrics.update_last_time(Activity::Autoscaling, now);
    }
}
