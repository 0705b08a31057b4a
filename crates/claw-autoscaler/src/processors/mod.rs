//! Processor pipelines.
//!
//! Pod-list processors transform the pending pod list before any scaling
//! decision. Each one receives the pods still considered unschedulable and
//! the pods already scheduled, and returns both lists. A processor that
//! fails is logged and skipped; its input is forwarded unchanged.
//!
//! Status processors consume scaling results after the fact, for example to
//! attach events to pods.

pub mod pods;
pub mod status;

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::AutoscalingOptions;
use crate::error::Result;
use crate::snapshot::ClusterSnapshot;
use crate::types::Pod;

pub use pods::{
    CurrentlyDrainedNodes, FilterOutDaemonSetPods, FilterOutExpendable, FilterOutSchedulable,
    FilterOutYoungPods, ANNOTATION_POD_SCALE_UP_DELAY,
};
pub use status::{EventingScaleUpStatusProcessor, ScaleUpStatusProcessor};

/// The two pod lists threaded through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodLists {
    /// Pods that may need new capacity.
    pub unschedulable: Vec<Pod>,
    /// Pods placed in the snapshot.
    pub scheduled: Vec<Pod>,
}

impl PodLists {
    /// Creates the lists.
    #[must_use]
    pub const fn new(unschedulable: Vec<Pod>, scheduled: Vec<Pod>) -> Self {
        Self {
            unschedulable,
            scheduled,
        }
    }
}

/// Per-iteration input shared by the processors.
pub struct ProcessorContext<'a> {
    /// The iteration's snapshot, including upcoming nodes.
    pub snapshot: &'a mut dyn ClusterSnapshot,
    /// Configuration.
    pub options: &'a AutoscalingOptions,
    /// Iteration time.
    pub now: DateTime<Utc>,
    /// Pods of nodes that are still being drained.
    pub draining_pods: Vec<Pod>,
    /// Pods held back for a later iteration.
    pub awaiting_evaluation: Vec<Pod>,
    /// Set when scale-down must not run this iteration.
    pub scale_down_disabled: bool,
}

impl fmt::Debug for ProcessorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("now", &self.now)
            .field("draining_pods", &self.draining_pods.len())
            .field("awaiting_evaluation", &self.awaiting_evaluation.len())
            .field("scale_down_disabled", &self.scale_down_disabled)
            .finish_non_exhaustive()
    }
}

impl<'a> ProcessorContext<'a> {
    /// Creates a context with no draining pods.
    pub fn new(
        snapshot: &'a mut dyn ClusterSnapshot,
        options: &'a AutoscalingOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            options,
            now,
            draining_pods: Vec::new(),
            awaiting_evaluation: Vec::new(),
            scale_down_disabled: false,
        }
    }
}

/// Transforms the pending pod lists.
pub trait PodListProcessor: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Processes the lists.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor cannot run; the pipeline then
    /// forwards its input unchanged.
    fn process(&mut self, ctx: &mut ProcessorContext<'_>, pods: PodLists) -> Result<PodLists>;
}

/// An ordered pipeline of pod-list processors.
#[derive(Debug, Default)]
pub struct PodListPipeline {
    processors: Vec<Box<dyn PodListProcessor>>,
}

impl PodListPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default processors, in order.
    #[must_use]
    pub fn default_pipeline(scheduler: std::sync::Arc<dyn crate::scheduler::Scheduler>) -> Self {
        Self::new()
            .with(FilterOutExpendable)
            .with(CurrentlyDrainedNodes)
            .with(FilterOutDaemonSetPods)
            .with(FilterOutSchedulable::new(scheduler))
            .with(FilterOutYoungPods)
    }

    /// Appends a processor.
    #[must_use]
    pub fn with(mut self, processor: impl PodListProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Names of the processors, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Runs every processor in order.
    pub fn process(&mut self, ctx: &mut ProcessorContext<'_>, mut pods: PodLists) -> PodLists {
        for processor in &mut self.processors {
            let before = pods.unschedulable.len();
            match processor.process(ctx, pods.clone()) {
                Ok(out) => {
                    debug!(
                        processor = processor.name(),
                        before,
                        after = out.unschedulable.len(),
                        "processed pending pods"
                    );
                    pods = out;
                }
                Err(e) => {
                    warn!(processor = processor.name(), error = %e, "pod list processor failed");
                }
            }
        }
        pods
    }
}
