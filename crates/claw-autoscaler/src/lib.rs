//! Cluster autoscaler for Clawbernetes node groups.
//!
//! Grows node groups when pods cannot be scheduled and removes nodes whose
//! pods fit elsewhere. Every decision is simulated against a
//! [`snapshot::ClusterSnapshot`] first; the [`autoscaler::Autoscaler`] runs
//! one iteration at a time and [`runner::run`] drives it until shutdown.
//!
//! The outside world is reached through three seams: a
//! [`cloudprovider::CloudProvider`] for node groups, a [`kube::ClusterSource`]
//! for listing nodes and pods, and a [`kube::KubeClient`] for taints and
//! evictions. In-memory implementations of all three back the tests and the
//! simulator binary.

#![forbid(unsafe_code)]

pub mod autoscaler;
pub mod backoff;
pub mod cloudprovider;
pub mod clusterstate;
pub mod config;
pub mod error;
pub mod estimator;
pub mod events;
pub mod expander;
pub mod kube;
pub mod metrics;
pub mod processors;
pub mod runner;
pub mod scaledown;
pub mod scaleup;
pub mod scheduler;
pub mod snapshot;
pub mod status;
pub mod trigger;
pub mod types;

pub use autoscaler::{Autoscaler, IterationSummary};
pub use cloudprovider::{CloudProvider, InMemoryCloudProvider, NodeGroup, NodeGroupSpec};
pub use clusterstate::ClusterStateRegistry;
pub use config::AutoscalingOptions;
pub use error::{AutoscalerError, ErrorKind, Result};
pub use events::{EventRecorder, InMemoryEventRecorder, LogEventRecorder};
pub use kube::{ClusterSource, InMemoryCluster, KubeClient};
pub use metrics::AutoscalerMetrics;
pub use runner::{run, RunStats};
pub use snapshot::{ClusterSnapshot, SnapshotKind};
pub use status::{ClusterAutoscalerStatus, ScaleDownResult, ScaleUpResult};
pub use trigger::{LoopTrigger, PodAppearedSignal, Wake};
pub use types::{Node, NodeGroupId, Pod, Resources};
