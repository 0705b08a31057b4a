//! Event recording.
//!
//! Events attach a reason and message to a pod, node or node group. The
//! [`LogEventRecorder`] mirrors them into `tracing`; the
//! [`InMemoryEventRecorder`] keeps them for inspection.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::NodeGroupId;

/// A pod triggered a scale-up.
pub const REASON_TRIGGERED_SCALE_UP: &str = "TriggeredScaleUp";
/// A pod did not trigger a scale-up.
pub const REASON_NOT_TRIGGER_SCALE_UP: &str = "NotTriggerScaleUp";
/// A node group was scaled up.
pub const REASON_SCALED_UP_GROUP: &str = "ScaledUpGroup";
/// A node group failed to scale up.
pub const REASON_FAILED_TO_SCALE_UP_GROUP: &str = "FailedToScaleUpGroup";
/// Requested nodes did not show up in time.
pub const REASON_SCALE_UP_TIMED_OUT: &str = "ScaleUpTimedOut";
/// A node is being removed.
pub const REASON_SCALE_DOWN: &str = "ScaleDown";
/// Removing a node failed.
pub const REASON_SCALE_DOWN_FAILED: &str = "ScaleDownFailed";
/// Draining a node was deferred.
pub const REASON_SCALE_DOWN_DEFERRED: &str = "ScaleDownDeferred";
/// A node group matched no priority bucket.
pub const REASON_PRIORITY_NOT_MATCHED: &str = "PriorityConfigNotMatched";
/// The cluster is unhealthy.
pub const REASON_CLUSTER_UNHEALTHY: &str = "ClusterUnhealthy";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

/// The object an event is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventObject {
    /// A pod, by `namespace/name`.
    Pod(String),
    /// A node, by name.
    Node(String),
    /// A node group.
    NodeGroup(NodeGroupId),
    /// The autoscaler itself.
    Autoscaler,
}

impl fmt::Display for EventObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod(key) => write!(f, "pod/{key}"),
            Self::Node(name) => write!(f, "node/{name}"),
            Self::NodeGroup(id) => write!(f, "nodegroup/{id}"),
            Self::Autoscaler => f.write_str("cluster-autoscaler"),
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Subject.
    pub object: EventObject,
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

impl Event {
    /// Creates a normal event.
    #[must_use]
    pub fn normal(object: EventObject, reason: &str, message: impl Into<String>) -> Self {
        Self {
            object,
            event_type: EventType::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Creates a warning event.
    #[must_use]
    pub fn warning(object: EventObject, reason: &str, message: impl Into<String>) -> Self {
        Self {
            object,
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Sink for events.
pub trait EventRecorder: Send + Sync + fmt::Debug {
    /// Records an event.
    fn record(&self, event: Event);
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps events in memory and mirrors them to the log.
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events with the given reason.
    #[must_use]
    pub fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, event: Event) {
        LogEventRecorder.record(event.clone());
        self.events.write().push(event);
    }
}
