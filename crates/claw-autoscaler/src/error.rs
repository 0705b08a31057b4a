//! Error types for the autoscaler.
//!
//! Errors are grouped into the five classes the control loop cares about:
//! transient failures that may be retried, configuration errors rejected at
//! startup, cloud provider mutation failures that drive backoff, inconsistent
//! cluster state that skips an iteration, and internal errors.

use std::fmt;

use thiserror::Error;

/// Result type for autoscaler operations.
pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Errors that can occur in the autoscaler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutoscalerError {
    /// Retryable failure such as an RPC timeout or throttling.
    #[error("transient error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of why the configuration is invalid.
        reason: String,
    },

    /// A cloud provider call failed.
    #[error("cloud provider error: {message}")]
    CloudProvider {
        /// Description of the failure.
        message: String,
    },

    /// Listers returned inconsistent data.
    #[error("inconsistent cluster state: {message}")]
    ClusterState {
        /// Description of the inconsistency.
        message: String,
    },

    /// Unexpected condition inside the autoscaler.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// Node group not known to the cloud provider.
    #[error("node group not found: {id}")]
    NodeGroupNotFound {
        /// ID of the node group that was not found.
        id: String,
    },

    /// Node not found.
    #[error("node not found: {name}")]
    NodeNotFound {
        /// Name of the node that was not found.
        name: String,
    },

    /// Cluster snapshot operation failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl AutoscalerError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a cloud provider error.
    pub fn cloud_provider(message: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: message.into(),
        }
    }

    /// Creates a cluster state error.
    pub fn cluster_state(message: impl Into<String>) -> Self {
        Self::ClusterState {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Config { .. } => ErrorKind::Config,
            Self::CloudProvider { .. } | Self::NodeGroupNotFound { .. } => {
                ErrorKind::CloudProvider
            }
            Self::ClusterState { .. } | Self::NodeNotFound { .. } => ErrorKind::ClusterState,
            Self::Internal { .. } | Self::Snapshot(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Error classes used for metrics and loop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable.
    Transient,
    /// Rejected at startup.
    Config,
    /// Cloud provider mutation failed.
    CloudProvider,
    /// Listers are inconsistent.
    ClusterState,
    /// Bug.
    Internal,
}

impl ErrorKind {
    /// Returns the metric label for this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Config => "config",
            Self::CloudProvider => "cloud_provider",
            Self::ClusterState => "cluster_state",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by cluster snapshot mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The node does not exist in the current view.
    #[error("node {name} not found in snapshot")]
    NodeNotFound {
        /// Node name.
        name: String,
    },

    /// A node with the same name already exists.
    #[error("node {name} already in snapshot")]
    NodeAlreadyExists {
        /// Node name.
        name: String,
    },

    /// The pod does not exist in the current view.
    #[error("pod {key} not found in snapshot")]
    PodNotFound {
        /// Pod key (`namespace/name`).
        key: String,
    },

    /// A pod with the same identity already resides on a node.
    #[error("pod {key} already placed on node {node}")]
    PodAlreadyExists {
        /// Pod key (`namespace/name`).
        key: String,
        /// Node the pod already resides on.
        node: String,
    },
}
