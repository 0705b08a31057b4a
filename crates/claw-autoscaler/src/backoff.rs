//! Exponential backoff for node groups.
//!
//! A failed scale-up backs its group off for `initial`, doubling on every
//! further failure up to `max`. A failure long after the previous one (more
//! than `reset_timeout`) starts over at `initial`. A success removes the
//! backoff entirely.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BackoffOptions;
use crate::types::NodeGroupId;

/// Information about the failure that caused a backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpError {
    /// Error class, e.g. `cloudProviderError` or `timeout`.
    pub class: String,
    /// Error message.
    pub message: String,
}

impl ScaleUpError {
    /// Creates an error description.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// Backoff state of a node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffStatus {
    /// The group is backed off.
    pub backed_off: bool,
    /// End of the backoff.
    pub until: Option<DateTime<Utc>>,
    /// The failure that caused the backoff.
    pub error: Option<ScaleUpError>,
}

#[derive(Debug, Clone)]
struct BackoffEntry {
    duration: Duration,
    until: DateTime<Utc>,
    last_failure: DateTime<Utc>,
    error: ScaleUpError,
}

/// Per-group exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    reset_timeout: Duration,
    entries: HashMap<NodeGroupId, BackoffEntry>,
}

fn chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

impl ExponentialBackoff {
    /// Creates a backoff with explicit bounds.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, reset_timeout: Duration) -> Self {
        Self {
            initial,
            max,
            reset_timeout,
            entries: HashMap::new(),
        }
    }

    /// Creates a backoff from configuration.
    #[must_use]
    pub fn from_options(options: &BackoffOptions) -> Self {
        Self::new(options.initial, options.max, options.reset_timeout)
    }

    /// Backs a group off after a failure. Returns the end of the backoff.
    pub fn backoff(
        &mut self,
        group: &NodeGroupId,
        error: ScaleUpError,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let duration = match self.entries.get(group) {
            Some(prev) if now - prev.last_failure <= chrono(self.reset_timeout) => {
                prev.duration.saturating_mul(2).min(self.max)
            }
            _ => self.initial,
        };
        let until = now
            .checked_add_signed(chrono(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        warn!(
            node_group = %group,
            backoff_secs = duration.as_secs(),
            class = %error.class,
            error = %error.message,
            "backing off node group"
        );
        self.entries.insert(
            group.clone(),
            BackoffEntry {
                duration,
                until,
                last_failure: now,
                error,
            },
        );
        until
    }

    /// Returns true while the group is backed off.
    #[must_use]
    pub fn is_backed_off(&self, group: &NodeGroupId, now: DateTime<Utc>) -> bool {
        self.entries.get(group).is_some_and(|e| now < e.until)
    }

    /// Reports the backoff state of a group.
    #[must_use]
    pub fn status(&self, group: &NodeGroupId, now: DateTime<Utc>) -> BackoffStatus {
        match self.entries.get(group) {
            Some(entry) if now < entry.until => BackoffStatus {
                backed_off: true,
                until: Some(entry.until),
                error: Some(entry.error.clone()),
            },
            _ => BackoffStatus {
                backed_off: false,
                until: None,
                error: None,
            },
        }
    }

    /// Clears a group's backoff after a success.
    pub fn remove_backoff(&mut self, group: &NodeGroupId) {
        if self.entries.remove(group).is_some() {
            debug!(node_group = %group, "backoff removed");
        }
    }

    /// Forgets entries whose last failure is older than the reset timeout.
    pub fn remove_stale(&mut self, now: DateTime<Utc>) {
        let reset = chrono(self.reset_timeout);
        self.entries.retain(|_, e| now - e.last_failure <= reset);
    }
}
