//! When the next iteration runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Reports recent external activity that warrants an immediate iteration.
pub trait ProcessingActivity: Send + Sync + fmt::Debug {
    /// Returns true if an iteration should run now.
    fn recently_active(&self) -> bool;
}

/// Why the trigger returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The last iteration changed the cluster, or a processing getter
    /// reported activity.
    Immediate,
    /// An unschedulable pod appeared.
    PodAppeared,
    /// The scan interval elapsed.
    Interval,
}

/// Sender half of the "unschedulable pod appeared" signal.
///
/// Signals raised while one is pending are coalesced.
#[derive(Debug, Clone)]
pub struct PodAppearedSignal {
    tx: mpsc::Sender<()>,
}

impl PodAppearedSignal {
    /// Raises the signal. Returns false if one was already pending.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                trace!("pod-appeared signal already pending");
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Decides the delay before the next iteration.
#[derive(Debug)]
pub struct LoopTrigger {
    scan_interval: Duration,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
    activity: Vec<Arc<dyn ProcessingActivity>>,
}

impl LoopTrigger {
    /// Creates a trigger that waits at most `scan_interval`.
    #[must_use]
    pub fn new(scan_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            scan_interval,
            tx,
            rx,
            activity: Vec::new(),
        }
    }

    /// Registers a processing getter.
    #[must_use]
    pub fn with_activity(mut self, activity: Arc<dyn ProcessingActivity>) -> Self {
        self.activity.push(activity);
        self
    }

    /// A handle for raising the pod-appeared signal.
    #[must_use]
    pub fn signal(&self) -> PodAppearedSignal {
        PodAppearedSignal {
            tx: self.tx.clone(),
        }
    }

    /// Waits until the next iteration should start.
    pub async fn wait(&mut self, last_iteration_scaled: bool) -> Wake {
        if last_iteration_scaled {
            debug!("last iteration scaled the cluster, running again immediately");
            return Wake::Immediate;
        }
        if self.activity.iter().any(|a| a.recently_active()) {
            debug!("recent processing activity, running again immediately");
            return Wake::Immediate;
        }
        tokio::select! {
            Some(()) = self.rx.recv() => {
                debug!("unschedulable pod appeared");
                Wake::PodAppeared
            }
            () = sleep(self.scan_interval) => Wake::Interval,
        }
    }
}
