//! The long-running autoscaler loop.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::autoscaler::Autoscaler;
use crate::kube::KubeClient;
use crate::trigger::{LoopTrigger, Wake};

/// Iteration counters kept by [`run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Iterations started.
    pub iterations: u64,
    /// Iterations that returned an error.
    pub failed: u64,
    /// Iterations that scaled the cluster.
    pub scaled: u64,
}

/// Runs iterations until `shutdown` is cancelled, then releases provider
/// resources.
///
/// Iteration errors are logged and counted; they never stop the loop.
pub async fn run<K: KubeClient>(
    autoscaler: &mut Autoscaler<K>,
    mut trigger: LoopTrigger,
    shutdown: CancellationToken,
) -> RunStats {
    let mut stats = RunStats::default();
    info!(
        scan_interval_secs = autoscaler.options().scan_interval.as_secs(),
        "starting autoscaler loop"
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        stats.iterations += 1;
        let scaled = match autoscaler.run_once(Utc::now()).await {
            Ok(summary) => summary.scaled(),
            Err(e) => {
                error!(error = %e, iteration = stats.iterations, "iteration failed");
                stats.failed += 1;
                false
            }
        };
        if scaled {
            stats.scaled += 1;
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            wake = trigger.wait(scaled) => {
                if wake == Wake::PodAppeared {
                    info!("unschedulable pod appeared, starting iteration early");
                }
            }
        }
    }

    if let Err(e) = autoscaler.cleanup() {
        error!(error = %e, "cloud provider cleanup failed");
    }
    info!(
        iterations = stats.iterations,
        failed = stats.failed,
        "autoscaler loop stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cloudprovider::{InMemoryCloudProvider, NodeGroupSpec};
    use crate::config::AutoscalingOptions;
    use crate::events::InMemoryEventRecorder;
    use crate::kube::InMemoryCluster;
    use crate::metrics::AutoscalerMetrics;
    use crate::types::{Node, Resources, MIB};

    fn autoscaler(provider: Arc<InMemoryCloudProvider>) -> Autoscaler<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        Autoscaler::new(
            AutoscalingOptions::default(),
            provider,
            cluster.clone(),
            cluster,
            Arc::new(InMemoryEventRecorder::new()),
            AutoscalerMetrics::new(),
        )
        .expect("autoscaler")
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancellation() {
        let provider = Arc::new(InMemoryCloudProvider::new());
        provider
            .add_node_group(NodeGroupSpec::new(
                "ng1",
                0,
                3,
                Node::new("tpl", Resources::new(1000, 1000 * MIB)),
            ))
            .expect("group");
        let mut autoscaler = autoscaler(provider.clone());
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            cancel.cancel();
        });

        let stats = run(
            &mut autoscaler,
            LoopTrigger::new(Duration::from_secs(10)),
            shutdown,
        )
        .await;
        // iterations at 0s, 10s and 20s
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(provider.refresh_count(), 3);
        assert!(autoscaler.status().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_nothing() {
        let mut autoscaler = autoscaler(Arc::new(InMemoryCloudProvider::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stats = run(
            &mut autoscaler,
            LoopTrigger::new(Duration::from_secs(10)),
            shutdown,
        )
        .await;
        assert_eq!(stats, RunStats::default());
    }
}
