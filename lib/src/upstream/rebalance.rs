//! Load shedding / rebalance tick (C5, §4.5). A 1s ticker compares this
//! node's local upstream session count against the cluster-wide average and
//! closes a handful of sessions when this node is carrying disproportionate
//! load; closed sessions are expected to reconnect and, by plain round-robin
//! reseeding across the cluster, converge back on the mean.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::manager::UpstreamManager;
use crate::cluster::ClusterState;
use crate::config::RebalanceConfig;

const TICK: Duration = Duration::from_secs(1);

pub async fn serve(
    manager: Arc<UpstreamManager>,
    cluster: Arc<ClusterState>,
    config: RebalanceConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                tick(&manager, &cluster, &config).await;
            }
        }
    }
}

async fn tick(manager: &Arc<UpstreamManager>, cluster: &Arc<ClusterState>, config: &RebalanceConfig) {
    let local_count = manager.session_count().await as u64;
    let avg = cluster_average_session_count(cluster).await;
    let shed = shed_count(local_count, avg, config);
    if shed == 0 {
        return;
    }
    let closed = manager.shed_sessions(shed).await;
    if closed > 0 {
        info!(closed, local_count, avg, "upstream: shedding sessions to rebalance cluster load");
    }
}

/// Average total session count across the cluster, self included — a node
/// that hasn't yet gossiped a fresh count still contributes its last known
/// value, which is what `Node.endpoints` already holds.
async fn cluster_average_session_count(cluster: &Arc<ClusterState>) -> u64 {
    let self_id = cluster.self_id().clone();
    let totals: Vec<u64> = cluster
        .all_nodes()
        .await
        .into_iter()
        .filter(|node| node.id == self_id || node.is_usable())
        .map(|node| node.endpoints.values().sum::<u64>())
        .collect();
    if totals.is_empty() {
        return 0;
    }
    totals.iter().sum::<u64>() / totals.len() as u64
}

/// How many sessions to close this tick, given the local count and the
/// cluster average. Pure function so the threshold/shed-rate/min-conns
/// arithmetic can be tested without a real cluster.
fn shed_count(local_count: u64, avg: u64, config: &RebalanceConfig) -> usize {
    if local_count < config.min_conns as u64 {
        return 0;
    }
    let threshold = (avg as f64) * config.threshold;
    if (local_count as f64) <= threshold {
        return 0;
    }
    ((avg as f64) * config.shed_rate).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_conns: usize, threshold: f64, shed_rate: f64) -> RebalanceConfig {
        RebalanceConfig {
            min_conns,
            threshold,
            shed_rate,
        }
    }

    #[test]
    fn below_min_conns_never_sheds() {
        let config = config(5, 1.0, 0.5);
        assert_eq!(shed_count(4, 0, &config), 0);
    }

    #[test]
    fn within_threshold_does_not_shed() {
        let config = config(5, 1.5, 0.5);
        assert_eq!(shed_count(14, 10, &config), 0);
    }

    #[test]
    fn over_threshold_sheds_proportional_to_avg() {
        let config = config(5, 1.5, 0.2);
        // avg=10, threshold=15, local=20 > 15: shed ceil(10 * 0.2) = 2
        assert_eq!(shed_count(20, 10, &config), 2);
    }

    #[test]
    fn zero_cluster_average_never_sheds() {
        let config = config(0, 1.0, 0.5);
        assert_eq!(shed_count(10, 0, &config), 0);
    }
}
