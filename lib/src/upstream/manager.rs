//! Per-node registry of upstream sessions, load-balanced round robin per
//! endpoint id (C4). A session is bound to exactly one endpoint id for its
//! lifetime (§3); the manager indexes by that id so lookup stays O(1) per
//! endpoint regardless of how many sessions are registered overall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::UpstreamSession;
use crate::cluster::ClusterState;
use crate::error::PikoError;

struct EndpointPool {
    sessions: Vec<Arc<UpstreamSession>>,
    cursor: AtomicUsize,
}

impl EndpointPool {
    fn new() -> Self {
        Self {
            sessions: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<Arc<UpstreamSession>> {
        if self.sessions.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        Some(self.sessions[idx].clone())
    }

    /// Remove `session_id` and clamp the cursor so it never reads past the
    /// (now shorter) vector; does not reset position, matching a plain
    /// round robin's "keep going from roughly where you were" invariant.
    fn remove(&mut self, session_id: &str) {
        self.sessions.retain(|s| s.id() != session_id);
        if self.sessions.is_empty() {
            self.cursor.store(0, Ordering::Relaxed);
        } else {
            let len = self.sessions.len();
            self.cursor.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c % len)).ok();
        }
    }
}

pub struct UpstreamManager {
    pools: RwLock<HashMap<String, EndpointPool>>,
    cluster: Arc<ClusterState>,
}

impl UpstreamManager {
    pub fn new(cluster: Arc<ClusterState>) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            cluster,
        })
    }

    pub async fn register(&self, session: Arc<UpstreamSession>) {
        let endpoint_id = session.endpoint_id().to_string();
        {
            let mut pools = self.pools.write().await;
            pools
                .entry(endpoint_id.clone())
                .or_insert_with(EndpointPool::new)
                .sessions
                .push(session.clone());
        }
        self.publish_count(&endpoint_id).await;
    }

    pub async fn deregister(&self, session: &UpstreamSession) {
        let endpoint_id = session.endpoint_id().to_string();
        {
            let mut pools = self.pools.write().await;
            if let Some(pool) = pools.get_mut(&endpoint_id) {
                pool.remove(session.id());
                if pool.sessions.is_empty() {
                    pools.remove(&endpoint_id);
                }
            }
        }
        self.publish_count(&endpoint_id).await;
    }

    /// Round-robin pick of a local session serving `endpoint_id`.
    pub async fn pick(&self, endpoint_id: &str) -> Option<Arc<UpstreamSession>> {
        self.pools.read().await.get(endpoint_id).and_then(EndpointPool::next)
    }

    pub async fn has_local_endpoint(&self, endpoint_id: &str) -> bool {
        self.pools
            .read()
            .await
            .get(endpoint_id)
            .map(|pool| !pool.sessions.is_empty())
            .unwrap_or(false)
    }

    pub async fn open_stream(&self, endpoint_id: &str) -> Result<yamux::Stream, PikoError> {
        let session = self
            .pick(endpoint_id)
            .await
            .ok_or(PikoError::NoAvailableUpstreams)?;
        session.open_stream().await
    }

    async fn publish_count(&self, endpoint_id: &str) {
        let count: u64 = {
            let pools = self.pools.read().await;
            pools
                .get(endpoint_id)
                .map(|pool| pool.sessions.iter().map(|s| s.connection_count()).sum())
                .unwrap_or(0)
        };
        self.cluster.set_local_endpoint_count(endpoint_id, count).await;
    }

    /// Total sessions registered locally across every endpoint, used by the
    /// rebalance tick (§4.5) to compare this node's load against the
    /// cluster average.
    pub async fn session_count(&self) -> usize {
        self.pools.read().await.values().map(|pool| pool.sessions.len()).sum()
    }

    /// Forcibly closes up to `n` locally registered sessions, any of them,
    /// to shed load when this node is overloaded relative to the cluster
    /// (§4.5). Returns how many were actually closed.
    pub async fn shed_sessions(&self, n: usize) -> usize {
        let sessions: Vec<Arc<UpstreamSession>> = {
            let pools = self.pools.read().await;
            pools.values().flat_map(|pool| pool.sessions.iter().cloned()).take(n).collect()
        };
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize) -> EndpointPool {
        let mut pool = EndpointPool::new();
        pool.sessions = (0..n)
            .map(|i| {
                // UpstreamSession has no test-only constructor; round-robin
                // logic is exercised directly against EndpointPool instead.
                Arc::new(UpstreamSession::test_stub(format!("s{i}")))
            })
            .collect();
        pool
    }

    #[test]
    fn round_robin_cycles_through_all_sessions() {
        let pool = pool_with(3);
        let picks: Vec<String> = (0..6).map(|_| pool.next().unwrap().id().to_string()).collect();
        assert_eq!(picks, vec!["s0", "s1", "s2", "s0", "s1", "s2"]);
    }

    #[test]
    fn removing_a_session_keeps_cursor_in_bounds() {
        let mut pool = pool_with(3);
        pool.cursor.store(5, Ordering::Relaxed);
        pool.remove("s1");
        assert_eq!(pool.sessions.len(), 2);
        // Should not panic on next() after removal despite a stale cursor.
        for _ in 0..4 {
            assert!(pool.next().is_some());
        }
    }

    #[test]
    fn removing_last_session_resets_cursor() {
        let mut pool = pool_with(1);
        pool.remove("s0");
        assert!(pool.sessions.is_empty());
        assert_eq!(pool.cursor.load(Ordering::Relaxed), 0);
        assert!(pool.next().is_none());
    }
}
