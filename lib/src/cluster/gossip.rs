//! Bridges `ClusterState` to a `chitchat` anti-entropy cluster (§4.3).
//!
//! Chitchat gives us key/value gossip plus a phi-accrual failure detector;
//! it has no notion of "nodes" the way the rest of this crate does, so this
//! module is entirely about translating between the two: node metadata is
//! packed into a handful of well-known gossip keys, and chitchat's
//! live/dead watchers and key-change events drive `ClusterState`'s
//! join/up/down/expired/leave callbacks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::node::{ClusterState, Node, NodeId, NodeStatus};

const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
/// ~4 hours at a 1s gossip interval, matching the grace period chitchat's
/// own examples use for production deployments.
const MARKED_FOR_DELETION_GRACE_PERIOD: usize = 14_400;

const KEY_PROXY_ADDR: &str = "piko:proxy_addr";
const KEY_ADMIN_ADDR: &str = "piko:admin_addr";
const KEY_LEAVING: &str = "piko:leaving";
const ENDPOINT_KEY_PREFIX: &str = "piko:endpoint:";

pub struct GossipSyncer {
    handle: ChitchatHandle,
    cluster: Arc<ClusterState>,
}

impl GossipSyncer {
    pub async fn spawn(
        cluster_id: String,
        self_id: &NodeId,
        gossip_listen_addr: SocketAddr,
        gossip_advertise_addr: SocketAddr,
        seed_nodes: Vec<String>,
        cluster: Arc<ClusterState>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let chitchat_id = ChitchatId::new(self_id.0.clone(), 0, gossip_advertise_addr);
        let local = cluster.local_node().await;

        let config = ChitchatConfig {
            cluster_id,
            chitchat_id,
            listen_addr: gossip_listen_addr,
            seed_nodes,
            failure_detector_config: FailureDetectorConfig::default(),
            gossip_interval: GOSSIP_INTERVAL,
            marked_for_deletion_grace_period: MARKED_FOR_DELETION_GRACE_PERIOD,
        };

        let initial_kvs = vec![
            (KEY_PROXY_ADDR.to_string(), local.proxy_addr.clone()),
            (KEY_ADMIN_ADDR.to_string(), local.admin_addr.clone()),
        ];

        let handle = spawn_chitchat(config, initial_kvs, &UdpTransport).await?;
        let syncer = Self {
            handle,
            cluster: cluster.clone(),
        };
        syncer.spawn_watchers(cancel).await;

        // Bridge C2's local-endpoint-update notifications into gossip
        // (§4.2/§4.3): every `AddLocalEndpoint`/`RemoveLocalEndpoint` call
        // that changes the local node's count for an endpoint republishes
        // the matching `piko:endpoint:<id>` key so peers can route to it.
        let chitchat_for_counts = syncer.handle.chitchat();
        cluster.on_local_endpoint_update(move |endpoint_id, count| {
            let chitchat = chitchat_for_counts.clone();
            let key = format!("{ENDPOINT_KEY_PREFIX}{endpoint_id}");
            tokio::spawn(async move {
                let mut guard = chitchat.lock().await;
                let state = guard.self_node_state();
                if count == 0 {
                    state.mark_for_deletion(&key);
                } else {
                    state.set(&key, count.to_string());
                }
            });
        });

        Ok(syncer)
    }

    async fn spawn_watchers(&self, cancel: CancellationToken) {
        let chitchat = self.handle.chitchat();

        // Anti-entropy key events: a node's address/endpoint keys changing,
        // or being tombstoned (deleted / marked for deletion).
        let cluster = self.cluster.clone();
        let _listener = chitchat
            .lock()
            .await
            .subscribe_event("piko:", move |event| {
                let cluster = cluster.clone();
                let node_id = NodeId(event.node.node_id.clone());
                let key = event.key.to_string();
                let value = event.value.to_string();
                tokio::spawn(async move {
                    handle_key_event(&cluster, node_id, &key, &value).await;
                });
            });
        // Leak the listener handle deliberately: it must outlive this
        // function, and is torn down when the chitchat handle itself
        // shuts down.
        std::mem::forget(_listener);

        let mut live_nodes = chitchat.lock().await.live_nodes_watcher();
        let cluster = self.cluster.clone();
        let live_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = live_cancel.cancelled() => return,
                    next = live_nodes.next() => {
                        let Some(states) = next else { return };
                        for (chitchat_id, state) in states {
                            let node_id = NodeId(chitchat_id.node_id.clone());
                            if node_id == *cluster.self_id() {
                                continue;
                            }

                            // Pending-node promotion gate (§4.3/§9): a node
                            // is only promoted into C2 — and so only
                            // observable via `Node(id)` — once both
                            // immutable address keys have arrived. Until
                            // then it stays un-upserted; the next live-node
                            // tick retries once more keys land.
                            let (Some(proxy_addr), Some(admin_addr)) =
                                (state.get(KEY_PROXY_ADDR), state.get(KEY_ADMIN_ADDR))
                            else {
                                debug!(%node_id, "gossip: withholding promotion, address keys incomplete");
                                continue;
                            };

                            let node = Node {
                                id: node_id.clone(),
                                proxy_addr: proxy_addr.to_string(),
                                admin_addr: admin_addr.to_string(),
                                gossip_addr: chitchat_id.gossip_advertise_addr.to_string(),
                                status: NodeStatus::Active,
                                endpoints: cluster
                                    .get(&node_id)
                                    .await
                                    .map(|existing| existing.endpoints)
                                    .unwrap_or_default(),
                            };
                            cluster.upsert(node).await;
                        }
                    }
                }
            }
        });

        let dead_cancel = cancel;
        let cluster = self.cluster.clone();
        let chitchat = self.handle.chitchat();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GOSSIP_INTERVAL * 3);
            loop {
                tokio::select! {
                    _ = dead_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let dead: Vec<NodeId> = chitchat
                            .lock()
                            .await
                            .dead_nodes()
                            .map(|id| NodeId(id.node_id.clone()))
                            .collect();
                        for node_id in dead {
                            cluster.mark_unreachable(&node_id).await;
                        }
                    }
                }
            }
        });
    }

    /// Gracefully announce departure: peers see this immediately via the
    /// `piko:leaving` key rather than waiting out the failure detector.
    pub async fn announce_leaving(&self) {
        let chitchat = self.handle.chitchat();
        chitchat
            .lock()
            .await
            .self_node_state()
            .set(KEY_LEAVING, "true");
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        Ok(())
    }
}

async fn handle_key_event(cluster: &Arc<ClusterState>, node_id: NodeId, key: &str, value: &str) {
    if key == KEY_LEAVING {
        cluster.mark_left(&node_id).await;
        return;
    }
    if let Some(endpoint_id) = key.strip_prefix(ENDPOINT_KEY_PREFIX) {
        let Some(mut node) = cluster.get(&node_id).await else {
            return;
        };
        match value.parse::<u64>() {
            Ok(count) => {
                node.endpoints.insert(endpoint_id.to_string(), count);
            }
            Err(_) => {
                // Tombstoned (deleted) key: the value is no longer a count.
                node.endpoints.remove(endpoint_id);
            }
        }
        cluster.upsert(node).await;
        return;
    }
    warn!(key, "gossip: unrecognized key, ignoring");
}
