use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

const NODE_ID_LEN: usize = 7;
const NODE_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
/// How long a node announced via `join` may stay unconfirmed by gossip
/// before it's dropped from the pending set (§4.2).
const PENDING_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate(prefix: Option<&str>) -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..NODE_ID_LEN)
            .map(|_| {
                let idx = rng.random_range(0..NODE_ID_ALPHABET.len());
                NODE_ID_ALPHABET[idx] as char
            })
            .collect();
        match prefix {
            Some(prefix) => Self(format!("{prefix}-{suffix}")),
            None => Self(suffix),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Announced via `cluster.join` but not yet confirmed by gossip.
    Pending,
    Active,
    /// Missed the failure detector's phi threshold; still present in the
    /// membership table in case it recovers before the expiry grace period.
    Unreachable,
    /// Gracefully left the cluster (marked for deletion, not merely down).
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub proxy_addr: String,
    pub admin_addr: String,
    pub gossip_addr: String,
    pub status: NodeStatus,
    /// Endpoint id -> number of upstream connections this node currently
    /// holds for it, as last reported over gossip. Used by the proxy
    /// dispatcher (C6) to pick a node to forward to when no local upstream
    /// exists for the endpoint.
    #[serde(default)]
    pub endpoints: HashMap<String, u64>,
}

impl Node {
    pub fn new(id: NodeId, proxy_addr: String, admin_addr: String, gossip_addr: String) -> Self {
        Self {
            id,
            proxy_addr,
            admin_addr,
            gossip_addr,
            status: NodeStatus::Pending,
            endpoints: HashMap::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, NodeStatus::Active)
    }
}

type JoinCallback = Box<dyn Fn(NodeId) + Send + Sync>;
type UpCallback = Box<dyn Fn(&Node) + Send + Sync>;
type DownCallback = Box<dyn Fn(NodeId) + Send + Sync>;
type ExpiredCallback = Box<dyn Fn(NodeId) + Send + Sync>;
type LeaveCallback = Box<dyn Fn(NodeId) + Send + Sync>;
/// Fired with (endpoint id, new count) after `set_local_endpoint_count`
/// mutates the local node's counters (§4.2 `OnLocalEndpointUpdate`); this is
/// how C3 learns to republish a count change into gossip.
type LocalEndpointUpdateCallback = Box<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_join: Vec<JoinCallback>,
    on_up: Vec<UpCallback>,
    on_down: Vec<DownCallback>,
    on_expired: Vec<ExpiredCallback>,
    on_leave: Vec<LeaveCallback>,
    on_local_endpoint_update: Vec<LocalEndpointUpdateCallback>,
}

struct PendingJoin {
    deadline: Instant,
}

/// Backend-agnostic cluster membership table (C2). `gossip::GossipSyncer`
/// drives this from chitchat events; nothing in here knows about gossip.
pub struct ClusterState {
    self_id: NodeId,
    nodes: RwLock<HashMap<NodeId, Node>>,
    pending: RwLock<HashMap<NodeId, PendingJoin>>,
    callbacks: std::sync::Mutex<Callbacks>,
}

impl ClusterState {
    pub fn new(self_id: NodeId, self_node: Node) -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(self_id.clone(), self_node);
        Arc::new(Self {
            self_id,
            nodes: RwLock::new(nodes),
            pending: RwLock::new(HashMap::new()),
            callbacks: std::sync::Mutex::new(Callbacks::default()),
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn on_join(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_join.push(Box::new(callback));
    }

    pub fn on_up(&self, callback: impl Fn(&Node) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_up.push(Box::new(callback));
    }

    pub fn on_down(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_down.push(Box::new(callback));
    }

    pub fn on_expired(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_expired.push(Box::new(callback));
    }

    pub fn on_leave(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_leave.push(Box::new(callback));
    }

    /// Registers a callback invoked whenever `set_local_endpoint_count`
    /// changes the local node's count for an endpoint (§4.2). Invoked after
    /// the state lock is released, per C2's concurrency contract.
    pub fn on_local_endpoint_update(&self, callback: impl Fn(&str, u64) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_local_endpoint_update.push(Box::new(callback));
    }

    /// Record that `node_id` was told to `join`; it must be confirmed by
    /// gossip within [`PENDING_JOIN_TIMEOUT`] or `abort_if_join_fails` kicks
    /// in (checked by the caller via [`Self::sweep_pending`]).
    pub async fn mark_pending(&self, node_id: NodeId) {
        self.pending.write().await.insert(
            node_id,
            PendingJoin {
                deadline: Instant::now() + PENDING_JOIN_TIMEOUT,
            },
        );
    }

    /// Returns node ids whose pending join deadline has passed without
    /// confirmation. The caller decides whether to abort startup or just
    /// log and keep going, per `cluster.abort_if_join_fails`.
    pub async fn sweep_pending(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut pending = self.pending.write().await;
        let expired: Vec<NodeId> = pending
            .iter()
            .filter(|(_, join)| join.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            pending.remove(id);
        }
        expired
    }

    /// Upsert a node learned from gossip (or the local node itself). Fires
    /// `on_join` the first time a node id is seen, then `on_up` whenever it
    /// transitions into `Active`.
    pub async fn upsert(&self, node: Node) {
        let id = node.id.clone();
        self.pending.write().await.remove(&id);

        let mut nodes = self.nodes.write().await;
        let previously_known = nodes.contains_key(&id);
        let became_active = node.status == NodeStatus::Active
            && nodes.get(&id).map(|n| n.status) != Some(NodeStatus::Active);
        nodes.insert(id.clone(), node.clone());
        drop(nodes);

        if !previously_known {
            debug!(node_id = %id, "cluster: node joined");
            for callback in &self.callbacks.lock().unwrap().on_join {
                callback(id.clone());
            }
        }
        if became_active {
            info!(node_id = %id, "cluster: node up");
            for callback in &self.callbacks.lock().unwrap().on_up {
                callback(&node);
            }
        }
    }

    pub async fn mark_unreachable(&self, node_id: &NodeId) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            if node.status == NodeStatus::Active {
                node.status = NodeStatus::Unreachable;
                drop(nodes);
                info!(node_id = %node_id, "cluster: node down");
                for callback in &self.callbacks.lock().unwrap().on_down {
                    callback(node_id.clone());
                }
            }
        }
    }

    /// A node's grace period after being marked for deletion elapsed with
    /// no recovery; it is removed from the table entirely.
    pub async fn expire(&self, node_id: &NodeId) {
        let removed = self.nodes.write().await.remove(node_id).is_some();
        if removed {
            info!(node_id = %node_id, "cluster: node expired");
            for callback in &self.callbacks.lock().unwrap().on_expired {
                callback(node_id.clone());
            }
        }
    }

    /// A node gracefully announced departure (as opposed to going silent).
    pub async fn mark_left(&self, node_id: &NodeId) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.status = NodeStatus::Left;
            drop(nodes);
            info!(node_id = %node_id, "cluster: node left");
            for callback in &self.callbacks.lock().unwrap().on_leave {
                callback(node_id.clone());
            }
        }
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn active_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_usable())
            .cloned()
            .collect()
    }

    pub async fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Active nodes (other than self) that report holding at least one
    /// connection for `endpoint_id`, most-loaded first — used by the proxy
    /// dispatcher to pick a remote node to forward to.
    pub async fn nodes_for_endpoint(&self, endpoint_id: &str) -> Vec<(Node, u64)> {
        let mut matches: Vec<(Node, u64)> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.id != self.self_id && n.is_usable())
            .filter_map(|n| n.endpoints.get(endpoint_id).map(|count| (n.clone(), *count)))
            .collect();
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        matches
    }

    /// Update the local node's reported endpoint connection counts and
    /// notify `on_local_endpoint_update` subscribers (C3's gossip bridge)
    /// so peers learn about it.
    pub async fn set_local_endpoint_count(&self, endpoint_id: &str, count: u64) {
        {
            let mut nodes = self.nodes.write().await;
            if let Some(node) = nodes.get_mut(&self.self_id) {
                if count == 0 {
                    node.endpoints.remove(endpoint_id);
                } else {
                    node.endpoints.insert(endpoint_id.to_string(), count);
                }
            }
        }
        for callback in &self.callbacks.lock().unwrap().on_local_endpoint_update {
            callback(endpoint_id, count);
        }
    }

    pub async fn local_node(&self) -> Node {
        self.nodes
            .read()
            .await
            .get(&self.self_id)
            .cloned()
            .expect("local node always present")
    }
}
