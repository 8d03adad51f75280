//! Admin surface: health/readiness probes, a hand-rolled Prometheus
//! exposition endpoint, and read-only cluster/endpoint status, each
//! forwardable to another node via `?forward=<node_id>` (§6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{ClusterState, Node};
use crate::upstream::UpstreamManager;

#[derive(Debug, Default)]
pub struct AdminMetrics {
    status_requests_total: AtomicU64,
    forwarded_requests_total: AtomicU64,
}

impl AdminMetrics {
    fn inc_status_requests(&self) {
        self.status_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_forwarded_requests(&self) {
        self.forwarded_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, nodes: &[Node], upstream_endpoint_count: usize) -> String {
        use crate::cluster::NodeStatus;
        let count = |status: NodeStatus| nodes.iter().filter(|n| n.status == status).count();
        format!(
            concat!(
                "# HELP piko_admin_status_requests_total Admin status endpoint hits.\n",
                "# TYPE piko_admin_status_requests_total counter\n",
                "piko_admin_status_requests_total {}\n",
                "# HELP piko_admin_forwarded_requests_total Admin requests proxied to another node.\n",
                "# TYPE piko_admin_forwarded_requests_total counter\n",
                "piko_admin_forwarded_requests_total {}\n",
                "# HELP piko_cluster_nodes Cluster nodes known to this node, by status.\n",
                "# TYPE piko_cluster_nodes gauge\n",
                "piko_cluster_nodes{{status=\"active\"}} {}\n",
                "piko_cluster_nodes{{status=\"unreachable\"}} {}\n",
                "piko_cluster_nodes{{status=\"pending\"}} {}\n",
                "piko_cluster_nodes{{status=\"left\"}} {}\n",
                "# HELP piko_local_endpoints Endpoints with at least one upstream session on this node.\n",
                "# TYPE piko_local_endpoints gauge\n",
                "piko_local_endpoints {}\n",
            ),
            self.status_requests_total.load(Ordering::Relaxed),
            self.forwarded_requests_total.load(Ordering::Relaxed),
            count(NodeStatus::Active),
            count(NodeStatus::Unreachable),
            count(NodeStatus::Pending),
            count(NodeStatus::Left),
            upstream_endpoint_count,
        )
    }
}

#[derive(Clone)]
struct AdminState {
    cluster: Arc<ClusterState>,
    upstream: Arc<UpstreamManager>,
    metrics: Arc<AdminMetrics>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ForwardQuery {
    forward: Option<String>,
}

pub async fn serve(
    cluster: Arc<ClusterState>,
    upstream: Arc<UpstreamManager>,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = AdminState {
        cluster,
        upstream,
        metrics: Arc::new(AdminMetrics::default()),
        http: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status/nodes", get(nodes_handler))
        .route("/status/endpoints/{id}", get(endpoint_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Ready once this node has joined its own cluster table (always true after
/// `ClusterState::new`, but kept as a distinct probe for a future readiness
/// gate such as "gossip transport bound").
async fn ready_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let _ = state.cluster.local_node().await;
    "OK"
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let nodes = state.cluster.all_nodes().await;
    let local_endpoints = nodes
        .iter()
        .find(|n| n.id == *state.cluster.self_id())
        .map(|n| n.endpoints.len())
        .unwrap_or(0);
    let body = state.metrics.render(&nodes, local_endpoints);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn nodes_handler(
    State(state): State<AdminState>,
    Query(query): Query<ForwardQuery>,
) -> axum::response::Response {
    state.metrics.inc_status_requests();
    if let Some(target) = query.forward.as_deref() {
        return forward(&state, target, "/status/nodes").await;
    }
    let nodes = state.cluster.all_nodes().await;
    Json(nodes).into_response()
}

#[derive(Debug, Serialize)]
struct EndpointStatus {
    endpoint_id: String,
    local_sessions: bool,
    remote_nodes: Vec<RemoteEndpointCount>,
}

#[derive(Debug, Serialize)]
struct RemoteEndpointCount {
    node: Node,
    connections: u64,
}

async fn endpoint_handler(
    State(state): State<AdminState>,
    Path(endpoint_id): Path<String>,
    Query(query): Query<ForwardQuery>,
) -> axum::response::Response {
    state.metrics.inc_status_requests();
    if let Some(target) = query.forward.as_deref() {
        return forward(&state, target, &format!("/status/endpoints/{endpoint_id}")).await;
    }

    let local_sessions = state.upstream.has_local_endpoint(&endpoint_id).await;
    let remote_nodes = state
        .cluster
        .nodes_for_endpoint(&endpoint_id)
        .await
        .into_iter()
        .map(|(node, connections)| RemoteEndpointCount { node, connections })
        .collect();

    Json(EndpointStatus {
        endpoint_id,
        local_sessions,
        remote_nodes,
    })
    .into_response()
}

/// Proxies this request to `node_id`'s admin address, by plain HTTP GET —
/// used by operators to inspect the whole cluster's view through one node
/// without dialing each `admin_addr` themselves.
async fn forward(state: &AdminState, node_id: &str, path: &str) -> axum::response::Response {
    state.metrics.inc_forwarded_requests();
    let node_id = crate::cluster::NodeId(node_id.to_string());
    let Some(node) = state.cluster.get(&node_id).await else {
        return (StatusCode::NOT_FOUND, format!("unknown node {node_id}")).into_response();
    };

    let url = format!("http://{}{path}", node.admin_addr);
    match state.http.get(&url).send().await {
        Ok(response) => {
            let status = response.status();
            match response.bytes().await {
                Ok(body) => (status, body).into_response(),
                Err(err) => {
                    (StatusCode::BAD_GATEWAY, format!("reading forwarded response: {err}"))
                        .into_response()
                }
            }
        }
        Err(err) => (StatusCode::BAD_GATEWAY, format!("forwarding to {node_id}: {err}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_includes_counters() {
        let metrics = AdminMetrics::default();
        metrics.inc_status_requests();
        metrics.inc_forwarded_requests();
        let node = Node::new("self".to_string().into(), "a".into(), "b".into(), "c".into());
        let rendered = metrics.render(&[node], 3);
        assert!(rendered.contains("piko_admin_status_requests_total 1"));
        assert!(rendered.contains("piko_admin_forwarded_requests_total 1"));
        assert!(rendered.contains("piko_local_endpoints 3"));
    }
}
