//! Top-level process wiring (C8): builds the cluster, upstream manager and
//! proxy dispatcher from `Config`, then runs every component under a single
//! `CancellationToken` until shutdown, draining in the teacher's order
//! (stop accepting new work, let in-flight work finish, then tear down
//! gossip last so departure is visible to peers before the process exits).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::cluster::{ClusterState, GossipSyncer, Node, NodeId};
use crate::config::Config;
use crate::error::PikoError;
use crate::proxy::{access_log::AccessLogger, FORWARD_HEADER};
use crate::upstream::UpstreamManager;

/// Object-safe alias for "anything that can carry bytes in both
/// directions", used so the proxy dispatcher doesn't care whether a route
/// ends at a local yamux stream or a freshly dialed remote TCP connection.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}
pub type BoxedDuplex = Box<dyn Duplex>;

pub enum Route {
    Local(BoxedDuplex),
    Remote { stream: BoxedDuplex, node_id: NodeId },
}

/// Shared routing logic behind both the HTTP and TCP proxy listeners:
/// local-first, single remote hop otherwise (§4.6 single-hop discipline).
pub struct Dispatch {
    pub cluster: Arc<ClusterState>,
    pub upstream: Arc<UpstreamManager>,
    pub token_verifier: Arc<TokenVerifier>,
    pub access_log: AccessLogger,
    pub proxy_timeout: Duration,
}

impl Dispatch {
    /// Resolve `endpoint_id` to a byte stream: a local upstream session if
    /// one is registered here, otherwise — when `allow_remote` is set — a
    /// fresh TCP connection to the one other cluster node that reports
    /// serving it (§4.4 `Select(endpoint_id, allow_remote)`). Callers set
    /// `allow_remote = false` for a request that already carries the
    /// `x-piko-forward` loop guard, enforcing the single-hop rule (§4.6);
    /// they must also never call this again on a stream obtained from a
    /// `Route::Remote`.
    pub async fn open_stream(&self, endpoint_id: &str, allow_remote: bool) -> Result<Route, PikoError> {
        if self.upstream.has_local_endpoint(endpoint_id).await {
            let stream = self.upstream.open_stream(endpoint_id).await?;
            return Ok(Route::Local(Box::new(stream)));
        }

        if !allow_remote {
            return Err(PikoError::NoAvailableUpstreams);
        }

        let candidates = self.cluster.nodes_for_endpoint(endpoint_id).await;
        let Some((node, _count)) = candidates.into_iter().next() else {
            return Err(PikoError::NoAvailableUpstreams);
        };

        let addr: SocketAddr = node
            .proxy_addr
            .parse()
            .map_err(|_| PikoError::Internal(anyhow::anyhow!("invalid proxy_addr for node")))?;
        let stream = tokio::time::timeout(self.proxy_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PikoError::UpstreamTimeout)?
            .map_err(|err| PikoError::UpstreamUnreachable(err.into()))?;

        Ok(Route::Remote {
            stream: Box::new(stream),
            node_id: node.id,
        })
    }
}

/// Inserts the loop-guard header into a raw HTTP request's header block,
/// right before the blank line that ends it. `initial_data` is assumed to
/// be valid UTF-8 (already parsed once by `httparse`).
pub fn with_forward_header(initial_data: &[u8]) -> Vec<u8> {
    let mut text = String::from_utf8_lossy(initial_data).into_owned();
    if let Some(pos) = text.find("\r\n\r\n") {
        text.insert_str(pos, &format!("\r\n{FORWARD_HEADER}: 1"));
    }
    text.into_bytes()
}

pub struct Server {
    config: Config,
    cancel: CancellationToken,
    cluster: Arc<ClusterState>,
    upstream: Arc<UpstreamManager>,
    dispatch: Arc<Dispatch>,
}

impl Server {
    pub async fn new(config: Config, token_verifier: TokenVerifier) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let self_id = match &config.cluster.node_id {
            Some(id) => NodeId(id.clone()),
            None => NodeId::generate(config.cluster.node_id_prefix.as_deref()),
        };

        let local_node = Node::new(
            self_id.clone(),
            config.proxy.advertise_addr.clone(),
            config.admin.advertise_addr.clone(),
            config.gossip.advertise_addr.clone(),
        );
        let cluster = ClusterState::new(self_id, local_node);
        let upstream = UpstreamManager::new(cluster.clone());

        let token_verifier = Arc::new(token_verifier);
        let access_log = AccessLogger::new(&config.proxy.access_log);
        let dispatch = Arc::new(Dispatch {
            cluster: cluster.clone(),
            upstream: upstream.clone(),
            token_verifier,
            access_log,
            proxy_timeout: config.proxy.timeout,
        });

        Ok(Self {
            config,
            cancel,
            cluster,
            upstream,
            dispatch,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cluster(&self) -> Arc<ClusterState> {
        self.cluster.clone()
    }

    pub fn dispatch(&self) -> Arc<Dispatch> {
        self.dispatch.clone()
    }

    /// Runs the proxy, admin and gossip listeners until cancelled, then
    /// drains in order: stop taking new proxy connections, announce
    /// departure over gossip, finally shut the gossip transport down.
    pub async fn run(self) -> anyhow::Result<()> {
        let gossip_cluster_id = "piko".to_string();
        let gossip_bind: SocketAddr = self.config.gossip.bind_addr;
        let gossip_advertise: SocketAddr = self.config.gossip.advertise_addr.parse()?;

        let gossip = GossipSyncer::spawn(
            gossip_cluster_id,
            self.cluster.self_id(),
            gossip_bind,
            gossip_advertise,
            self.config.cluster.join.clone(),
            self.cluster.clone(),
            self.cancel.clone(),
        )
        .await?;

        if !self.config.cluster.join.is_empty() {
            for seed in &self.config.cluster.join {
                info!(%seed, "cluster: joining via seed");
            }
            let abort_if_join_fails = self.config.cluster.abort_if_join_fails;
            let cluster = self.cluster.clone();
            tokio::time::sleep(Duration::from_secs(5)).await;
            let stuck = cluster.sweep_pending().await;
            if !stuck.is_empty() && abort_if_join_fails {
                anyhow::bail!("failed to join cluster: no confirmation from seed nodes");
            } else if !stuck.is_empty() {
                warn!(count = stuck.len(), "cluster: join unconfirmed, continuing anyway");
            }
        }

        let http = tokio::spawn(crate::proxy::http::serve(
            self.dispatch.clone(),
            self.config.proxy.bind_addr,
            self.cancel.clone(),
        ));
        let tcp = tokio::spawn(crate::proxy::tcp::serve(
            self.dispatch.clone(),
            self.config.proxy.tcp_bind_addr,
        ));
        let admin = tokio::spawn(crate::admin::serve(
            self.cluster.clone(),
            self.upstream.clone(),
            self.config.admin.bind_addr,
            self.cancel.clone(),
        ));
        let upstream_server = tokio::spawn(crate::upstream::listener::serve(
            self.upstream.clone(),
            self.dispatch.token_verifier.clone(),
            self.config.server.bind_addr,
            self.cancel.clone(),
        ));
        let rebalance = tokio::spawn(crate::upstream::rebalance::serve(
            self.upstream.clone(),
            self.cluster.clone(),
            self.config.upstream.rebalance.clone(),
            self.cancel.clone(),
        ));

        self.cancel.cancelled().await;
        info!("shutting down: announcing departure");
        gossip.announce_leaving().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        http.abort();
        tcp.abort();
        admin.abort();
        upstream_server.abort();
        rebalance.abort();
        gossip.shutdown().await?;
        Ok(())
    }
}
