//! A single upstream session (C5): one forwarder's WebSocket connection,
//! wrapped in a yamux multiplexer so the proxy dispatcher can open many
//! logical streams over it concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yamux::{Config as YamuxConfig, Connection, ConnectionError, Mode, Stream as YamuxStream};

use super::mux::WebSocketIo;
use crate::error::PikoError;

/// Object-safe alias so the session doesn't need to be generic over the
/// transport; lets tests drive the round-robin pool without a real socket.
trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub struct UpstreamSession {
    id: String,
    endpoint_id: String,
    control: Mutex<Connection<Box<dyn Io>>>,
    connections: AtomicU64,
    cancel: CancellationToken,
}

impl UpstreamSession {
    /// Wrap an already-upgraded WebSocket connection from a forwarder in a
    /// server-mode yamux session. `endpoint_id` is the single endpoint this
    /// session was accepted for (the `<endpointID>` path segment of the
    /// upgrade request, §4.5) and is fixed for the session's lifetime (§3).
    pub fn from_server_socket(
        id: String,
        endpoint_id: String,
        socket: WebSocketStream<tokio::net::TcpStream>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let io: Box<dyn Io> = Box::new(WebSocketIo::new(socket));
        let connection = Connection::new(io, YamuxConfig::default(), Mode::Server);
        Arc::new(Self {
            id,
            endpoint_id,
            control: Mutex::new(connection),
            connections: AtomicU64::new(0),
            cancel,
        })
    }

    #[cfg(test)]
    pub(crate) fn test_stub(id: String) -> Self {
        let (client, _server) = tokio::io::duplex(4096);
        let io: Box<dyn Io> = Box::new(client);
        let connection = Connection::new(io, YamuxConfig::default(), Mode::Client);
        Self {
            id,
            endpoint_id: "test-endpoint".to_string(),
            control: Mutex::new(connection),
            connections: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Forces this session closed (used by the rebalance tick, §4.5); the
    /// forwarder is expected to reconnect, possibly landing on another node.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Open a new logical stream to the forwarder for a single proxied
    /// request/connection. The returned stream implements
    /// `AsyncRead + AsyncWrite` and is closed independently of the session.
    pub async fn open_stream(&self) -> Result<YamuxStream, PikoError> {
        let mut control = self.control.lock().await;
        let poll_fn = futures::future::poll_fn(|cx| control.poll_new_outbound(cx));
        match tokio::time::timeout(Duration::from_secs(10), poll_fn).await {
            Ok(Ok(stream)) => {
                self.connections.fetch_add(1, Ordering::Relaxed);
                Ok(stream)
            }
            Ok(Err(err)) => Err(PikoError::UpstreamUnreachable(anyhow::anyhow!(err))),
            Err(_) => Err(PikoError::UpstreamTimeout),
        }
    }

    pub fn stream_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drives the yamux connection's inbound loop; must run for the
    /// session's lifetime or the multiplexer stalls. The forwarder never
    /// opens streams toward the server, so inbound streams are drained and
    /// dropped immediately. Also watches the session's cancellation token so
    /// [`Self::close`] (rebalance shedding, §4.5) can unwind this loop
    /// without waiting on the transport.
    pub async fn drive(self: Arc<Self>) {
        loop {
            let next = {
                let mut control = self.control.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    next = futures::future::poll_fn(|cx| control.poll_next_inbound(cx)) => next,
                }
            };
            match next {
                Some(Ok(_stream)) => continue,
                Some(Err(ConnectionError::Closed)) | None => {
                    debug!(session = %self.id, "upstream session closed");
                    break;
                }
                Some(Err(err)) => {
                    warn!(session = %self.id, "upstream session error: {err}");
                    break;
                }
            }
        }
        self.cancel.cancel();
    }
}
