//! Upstream session server (C5): accepts forwarder WebSocket connections,
//! verifies the bearer token and the target endpoint presented in the
//! handshake, and hands the upgraded socket to `UpstreamSession` for yamux
//! wrapping.
//!
//! All authorization checks run inside the `accept_hdr_async` handshake
//! callback, before the 101 response is sent, so a rejected forwarder sees
//! the documented `401 {"error": "..."}` body (§6) instead of a successful
//! upgrade followed by an abrupt close.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::manager::UpstreamManager;
use super::session::UpstreamSession;
use crate::auth::{Token, TokenVerifier};
use crate::error::PikoError;

const TENANT_HEADER: &str = "x-piko-tenant-id";
const UPSTREAM_PATH_PREFIX: &str = "/piko/v1/upstream/";

pub async fn serve(
    manager: Arc<UpstreamManager>,
    token_verifier: Arc<TokenVerifier>,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "upstream session server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("upstream accept failed: {err}");
                        continue;
                    }
                };
                let manager = manager.clone();
                let token_verifier = token_verifier.clone();
                let cancel = cancel.clone();
                let span = tracing::info_span!("upstream_conn", %peer_addr);
                tokio::spawn(
                    async move {
                        if let Err(err) = handle(stream, manager, token_verifier, cancel).await {
                            debug!("upstream connection rejected: {err:#}");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

/// `endpointID` segment of `/piko/v1/upstream/<endpointID>` (§4.5/§6).
fn endpoint_id_from_path(path: &str) -> Option<String> {
    let id = path.strip_prefix(UPSTREAM_PATH_PREFIX)?.trim_matches('/');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// A handshake rejection response carrying a JSON `{"error": "..."}" body.
/// Status codes are rebuilt by number rather than reusing `PikoError`'s
/// `axum::http::StatusCode` directly, since the handshake callback here
/// works in tungstenite's own `http` re-export.
fn reject(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Some(format!("{{\"error\":\"{message}\"}}")))
        .unwrap()
}

fn reject_piko(err: &PikoError) -> Response {
    let status = StatusCode::from_u16(err.status().as_u16()).unwrap_or(StatusCode::UNAUTHORIZED);
    reject(status, &err.message())
}

async fn handle(
    stream: TcpStream,
    manager: Arc<UpstreamManager>,
    token_verifier: Arc<TokenVerifier>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let captured: Arc<Mutex<Option<(String, Token)>>> = Arc::new(Mutex::new(None));
    let callback_captured = captured.clone();
    let token_verifier_cb = token_verifier.clone();

    let callback = move |req: &Request, response: Response| {
        let Some(endpoint_id) = endpoint_id_from_path(req.uri().path()) else {
            return Err(reject(StatusCode::BAD_REQUEST, "missing endpoint id"));
        };

        let Some(auth_header) = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Err(reject_piko(&PikoError::MissingAuthorization));
        };
        let Some(token) = auth_header.strip_prefix("Bearer ") else {
            return Err(reject_piko(&PikoError::UnsupportedAuthType));
        };
        let tenant = req
            .headers()
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let verified = match token_verifier_cb.verify(token, tenant) {
            Ok(verified) => verified,
            Err(err) => return Err(reject_piko(&err)),
        };

        if !verified.permits(&endpoint_id) {
            return Err(reject_piko(&PikoError::EndpointNotPermitted));
        }

        *callback_captured.lock().unwrap() = Some((endpoint_id, verified));
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (endpoint_id, _verified) = captured
        .lock()
        .unwrap()
        .take()
        .expect("handshake callback populates this on every accepted upgrade");

    let session_id = Uuid::new_v4().to_string();
    let session_cancel = cancel.child_token();
    let session = UpstreamSession::from_server_socket(
        session_id.clone(),
        endpoint_id.clone(),
        ws_stream,
        session_cancel,
    );

    info!(session = %session_id, %endpoint_id, "upstream session registered");
    manager.register(session.clone()).await;
    session.clone().drive().await;
    manager.deregister(&session).await;
    info!(session = %session_id, "upstream session closed");
    Ok(())
}
