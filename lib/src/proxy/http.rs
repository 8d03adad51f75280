//! HTTP proxy dispatch. Terminates HTTP/1.1 from the public internet, picks
//! a route the same way `proxy::tcp` does, then replays the request over a
//! fresh HTTP/1.1 client connection opened on that route's byte stream —
//! whether that stream ends at a local upstream session or one remote hop
//! away makes no difference to this code (§4.6).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ENDPOINT_HEADER, FORWARD_HEADER};
use crate::error::PikoError;
use crate::server::{Dispatch, Route};

pub async fn serve(
    dispatch: Arc<Dispatch>,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .fallback(any(handle))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(dispatch);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "http proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle(State(dispatch): State<Arc<Dispatch>>, request: Request) -> Response {
    let entry = dispatch.access_log.start();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_headers = request.headers().clone();
    let endpoint_id = endpoint_id_for_logging(&request);

    let response = match dispatch_request(&dispatch, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    dispatch.access_log.log(
        entry,
        &method,
        &path,
        &endpoint_id,
        response.status(),
        &request_headers,
        response.headers(),
    );
    response
}

fn endpoint_id_for_logging(request: &Request) -> String {
    request
        .headers()
        .get(ENDPOINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .and_then(super::extract_subdomain)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

async fn dispatch_request(dispatch: &Dispatch, request: Request) -> Result<Response, PikoError> {
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(PikoError::MissingEndpointId)?
        .to_string();

    let already_forwarded = request.headers().contains_key(FORWARD_HEADER);

    let endpoint_id = request
        .headers()
        .get(ENDPOINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| super::extract_subdomain(&host).map(str::to_string))
        .ok_or(PikoError::MissingEndpointId)?;

    let route = dispatch.open_stream(&endpoint_id, !already_forwarded).await?;

    let stream = match route {
        Route::Local(stream) => stream,
        Route::Remote { stream, .. } => stream,
    };

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| PikoError::UpstreamUnreachable(err.into()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            warn!("upstream connection driver error: {err}");
        }
    });

    let outbound = rebuild_request(request, already_forwarded);
    let response = tokio::time::timeout(dispatch.proxy_timeout, sender.send_request(outbound))
        .await
        .map_err(|_| PikoError::UpstreamTimeout)?
        .map_err(|err| PikoError::UpstreamUnreachable(err.into()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        .boxed();
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Re-wraps the inbound axum request as an outbound hyper request, adding
/// the loop-guard header when this hop is forwarding to a remote node.
fn rebuild_request(request: Request, add_forward_header: bool) -> hyper::Request<Body> {
    let (mut parts, body) = request.into_parts();
    if add_forward_header {
        parts
            .headers
            .insert(FORWARD_HEADER, http::HeaderValue::from_static("1"));
    }
    hyper::Request::from_parts(parts, body)
}
