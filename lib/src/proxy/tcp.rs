//! Raw TCP proxy dispatch. Ported from the teacher's `gateway::serve` /
//! `handle_tcp_connection`: peek the leading HTTP request off the socket to
//! learn the target endpoint, then pump bytes in both directions between
//! the client and the opened upstream stream. Non-HTTP TCP payloads are out
//! of scope (§ Non-goals: no non-HTTP/1.x L7 awareness).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::{ENDPOINT_HEADER, FORWARD_HEADER};
use crate::error::PikoError;
use crate::server::{with_forward_header, Dispatch, Route};

pub async fn serve(dispatch: Arc<Dispatch>, bind_addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "tcp proxy listening");

    let mut conn_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                conn_id += 1;
                let dispatch = dispatch.clone();
                let span = tracing::info_span!("tcp_conn", id = conn_id, %peer_addr);
                tokio::spawn(
                    async move {
                        if let Err(err) = handle_connection(stream, dispatch).await {
                            if err.is_shutdown_noise() {
                                debug!("connection ended: {err}");
                            } else {
                                warn!("connection failed: {err}");
                            }
                        }
                    }
                    .instrument(span),
                );
            }
            Err(err) => error!("tcp accept failed: {err}"),
        }
    }
}

async fn handle_connection(mut client: TcpStream, dispatch: Arc<Dispatch>) -> Result<(), PikoError> {
    let header_names = [ENDPOINT_HEADER, FORWARD_HEADER];
    let req = read_partial_request(&mut client, &header_names)
        .await
        .map_err(|err| PikoError::MalformedRequest(err.to_string()))?;

    if req.headers.contains_key(FORWARD_HEADER) {
        send_text_response(&mut client, 508, "Loop Detected").await.ok();
        return Err(PikoError::MalformedRequest("already forwarded once".to_string()));
    }

    let endpoint_id = req
        .headers
        .get(ENDPOINT_HEADER)
        .cloned()
        .or_else(|| super::extract_subdomain(&req.host).map(str::to_string))
        .ok_or(PikoError::MissingEndpointId)?;

    // Already-forwarded connections are rejected with 508 above, so this
    // call never needs to allow a second remote hop (§4.6 single-hop rule).
    let route = match dispatch.open_stream(&endpoint_id, true).await {
        Ok(route) => route,
        Err(err) => {
            send_text_response(&mut client, err.status().as_u16(), &err.message())
                .await
                .ok();
            return Err(err);
        }
    };

    let (mut upstream, initial_data) = match route {
        Route::Local(stream) => (stream, req.initial_data),
        Route::Remote { stream, node_id } => {
            debug!(%node_id, %endpoint_id, "forwarding tcp connection to remote node");
            (stream, with_forward_header(&req.initial_data))
        }
    };

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(&mut upstream);

    tokio::join!(
        async {
            let res = send_all(&mut upstream_write, &initial_data, &mut client_read).await;
            debug!("client->upstream copy ended: {res:?}");
        },
        async {
            let res = io::copy(&mut upstream_read, &mut client_write).await;
            debug!("upstream->client copy ended: {res:?}");
        },
    );

    Ok(())
}

async fn send_all(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    initial_data: &[u8],
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
) -> io::Result<u64> {
    writer.write_all(initial_data).await?;
    let copied = io::copy(reader, writer).await?;
    writer.shutdown().await.ok();
    Ok(copied + initial_data.len() as u64)
}

async fn send_text_response(stream: &mut TcpStream, status: u16, reason: &str) -> io::Result<()> {
    let body = format!("{status} {reason}\n");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

struct PartialRequest {
    host: String,
    headers: std::collections::HashMap<String, String>,
    initial_data: Vec<u8>,
}

async fn read_partial_request(
    stream: &mut TcpStream,
    header_names: &[&str],
) -> anyhow::Result<PartialRequest> {
    const MAX_HEADER_BYTES: usize = 8192;
    const SEPARATOR: &[u8; 4] = b"\r\n\r\n";

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if buf.len() >= MAX_HEADER_BYTES {
            anyhow::bail!("request headers exceeded {MAX_HEADER_BYTES} bytes");
        }
        let n = tokio::io::AsyncReadExt::read(stream, &mut tmp).await?;
        if n == 0 {
            anyhow::bail!("connection closed before headers completed");
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(SEPARATOR.len()).any(|w| w == SEPARATOR) {
            break;
        }
    }

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    match parsed.parse(&buf)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("incomplete HTTP request"),
    }

    let find = |name: &str| -> Option<String> {
        parsed
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::to_string)
    };

    let host = find(http::header::HOST.as_str()).ok_or_else(|| anyhow::anyhow!("missing host header"))?;
    let mut headers = std::collections::HashMap::new();
    for name in header_names {
        if let Some(value) = find(name) {
            headers.insert(name.to_string(), value);
        }
    }

    Ok(PartialRequest {
        host,
        headers,
        initial_data: buf,
    })
}
