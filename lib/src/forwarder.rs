//! Forwarder (C7): the client-side half of a tunnel. Opens a local TCP
//! listener and, for each accepted connection, dials a chosen endpoint on a
//! Piko node's TCP proxy port and pipes bytes in both directions. Ported
//! from the teacher's `gateway::serve`/`handle_tcp_connection` shape, with
//! the outbound dial replaced by a plain TCP connect carrying the same
//! endpoint-selection preamble the proxy's TCP path expects (§4.7).

use std::net::SocketAddr;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::proxy::ENDPOINT_HEADER;

pub async fn serve(
    bind_addr: SocketAddr,
    target_addr: SocketAddr,
    endpoint_id: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, %target_addr, %endpoint_id, "forwarder listening");

    let mut conn_id: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("forwarder accept failed: {err}");
                        continue;
                    }
                };
                conn_id += 1;
                let endpoint_id = endpoint_id.clone();
                let span = tracing::info_span!("forward_conn", id = conn_id, %peer_addr);
                tokio::spawn(
                    async move {
                        if let Err(err) = handle_connection(stream, target_addr, &endpoint_id).await {
                            warn!("forwarded connection failed: {err:#}");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    target_addr: SocketAddr,
    endpoint_id: &str,
) -> anyhow::Result<()> {
    let mut upstream = TcpStream::connect(target_addr).await?;
    let preamble = format!(
        "GET / HTTP/1.1\r\nHost: {endpoint_id}\r\n{ENDPOINT_HEADER}: {endpoint_id}\r\n\r\n"
    );
    upstream.write_all(preamble.as_bytes()).await?;

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    tokio::join!(
        async {
            let res = io::copy(&mut client_read, &mut upstream_write).await;
            upstream_write.shutdown().await.ok();
            debug!("client->endpoint copy ended: {res:?}");
        },
        async {
            let res = io::copy(&mut upstream_read, &mut client_write).await;
            client_write.shutdown().await.ok();
            debug!("endpoint->client copy ended: {res:?}");
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_bytes_between_client_and_endpoint() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut sock, _) = target_listener.accept().await.unwrap();
            // Drain the synthetic preamble up to the blank line, then echo.
            let mut buf = [0u8; 1024];
            let mut seen = Vec::new();
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let mut out = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut sock, &mut out).await.ok();
            out
        });

        let forward_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forward_addr = forward_listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            let (stream, _) = forward_listener.accept().await.unwrap();
            handle_connection(stream, target_addr, "e1").await.unwrap();
            cancel_clone.cancel();
        });

        let mut client = TcpStream::connect(forward_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let received = echo.await.unwrap();
        assert_eq!(received, b"hello");
    }
}
