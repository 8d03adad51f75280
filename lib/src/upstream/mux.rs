//! Adapts a `tokio-tungstenite` WebSocket into an `AsyncRead + AsyncWrite`
//! byte stream so it can carry a `yamux` session (§4.5). Only binary frames
//! carry multiplexer bytes; ping/pong/close are handled transparently.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;

pub struct WebSocketIo<S> {
    inner: S,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> WebSocketIo<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

impl<S, E> AsyncRead for WebSocketIo<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.read_pos < self.read_buf.len() {
                let available = &self.read_buf[self.read_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                self.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buf = data;
                    self.read_pos = 0;
                    continue;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_other))) => {
                    // Ping/Pong/Text/Frame: not mux payload, skip.
                    continue;
                }
                Poll::Ready(Some(Err(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "websocket closed",
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S, E> AsyncWrite for WebSocketIo<S>
where
    S: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, err))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, err))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))
    }
}
