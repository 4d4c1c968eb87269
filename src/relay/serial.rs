//! Tunnel-in-tunnel adapter.
//!
//! A TLS client wants a socket; a tunnel channel is a pair of framed byte
//! pipes. [`SerialTunnel`] bridges the two: it implements `AsyncRead` +
//! `AsyncWrite` over the channel pipes so `tokio_rustls` (or any other
//! stream consumer) can run on top of an already-tunneled transport. It
//! holds no transport logic of its own.
//!
//! Reads yield frames arriving from the outer tunnel, carrying partial
//! frames across calls; writes forward bytes into the outer tunnel without
//! blocking (the outgoing pipe is unbounded — the relay layer implements no
//! backpressure). Zero-length writes are filtered out rather than forwarded
//! as empty frames.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Duplex byte-stream shim over a tunnel channel's frame pipes.
pub struct SerialTunnel {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Partially consumed frame from a previous read.
    pending: Vec<u8>,
    pos: usize,
}

impl SerialTunnel {
    /// Build the adapter from a channel's frame pipes: `incoming` carries
    /// frames from the outer tunnel, `outgoing` feeds bytes back into it.
    pub fn new(
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl AsyncRead for SerialTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Drain the carried-over frame first to preserve byte order.
        if self.pos < self.pending.len() {
            let n = (self.pending.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.pending[pos..pos + n]);
            self.pos += n;
            if self.pos == self.pending.len() {
                self.pending.clear();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match self.incoming.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let n = frame.len().min(buf.remaining());
                buf.put_slice(&frame[..n]);
                if n < frame.len() {
                    self.pending = frame;
                    self.pos = n;
                }
                Poll::Ready(Ok(()))
            }
            // Sender dropped: the outer tunnel closed. EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for SerialTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.outgoing.send(data.to_vec()) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel channel closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Sends complete synchronously into the pipe; nothing to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_adapter() -> (
        SerialTunnel,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (SerialTunnel::new(in_rx, out_tx), in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_write_forwards_into_tunnel() {
        let (mut adapter, _in_tx, mut out_rx) = make_adapter();
        adapter.write_all(b"hello").await.unwrap();
        adapter.write_all(b" world").await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), b"hello");
        assert_eq!(out_rx.recv().await.unwrap(), b" world");
    }

    #[tokio::test]
    async fn test_read_carries_partial_frames() {
        let (mut adapter, in_tx, _out_rx) = make_adapter();
        in_tx.send(b"abcdef".to_vec()).unwrap();

        let mut buf = [0u8; 4];
        adapter.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        let mut rest = [0u8; 2];
        adapter.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn test_read_eof_when_tunnel_closes() {
        let (mut adapter, in_tx, _out_rx) = make_adapter();
        in_tx.send(b"x".to_vec()).unwrap();
        drop(in_tx);

        let mut all = Vec::new();
        adapter.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"x");
    }

    #[tokio::test]
    async fn test_write_after_close_is_broken_pipe() {
        let (mut adapter, _in_tx, out_rx) = make_adapter();
        drop(out_rx);
        let err = adapter.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
