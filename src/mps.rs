//! Manageability-server tunnel-channel interface.
//!
//! Devices behind NAT keep a persistent outbound tunnel to a manageability
//! server; that server multiplexes per-connection channels over the tunnel
//! and owns the channel pool. This engine only requests and releases channels
//! through [`TunnelPool`] — it never talks the tunnel framing protocol
//! itself.
//!
//! A channel handle is a pair of byte pipes plus a watched lifecycle state.
//! State only moves forward (`Closed=0 → Connecting=1 → Connected=2` is the
//! happy path numbering; `Closed` is terminal and reachable from any state).

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Lifecycle state of a tunnel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed = 0,
    Connecting = 1,
    Connected = 2,
}

/// One multiplexed channel to a device, as handed out by the pool.
///
/// `incoming` carries device → engine frames; frames are never empty.
/// `outgoing` carries engine → device bytes; the send side is unbounded
/// because the relay layer implements no backpressure (see DESIGN.md).
pub struct TunnelChannel {
    pub node_id: String,
    pub state: watch::Receiver<ChannelState>,
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl TunnelChannel {
    /// Wait until the channel reports `Connected`.
    ///
    /// Errors if the channel closes first or the pool drops the state sender.
    pub async fn wait_connected(&mut self) -> Result<(), RelayError> {
        loop {
            match *self.state.borrow() {
                ChannelState::Connected => return Ok(()),
                ChannelState::Closed => {
                    return Err(RelayError::Tunnel("channel closed before connect".into()))
                }
                ChannelState::Connecting => {}
            }
            if self.state.changed().await.is_err() {
                return Err(RelayError::Tunnel("channel state lost".into()));
            }
        }
    }
}

/// Tunnel-channel pool collaborator, owned by the manageability server.
#[async_trait]
pub trait TunnelPool: Send + Sync {
    /// Open a channel to `node_id` at the given device port.
    async fn open_channel(&self, node_id: &str, port: u16) -> Result<TunnelChannel, RelayError>;

    /// Whether the device's tunnel advertises the plain (non-TLS) management
    /// port. Consulted before `open_channel` to pick the target port.
    async fn plain_management_port(&self, _node_id: &str) -> bool {
        false
    }
}

/// Pool used when no manageability server is attached: every open fails, so
/// the routing layer's tunnel path is effectively disabled.
pub struct NoTunnelPool;

#[async_trait]
impl TunnelPool for NoTunnelPool {
    async fn open_channel(&self, node_id: &str, _port: u16) -> Result<TunnelChannel, RelayError> {
        Err(RelayError::Tunnel(format!(
            "no manageability server attached (node {node_id})"
        )))
    }
}

/// Development pool that fakes a tunnel by opening a local TCP connection to
/// the requested port and pumping bytes between it and the channel pipes.
/// Gives the tunnel code path (including TLS-over-tunnel) something real to
/// run against without a manageability server. Also used by the bridge tests.
pub struct TcpLoopbackPool {
    /// Host the fake tunnel dials, usually `127.0.0.1`.
    pub host: String,
    /// Advertise the plain management port on opened channels.
    pub plain_port_ok: bool,
}

#[async_trait]
impl TunnelPool for TcpLoopbackPool {
    async fn plain_management_port(&self, _node_id: &str) -> bool {
        self.plain_port_ok
    }

    async fn open_channel(&self, node_id: &str, port: u16) -> Result<TunnelChannel, RelayError> {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let addr = format!("{}:{port}", self.host);
        let node = node_id.to_string();
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect(&addr).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(node = %node, addr = %addr, "Loopback tunnel connect failed: {e}");
                    let _ = state_tx.send(ChannelState::Closed);
                    return;
                }
            };
            let _ = state_tx.send(ChannelState::Connected);
            debug!(node = %node, addr = %addr, "Loopback tunnel channel up");

            let mut buf = vec![0u8; 16 * 1024];
            loop {
                tokio::select! {
                    read = stream.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if in_tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    chunk = out_rx.recv() => {
                        let Some(chunk) = chunk else { break };
                        if stream.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = state_tx.send(ChannelState::Closed);
            debug!(node = %node, "Loopback tunnel channel down");
        });

        Ok(TunnelChannel {
            node_id: node_id.to_string(),
            state: state_rx,
            incoming: in_rx,
            outgoing: out_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_no_pool_refuses() {
        let pool = NoTunnelPool;
        assert!(pool.open_channel("node/default/x", 16992).await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_channel_connects_and_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let pool = TcpLoopbackPool {
            host: "127.0.0.1".to_string(),
            plain_port_ok: true,
        };
        let mut ch = pool.open_channel("node/default/x", port).await.unwrap();
        ch.wait_connected().await.unwrap();

        ch.outgoing.send(b"ping".to_vec()).unwrap();
        let echoed = ch.incoming.recv().await.unwrap();
        assert_eq!(echoed, b"ping");
    }

    #[tokio::test]
    async fn test_loopback_channel_closes_on_refused_connect() {
        let pool = TcpLoopbackPool {
            host: "127.0.0.1".to_string(),
            plain_port_ok: false,
        };
        // Port 1 is essentially never listening.
        let mut ch = pool.open_channel("node/default/x", 1).await.unwrap();
        assert!(ch.wait_connected().await.is_err());
    }
}
