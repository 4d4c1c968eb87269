//! Cluster routing table and peer relay hand-off.
//!
//! In a multi-server deployment each device's tunnel or direct route is
//! owned by exactly one server. The routing table records that ownership;
//! when a relay request lands on the wrong server, the connection is handed
//! to the owner over an outbound WebSocket and frames are piped verbatim.
//! Forwarded requests carry the `rauth=1` marker so the receiving server
//! never forwards them a second time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as PeerMessage;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::RelayError;
use crate::relay::RelayQuery;

/// Node id → owning server id. Maintained by the surrounding system as
/// devices connect and disconnect; entries are explicit, never inferred.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<HashMap<String, String>>,
}

impl RoutingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_owner(&self, node_id: &str, server_id: &str) {
        self.inner
            .write()
            .await
            .insert(node_id.to_string(), server_id.to_string());
    }

    pub async fn clear(&self, node_id: &str) {
        self.inner.write().await.remove(node_id);
    }

    pub async fn owner(&self, node_id: &str) -> Option<String> {
        self.inner.read().await.get(node_id).cloned()
    }
}

/// Peer-dispatch collaborator: carries a client connection to the cluster
/// peer that owns the device's route.
#[async_trait]
pub trait PeerDispatch: Send + Sync {
    async fn relay_via_peer(
        &self,
        server_id: &str,
        client: WebSocket,
        query: &RelayQuery,
    ) -> Result<(), RelayError>;
}

/// Dispatch used in single-server deployments: there is nobody to hand to.
pub struct NoPeers;

#[async_trait]
impl PeerDispatch for NoPeers {
    async fn relay_via_peer(
        &self,
        server_id: &str,
        _client: WebSocket,
        _query: &RelayQuery,
    ) -> Result<(), RelayError> {
        Err(RelayError::Peer(format!(
            "no peer endpoint configured for server {server_id}"
        )))
    }
}

/// Outbound-WebSocket dispatch: dials the peer's own `/relay` endpoint with
/// the original query (plus the `rauth` marker) and pipes frames both ways.
pub struct WsPeerDispatch {
    peers: HashMap<String, String>,
}

impl WsPeerDispatch {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            peers: config.peers.clone(),
        }
    }
}

#[async_trait]
impl PeerDispatch for WsPeerDispatch {
    async fn relay_via_peer(
        &self,
        server_id: &str,
        client: WebSocket,
        query: &RelayQuery,
    ) -> Result<(), RelayError> {
        let base = self.peers.get(server_id).ok_or_else(|| {
            RelayError::Peer(format!("unknown peer server {server_id}"))
        })?;

        let url = format!(
            "{}/relay?node={}&p={}&tls1only={}&token={}&rauth=1",
            base,
            query.node,
            query.p.unwrap_or(1),
            query.tls1only.unwrap_or(0),
            query.token,
        );
        let (peer_ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Peer(e.to_string()))?;
        info!(server = %server_id, node = %query.node, "Peer relay established");

        pipe_to_peer(client, peer_ws).await;
        Ok(())
    }
}

/// Pipe frames between a client socket and a peer socket until either side
/// closes. Frame payloads cross untouched; only the frame-type envelope is
/// translated between the two WebSocket libraries.
async fn pipe_to_peer(
    client: WebSocket,
    peer: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_sink, mut client_stream) = client.split();
    let (mut peer_sink, mut peer_stream) = peer.split();

    loop {
        tokio::select! {
            msg = client_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                let forward = match msg {
                    ClientMessage::Binary(data) => PeerMessage::Binary(data),
                    ClientMessage::Text(text) => PeerMessage::Text(text.to_string().into()),
                    ClientMessage::Close(_) => break,
                    _ => continue,
                };
                if peer_sink.send(forward).await.is_err() {
                    break;
                }
            }
            msg = peer_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                let forward = match msg {
                    PeerMessage::Binary(data) => ClientMessage::Binary(data),
                    PeerMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                    PeerMessage::Close(_) => break,
                    _ => continue,
                };
                if client_sink.send(forward).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = peer_sink.send(PeerMessage::Close(None)).await;
    let _ = client_sink.send(ClientMessage::Close(None)).await;
    debug!("Peer relay pipe closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routing_table_ownership() {
        let table = RoutingTable::new();
        assert!(table.owner("node/default/a").await.is_none());

        table.set_owner("node/default/a", "relay-2").await;
        assert_eq!(
            table.owner("node/default/a").await.as_deref(),
            Some("relay-2")
        );

        table.set_owner("node/default/a", "relay-3").await;
        assert_eq!(
            table.owner("node/default/a").await.as_deref(),
            Some("relay-3")
        );

        table.clear("node/default/a").await;
        assert!(table.owner("node/default/a").await.is_none());
    }

    #[test]
    fn test_ws_peer_dispatch_knows_configured_peers() {
        let mut peers = HashMap::new();
        peers.insert("relay-2".to_string(), "wss://relay-2".to_string());
        let dispatch = WsPeerDispatch {
            peers,
        };
        assert!(dispatch.peers.contains_key("relay-2"));
        assert!(!dispatch.peers.contains_key("relay-9"));
    }
}
