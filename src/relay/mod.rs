//! Device channel relay engine.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /relay?node=<id>&p=<purpose>&token=<key>` —
//!    the token is resolved through the authorization collaborator.
//! 2. The routing selector picks one of three paths: hand off to the cluster
//!    peer owning the device's route, bridge through a local
//!    manageability-server tunnel channel, or open a local direct socket.
//! 3. For local paths the channel bridge forwards raw frames both ways,
//!    through the per-purpose protocol interceptor and the session recorder
//!    when attached, until either side closes.
//!
//! ## Query parameters
//!
//! | Param      | Meaning                                                   |
//! |------------|-----------------------------------------------------------|
//! | `node`     | target device identifier                                  |
//! | `p`        | relay purpose: 1 = management, 2 = redirection, 3 =       |
//! |            | management without embedded auth, 4 = redirection direct  |
//! | `tls1only` | `1` forces the legacy TLS protocol version                |
//! | `rauth`    | peer-relay marker, set only by peer servers               |
//! | `token`    | caller's connection token                                 |

pub mod bridge;
pub mod interceptor;
pub mod recorder;
pub mod routing;
pub mod serial;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, info_span, warn, Instrument};

use crate::auth::{AuthDecision, Authorizer};
use crate::cluster::PeerDispatch;
use crate::devices::DeviceStore;
use crate::relay::bridge::{run_bridge, RelayFrame};
use crate::relay::interceptor::InterceptorFactory;
use crate::relay::recorder::SessionRecorder;
use crate::relay::routing::RoutePlan;
use crate::state::AppState;
use crate::util::now_ms;

/// What a relay session carries, from the `p` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPurpose {
    /// Management protocol with embedded server auth.
    ManagementAuth = 1,
    /// Redirection protocol (KVM/serial/storage) with embedded server auth.
    RedirectionAuth = 2,
    /// Management protocol without embedded server auth.
    ManagementNoAuth = 3,
    /// Redirection protocol on a direct path.
    RedirectionDirect = 4,
}

impl RelayPurpose {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::ManagementAuth),
            2 => Some(Self::RedirectionAuth),
            3 => Some(Self::ManagementNoAuth),
            4 => Some(Self::RedirectionDirect),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Redirection purposes target the base+2 device ports.
    pub fn is_redirection(self) -> bool {
        matches!(self, Self::RedirectionAuth | Self::RedirectionDirect)
    }
}

/// Query parameters for the relay WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayQuery {
    /// Target device identifier.
    pub node: String,
    /// Relay purpose code (default 1 = management).
    pub p: Option<u8>,
    /// Caller's connection token.
    pub token: String,
    /// Force the legacy TLS protocol version.
    pub tls1only: Option<u8>,
    /// Peer-relay marker; requests carrying it are never forwarded again.
    pub rauth: Option<u8>,
}

/// Summary of one live relay session, kept in the registry.
#[derive(Debug, Clone)]
pub struct RelaySessionInfo {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub purpose: u8,
    pub transport: &'static str,
    pub client_addr: String,
    pub started_ms: u64,
    /// Bytes forwarded client → device, updated live by the bridge pump.
    pub bytes_to_device: Arc<AtomicU64>,
    /// Bytes forwarded device → client, updated live by the bridge pump.
    pub bytes_to_client: Arc<AtomicU64>,
}

/// Live relay sessions, keyed by session id. Sessions insert themselves on
/// creation and remove themselves on teardown; there is no sweeper.
#[derive(Clone, Default)]
pub struct RelayRegistry {
    sessions: Arc<RwLock<HashMap<String, RelaySessionInfo>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, info: RelaySessionInfo) {
        self.sessions.write().await.insert(info.id.clone(), info);
    }

    pub async fn remove(&self, id: &str) -> Option<RelaySessionInfo> {
        self.sessions.write().await.remove(id)
    }

    pub async fn list(&self) -> Vec<RelaySessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// `GET /relay` — relay WebSocket upgrade handler.
///
/// Authorization happens after the upgrade so refused callers can receive a
/// structured close message over the socket.
pub async fn relay_upgrade(
    State(state): State<AppState>,
    Query(query): Query<RelayQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let node = query.node.clone();
    ws.on_upgrade(move |socket| {
        handle_relay(socket, state, query, addr).instrument(info_span!("relay", node = %node))
    })
}

/// Send the structured refusal message, then close. Cause values are part of
/// the wire contract (`noauth`, `banned`).
async fn send_close(mut socket: axum::extract::ws::WebSocket, cause: &str) {
    let msg = json!({"action": "close", "cause": cause, "msg": format!("access denied ({cause})")});
    let _ = socket
        .send(axum::extract::ws::Message::Text(msg.to_string().into()))
        .await;
    let _ = socket.send(axum::extract::ws::Message::Close(None)).await;
}

/// Full lifecycle of one relay client connection.
async fn handle_relay(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    query: RelayQuery,
    addr: SocketAddr,
) {
    let caller = match state.authorizer.authenticate(&query.token) {
        AuthDecision::Allowed(caller) => caller,
        AuthDecision::NoAuth => {
            warn!(client = %addr, "Relay refused: no auth");
            send_close(socket, "noauth").await;
            return;
        }
        AuthDecision::Banned => {
            warn!(client = %addr, "Relay refused: banned");
            send_close(socket, "banned").await;
            return;
        }
    };

    let Some(purpose) = RelayPurpose::from_code(query.p.unwrap_or(1)) else {
        warn!(client = %addr, p = query.p, "Relay refused: bad purpose code");
        return;
    };

    let Some(device) = state.devices.get(&query.node).await else {
        let e = crate::error::RelayError::UnknownDevice(query.node.clone());
        warn!(client = %addr, "Relay refused: {e}");
        return;
    };

    let authorized = state.authorizer.may_manage(&caller, &device.id);
    let route_owner = state.routing.owner(&device.id).await;
    let peer_marked = query.rauth.unwrap_or(0) != 0;
    let plan = match routing::select_route(
        authorized,
        &device,
        route_owner.as_deref(),
        &state.config.cluster.server_id,
        peer_marked,
    ) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(client = %addr, "Relay refused: {e}");
            if let Some(cause) = e.close_cause() {
                send_close(socket, cause).await;
            }
            // Connectivity refusals close silently: no topology leaks, no
            // relay loops.
            return;
        }
    };

    if let RoutePlan::Peer(server) = &plan {
        info!(server = %server, "Delegating relay to cluster peer");
        if let Err(e) = state.peers.relay_via_peer(server, socket, &query).await {
            warn!(server = %server, "Peer delegation failed: {e}");
        }
        return;
    }

    let tls1only = query.tls1only.unwrap_or(0) != 0;
    let (backend, transport) = match &plan {
        RoutePlan::Tunnel => {
            match bridge::connect_tunnel(
                state.tunnels.as_ref(),
                &device.id,
                &device.host,
                purpose,
                tls1only,
            )
            .await
            {
                Ok(b) => (b, "tunnel"),
                Err(e) => {
                    warn!("Tunnel backend failed: {e}");
                    return;
                }
            }
        }
        RoutePlan::Direct => {
            let tls = device.amt.as_ref().is_some_and(|a| a.tls);
            match bridge::connect_direct(&device.host, purpose, tls, tls1only).await {
                Ok(b) => (b, if tls { "direct-tls" } else { "direct-tcp" }),
                Err(e) => {
                    warn!("Direct backend failed: {e}");
                    return;
                }
            }
        }
        RoutePlan::Peer(_) => unreachable!("peer plan handled above"),
    };

    let interceptor = state
        .interceptors
        .for_session(purpose, device.amt.as_ref());

    let session_id = uuid::Uuid::new_v4().to_string();
    let recorder = if state.config.recording_enabled(&device.domain) {
        let path = state.config.recordings_dir().join(format!("{session_id}.rec"));
        let header = json!({
            "userid": caller.user_id,
            "nodeid": device.id,
            "protocol": purpose.code(),
            "client": addr.to_string(),
            "time": now_ms(),
        });
        match SessionRecorder::open(&path, &header).await {
            Ok(r) => Some(r),
            Err(e) => {
                // Recording failures never take the relay down.
                warn!("Recording disabled for session: {e}");
                None
            }
        }
    } else {
        None
    };

    let counters = bridge::TrafficCounters::default();
    state
        .registry
        .insert(RelaySessionInfo {
            id: session_id.clone(),
            user_id: caller.user_id.clone(),
            node_id: device.id.clone(),
            purpose: purpose.code(),
            transport,
            client_addr: addr.to_string(),
            started_ms: now_ms(),
            bytes_to_device: counters.to_device.clone(),
            bytes_to_client: counters.to_client.clone(),
        })
        .await;
    info!(session = %session_id, transport, "Relay session open");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayFrame>();

    // Device-bound bytes flow through the bridge; client-bound bytes funnel
    // through out_rx so the bridge never touches the socket directly.
    let send_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sink
                .send(axum::extract::ws::Message::Binary(data.into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let bridge_task = tokio::spawn(run_bridge(
        backend,
        in_rx,
        out_tx,
        interceptor,
        recorder,
        counters,
    ));

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Binary(data) => {
                if in_tx
                    .send(RelayFrame {
                        data: data.to_vec(),
                        binary: true,
                    })
                    .is_err()
                {
                    break;
                }
            }
            axum::extract::ws::Message::Text(text) => {
                if in_tx
                    .send(RelayFrame {
                        data: text.as_bytes().to_vec(),
                        binary: false,
                    })
                    .is_err()
                {
                    break;
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    // Client side ended (or the bridge dropped its receiver): closing the
    // frame channel is what triggers backend + recorder teardown.
    drop(in_tx);
    match bridge_task.await {
        Ok(Ok(())) => info!(session = %session_id, "Relay session closed"),
        Ok(Err(e)) => warn!(session = %session_id, "Relay session failed: {e}"),
        Err(_) => warn!(session = %session_id, "Relay bridge task panicked"),
    }
    // The bridge dropped its sender; the sender task drains any client-bound
    // bytes still queued, then closes the socket.
    let _ = send_task.await;
    state.registry.remove(&session_id).await;
}
