//! Live relay session listing.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/relays` — dump the relay session registry.
///
/// One entry per live session: session id, user, target node, purpose code,
/// transport kind, client address, start time, and the live per-direction
/// byte counters.
pub async fn list_relays(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.registry.list().await;
    let mut list: Vec<Value> = Vec::with_capacity(sessions.len());
    for s in &sessions {
        list.push(json!({
            "id": s.id,
            "userid": s.user_id,
            "nodeid": s.node_id,
            "p": s.purpose,
            "transport": s.transport,
            "client": s.client_addr,
            "started_ms": s.started_ms,
            "bytes_to_device": s.bytes_to_device.load(Ordering::Relaxed),
            "bytes_to_client": s.bytes_to_client.load(Ordering::Relaxed),
        }));
    }
    Json(json!({"relays": list}))
}
