//! Activation handshake engine.
//!
//! A small state machine per client connection, driven by inbound JSON
//! commands, provisioning a device's management identity:
//!
//! ```text
//! idle → discovered → activating → {activated, failed}
//! ```
//!
//! ## Message types (client → server)
//!
//! | Action                | Effect                                          |
//! |-----------------------|-------------------------------------------------|
//! | `amtdiscover`         | validate device report; pick prospective mode.  |
//! |                       | A device reporting a nonzero `currentMode` is   |
//! |                       | already provisioned and its record is upserted  |
//! |                       | directly.                                       |
//! | `ccmactivate`         | return the digest credential for CCM setup      |
//! | `acmactivate`         | return the signed activation request (or a CCM  |
//! |                       | downgrade when no trusted certificate matches)  |
//! | `*activate-success`   | create or update the device record, emit event  |
//! | `*activate-failed`    | log and finish; no record mutation              |
//!
//! Responses carry the originating `action`; errors are structured as
//! `{action, error}`. Validation and policy failures close the connection.

pub mod policy;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{AuthDecision, Authorizer};
use crate::config::{DomainConfig, TrustedCert};
use crate::devices::{amt_flags, AmtInfo, DeviceEventSink, DeviceRecord, DeviceStore};
use crate::error::ActivationError;
use crate::state::AppState;
use crate::util::now_ms;
use policy::{ActivationMode, DiscoverInfo, ModeDecision};

/// Certificate-signing collaborator for ACM activation. Produces the opaque
/// signed activation request the device consumes; the engine returns it to
/// the client unmodified.
#[async_trait]
pub trait CertSigner: Send + Sync {
    async fn sign_activation_request(
        &self,
        info: &DiscoverInfo,
        matched: &TrustedCert,
        password: &str,
    ) -> Result<Value, ActivationError>;
}

/// Signer used when no signing authority is attached: ACM fails cleanly and
/// devices can still activate in CCM.
pub struct NoCertSigner;

#[async_trait]
impl CertSigner for NoCertSigner {
    async fn sign_activation_request(
        &self,
        _info: &DiscoverInfo,
        _matched: &TrustedCert,
        _password: &str,
    ) -> Result<Value, ActivationError> {
        Err(ActivationError::NoSigner)
    }
}

/// Query parameters for the activation WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct ActivationQuery {
    pub token: String,
    /// Device group to activate into; defaults to the caller's group.
    pub domain: Option<String>,
}

/// Per-connection handshake progress.
enum HandshakeState {
    Idle,
    Discovered {
        info: DiscoverInfo,
        decision: ModeDecision,
    },
    Activating {
        info: DiscoverInfo,
        mode: ActivationMode,
        password: String,
    },
    Activated,
    Failed,
}

/// Whether the connection stays open after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// The handshake state machine for one client connection.
///
/// Owns no transport: [`handle`](Self::handle) consumes one parsed command
/// and returns the responses to send plus whether to keep the connection.
struct HandshakeEngine {
    devices: Arc<dyn DeviceStore>,
    events: Arc<dyn DeviceEventSink>,
    signer: Arc<dyn CertSigner>,
    domain: DomainConfig,
    client_addr: String,
    state: HandshakeState,
}

fn error_value(action: &str, error: &ActivationError) -> Value {
    json!({"action": action, "error": error.to_string()})
}

impl HandshakeEngine {
    fn new(
        devices: Arc<dyn DeviceStore>,
        events: Arc<dyn DeviceEventSink>,
        signer: Arc<dyn CertSigner>,
        domain: DomainConfig,
        client_addr: String,
    ) -> Self {
        Self {
            devices,
            events,
            signer,
            domain,
            client_addr,
            state: HandshakeState::Idle,
        }
    }

    /// Process one inbound command.
    async fn handle(&mut self, msg: &Value) -> (Vec<Value>, Flow) {
        let action = msg["action"].as_str().unwrap_or("").to_string();
        match action.as_str() {
            "amtdiscover" => self.on_discover(msg).await,
            "ccmactivate" | "acmactivate" => self.on_activate(&action).await,
            "ccmactivate-success" | "acmactivate-success" => self.on_success(&action).await,
            "ccmactivate-failed" | "acmactivate-failed" => self.on_failed(&action, msg),
            _ => {
                let err = ActivationError::UnknownCommand(action.clone());
                warn!(client = %self.client_addr, "Activation: {err}");
                (vec![error_value("error", &err)], Flow::Close)
            }
        }
    }

    async fn on_discover(&mut self, msg: &Value) -> (Vec<Value>, Flow) {
        let info = match policy::validate_discover(msg) {
            Ok(info) => info,
            Err(e) => {
                warn!(client = %self.client_addr, "Discover rejected: {e}");
                self.state = HandshakeState::Idle;
                return (vec![error_value("amtdiscover", &e)], Flow::Close);
            }
        };

        let decision =
            policy::decide_mode(self.domain.activation, &self.domain.trusted_certs, &info);
        info!(
            uuid = %info.uuid,
            fqdn = %info.fqdn,
            mode = decision.mode.flag(),
            "Device discovered"
        );

        let ack = json!({
            "action": "amtdiscover",
            "uuid": info.uuid,
            "activationMode": decision.mode.flag(),
        });

        // A device already provisioned skips the activate exchange: register
        // its record straight away.
        if info.current_mode != 0 {
            let flags = ActivationMode::from_wire_code(info.current_mode)
                .map_or(amt_flags::CCM, ActivationMode::flag);
            self.upsert_record(&info, flags, None).await;
            self.state = HandshakeState::Activated;
            return (vec![ack], Flow::Continue);
        }

        self.state = HandshakeState::Discovered { info, decision };
        (vec![ack], Flow::Continue)
    }

    async fn on_activate(&mut self, action: &str) -> (Vec<Value>, Flow) {
        let HandshakeState::Discovered { info, decision } =
            std::mem::replace(&mut self.state, HandshakeState::Idle)
        else {
            let err = ActivationError::OutOfSequence("amtdiscover");
            return (vec![error_value(action, &err)], Flow::Close);
        };

        let mut responses = Vec::new();
        let requested_acm = action == "acmactivate";
        if requested_acm && decision.mode == ActivationMode::Ccm {
            if let Some(reason) = &decision.downgrade_reason {
                responses.push(json!({"action": "message", "msg": reason}));
            }
        }

        if let Err(e) = policy::ensure_mode_allowed(decision.mode, &info.modes) {
            warn!(uuid = %info.uuid, "Activation refused: {e}");
            responses.push(error_value(action, &e));
            self.state = HandshakeState::Failed;
            return (responses, Flow::Close);
        }

        let password = self
            .domain
            .amt_password
            .clone()
            .unwrap_or_else(policy::generate_password);

        match decision.mode {
            ActivationMode::Acm => {
                let Some(matched) = decision.matched.as_ref() else {
                    // decide_mode only selects ACM with a matched entry.
                    let e = ActivationError::ModeNotAllowed;
                    responses.push(error_value(action, &e));
                    self.state = HandshakeState::Failed;
                    return (responses, Flow::Close);
                };
                match self
                    .signer
                    .sign_activation_request(&info, matched, &password)
                    .await
                {
                    Ok(signed) => {
                        info!(uuid = %info.uuid, "ACM activation request signed");
                        // The signed request goes back to the client untouched.
                        responses.push(signed);
                    }
                    Err(e) => {
                        warn!(uuid = %info.uuid, "ACM signing failed: {e}");
                        responses.push(error_value(action, &e));
                        self.state = HandshakeState::Failed;
                        return (responses, Flow::Close);
                    }
                }
            }
            ActivationMode::Ccm => {
                info!(uuid = %info.uuid, client = %self.client_addr, "CCM activation issued");
                responses.push(json!({
                    "action": "ccmactivate",
                    "password": policy::digest_response("admin", &info.realm, &password),
                }));
            }
        }

        self.state = HandshakeState::Activating {
            info,
            mode: decision.mode,
            password,
        };
        (responses, Flow::Continue)
    }

    async fn on_success(&mut self, action: &str) -> (Vec<Value>, Flow) {
        let HandshakeState::Activating {
            info,
            mode,
            password,
        } = std::mem::replace(&mut self.state, HandshakeState::Idle)
        else {
            let err = ActivationError::OutOfSequence("ccmactivate or acmactivate");
            return (vec![error_value(action, &err)], Flow::Close);
        };

        info!(uuid = %info.uuid, mode = mode.flag(), "Activation succeeded");
        self.upsert_record(&info, mode.flag(), Some(&password)).await;
        self.state = HandshakeState::Activated;
        (vec![json!({"action": action, "status": "ok"})], Flow::Close)
    }

    fn on_failed(&mut self, action: &str, msg: &Value) -> (Vec<Value>, Flow) {
        warn!(
            time = now_ms(),
            action,
            uuid = msg["uuid"].as_str().unwrap_or(""),
            client = %self.client_addr,
            "Activation failed on device"
        );
        self.state = HandshakeState::Failed;
        (Vec::new(), Flow::Close)
    }

    /// Create or update the device record for a finished activation and emit
    /// the corresponding event. The administrative credential never appears
    /// in event payloads.
    async fn upsert_record(&self, info: &DiscoverInfo, flags: u32, password: Option<&str>) {
        let host = self
            .client_addr
            .rsplit_once(':')
            .map_or(self.client_addr.clone(), |(h, _)| h.to_string());

        if let Some(mut existing) = self.devices.find_by_uuid(&self.domain.id, &info.uuid).await {
            // A record without a management identity gains one here, which is
            // itself a change even if every compared field ends up equal.
            let mut changed = existing.amt.is_none();
            if existing.host != host {
                existing.host = host;
                changed = true;
            }
            if !info.fqdn.is_empty() && existing.name != info.fqdn {
                existing.name = info.fqdn.clone();
                changed = true;
            }
            let amt = existing.amt.get_or_insert_with(|| AmtInfo {
                user: "admin".to_string(),
                pass: String::new(),
                realm: info.realm.clone(),
                tag: String::new(),
                ver: info.ver.clone(),
                sku: info.sku,
                flags,
                tls: false,
            });
            if amt.flags != flags {
                amt.flags = flags;
                changed = true;
            }
            if let Some(p) = password {
                if amt.pass != p {
                    amt.pass = p.to_string();
                    changed = true;
                }
            }
            if amt.realm != info.realm {
                amt.realm = info.realm.clone();
                changed = true;
            }
            if let Some(tag) = &info.tag {
                if amt.tag != *tag {
                    amt.tag = tag.clone();
                    changed = true;
                }
            }
            if amt.ver != info.ver {
                amt.ver = info.ver.clone();
                changed = true;
            }
            if amt.sku != info.sku {
                amt.sku = info.sku;
                changed = true;
            }
            if changed {
                let event = json!({
                    "event": "device.changed",
                    "node": existing.to_event_value(),
                });
                self.devices.set(existing).await;
                self.events.dispatch(event);
            }
            return;
        }

        let record = DeviceRecord {
            id: format!("node/{}/{}", self.domain.id, Uuid::new_v4().simple()),
            domain: self.domain.id.clone(),
            uuid: info.uuid.clone(),
            name: info.fqdn.clone(),
            host,
            conn: 0,
            amt: Some(AmtInfo {
                user: "admin".to_string(),
                pass: password.unwrap_or_default().to_string(),
                realm: info.realm.clone(),
                tag: info.tag.clone().unwrap_or_default(),
                ver: info.ver.clone(),
                sku: info.sku,
                flags,
                tls: false,
            }),
        };
        let event = json!({
            "event": "device.created",
            "node": record.to_event_value(),
        });
        self.devices.set(record).await;
        self.events.dispatch(event);
    }
}

/// `GET /activate` — activation WebSocket upgrade handler.
pub async fn activation_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ActivationQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_activation(socket, state, query, addr)
            .instrument(info_span!("activation", client = %addr))
    })
}

async fn handle_activation(
    mut socket: axum::extract::ws::WebSocket,
    state: AppState,
    query: ActivationQuery,
    addr: SocketAddr,
) {
    let caller = match state.authorizer.authenticate(&query.token) {
        AuthDecision::Allowed(caller) => caller,
        AuthDecision::NoAuth | AuthDecision::Banned => {
            let msg = json!({"action": "close", "cause": "noauth", "msg": "access denied"});
            let _ = socket
                .send(axum::extract::ws::Message::Text(msg.to_string().into()))
                .await;
            return;
        }
    };

    let domain_id = query.domain.unwrap_or(caller.domain_id);
    let Some(domain) = state.config.domain(&domain_id).cloned() else {
        let err = ActivationError::UnknownDomain(domain_id);
        warn!(client = %addr, "Activation refused: {err}");
        let _ = socket
            .send(axum::extract::ws::Message::Text(
                error_value("error", &err).to_string().into(),
            ))
            .await;
        return;
    };

    let mut engine = HandshakeEngine::new(
        state.devices.clone(),
        state.events.clone(),
        state.signer.clone(),
        domain,
        addr.to_string(),
    );

    let (mut ws_sink, mut ws_stream) = socket.split();
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let err = ActivationError::Invalid {
                        field: "message",
                        reason: "not valid JSON".to_string(),
                    };
                    let _ = ws_sink
                        .send(axum::extract::ws::Message::Text(
                            error_value("error", &err).to_string().into(),
                        ))
                        .await;
                    break;
                };

                let (responses, flow) = engine.handle(&parsed).await;
                for response in responses {
                    if ws_sink
                        .send(axum::extract::ws::Message::Text(
                            response.to_string().into(),
                        ))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if flow == Flow::Close {
                    break;
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws_sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationPolicy;
    use crate::devices::MemoryDeviceStore;
    use std::sync::Mutex;

    struct CapturingSink {
        events: Mutex<Vec<Value>>,
    }

    impl DeviceEventSink for CapturingSink {
        fn dispatch(&self, event: Value) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct TestSigner;

    #[async_trait]
    impl CertSigner for TestSigner {
        async fn sign_activation_request(
            &self,
            info: &DiscoverInfo,
            _matched: &TrustedCert,
            _password: &str,
        ) -> Result<Value, ActivationError> {
            Ok(json!({"action": "acmactivate", "signed": true, "uuid": info.uuid}))
        }
    }

    fn domain(policy: ActivationPolicy, password: Option<&str>) -> DomainConfig {
        DomainConfig {
            id: "default".to_string(),
            activation: policy,
            amt_password: password.map(ToString::to_string),
            recording: None,
            trusted_certs: vec![TrustedCert {
                common_name: "mgmt.example.com".to_string(),
                sha256: "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
                    .to_string(),
                sha1: String::new(),
            }],
        }
    }

    fn engine(
        policy: ActivationPolicy,
        password: Option<&str>,
    ) -> (HandshakeEngine, Arc<MemoryDeviceStore>, Arc<CapturingSink>) {
        let store = MemoryDeviceStore::new();
        let sink = Arc::new(CapturingSink {
            events: Mutex::new(Vec::new()),
        });
        let engine = HandshakeEngine::new(
            store.clone(),
            sink.clone(),
            Arc::new(TestSigner),
            domain(policy, password),
            "10.1.2.3:40001".to_string(),
        );
        (engine, store, sink)
    }

    fn discover_msg() -> Value {
        json!({
            "action": "amtdiscover",
            "version": 1,
            "realm": "Digest:727comput3rr34lm",
            "uuid": "12345678-1234-1234-1234-123456789012",
            "hashes": ["deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"],
            "fqdn": "mgmt.example.com",
            "ver": "16.1.25",
            "modes": [1, 2],
            "currentMode": 0,
            "sku": 16392,
        })
    }

    #[tokio::test]
    async fn test_discover_selects_acm_for_matching_allowlist() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Acm, None);
        let (responses, flow) = engine.handle(&discover_msg()).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(responses[0]["action"], "amtdiscover");
        assert_eq!(responses[0]["activationMode"], 4);
        assert!(matches!(engine.state, HandshakeState::Discovered { .. }));
    }

    #[tokio::test]
    async fn test_discover_rejects_bad_uuid_and_retains_nothing() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Acm, None);
        let mut msg = discover_msg();
        msg["uuid"] = json!("12345678-1234-1234-1234-12345678901"); // 35 chars
        let (responses, flow) = engine.handle(&msg).await;
        assert_eq!(flow, Flow::Close);
        assert!(responses[0]["error"].as_str().unwrap().contains("uuid"));
        assert!(matches!(engine.state, HandshakeState::Idle));
    }

    #[tokio::test]
    async fn test_acm_activate_returns_signed_request() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Acm, Some("P@ssw0rd!x"));
        engine.handle(&discover_msg()).await;
        let (responses, flow) = engine
            .handle(&json!({"action": "acmactivate"}))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["signed"], true);
        assert!(matches!(
            engine.state,
            HandshakeState::Activating {
                mode: ActivationMode::Acm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_acm_request_downgrades_to_ccm_without_match() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Acm, Some("P@ssw0rd!x"));
        let mut msg = discover_msg();
        msg["hashes"] = json!(["cafebabecafebabe"]);
        engine.handle(&msg).await;

        let (responses, flow) = engine
            .handle(&json!({"action": "acmactivate"}))
            .await;
        assert_eq!(flow, Flow::Continue);
        // Informational downgrade message, then the CCM credential response.
        assert_eq!(responses[0]["action"], "message");
        assert_eq!(responses[1]["action"], "ccmactivate");
        let digest = responses[1]["password"].as_str().unwrap();
        assert_eq!(
            digest,
            policy::digest_response("admin", "Digest:727comput3rr34lm", "P@ssw0rd!x")
        );
        assert!(matches!(
            engine.state,
            HandshakeState::Activating {
                mode: ActivationMode::Ccm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_downgraded_mode_must_be_supported() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Acm, None);
        let mut msg = discover_msg();
        msg["hashes"] = json!(["cafebabecafebabe"]);
        msg["modes"] = json!([2]); // ACM only: CCM downgrade is not allowed
        engine.handle(&msg).await;

        let (responses, flow) = engine
            .handle(&json!({"action": "acmactivate"}))
            .await;
        assert_eq!(flow, Flow::Close);
        let last = responses.last().unwrap();
        assert!(last["error"].as_str().unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_success_creates_record_and_strips_credential_from_event() {
        let (mut engine, store, sink) = engine(ActivationPolicy::Ccm, Some("P@ssw0rd!x"));
        let mut msg = discover_msg();
        msg["modes"] = json!([1]);
        engine.handle(&msg).await;
        engine.handle(&json!({"action": "ccmactivate"})).await;
        let (responses, flow) = engine
            .handle(&json!({"action": "ccmactivate-success", "uuid": discover_msg()["uuid"]}))
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(responses[0]["status"], "ok");

        let record = store
            .find_by_uuid("default", "12345678-1234-1234-1234-123456789012")
            .await
            .unwrap();
        let amt = record.amt.as_ref().unwrap();
        assert_eq!(amt.pass, "P@ssw0rd!x");
        assert_eq!(amt.flags, amt_flags::CCM);
        assert_eq!(record.host, "10.1.2.3");

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "device.created");
        assert!(events[0]["node"]["amt"].get("pass").is_none());
    }

    #[tokio::test]
    async fn test_success_merges_existing_record_and_emits_change() {
        let (mut engine, store, sink) = engine(ActivationPolicy::Ccm, Some("P@ssw0rd!x"));
        store
            .set(DeviceRecord {
                id: "node/default/preexisting".to_string(),
                domain: "default".to_string(),
                uuid: "12345678-1234-1234-1234-123456789012".to_string(),
                name: "old-name".to_string(),
                host: "10.9.9.9".to_string(),
                conn: 0,
                amt: None,
            })
            .await;

        let mut msg = discover_msg();
        msg["modes"] = json!([1]);
        engine.handle(&msg).await;
        engine.handle(&json!({"action": "ccmactivate"})).await;
        engine
            .handle(&json!({"action": "ccmactivate-success"}))
            .await;

        let record = store.get("node/default/preexisting").await.unwrap();
        assert_eq!(record.host, "10.1.2.3");
        assert_eq!(record.name, "mgmt.example.com");
        assert_eq!(record.amt.as_ref().unwrap().pass, "P@ssw0rd!x");

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0]["event"], "device.changed");
        assert!(events[0]["node"]["amt"].get("pass").is_none());
    }

    #[tokio::test]
    async fn test_merge_persists_newly_gained_identity() {
        // Same host, no credential: the only difference is the management
        // identity itself, which must still be stored.
        let (mut engine, store, sink) = engine(ActivationPolicy::Acm, None);
        store
            .set(DeviceRecord {
                id: "node/default/bare".to_string(),
                domain: "default".to_string(),
                uuid: "12345678-1234-1234-1234-123456789012".to_string(),
                name: "bare".to_string(),
                host: "10.1.2.3".to_string(),
                conn: 0,
                amt: None,
            })
            .await;

        let mut msg = discover_msg();
        msg["currentMode"] = json!(1);
        engine.handle(&msg).await;

        let record = store.get("node/default/bare").await.unwrap();
        assert_eq!(record.amt.as_ref().unwrap().flags, amt_flags::CCM);
        assert_eq!(sink.events.lock().unwrap()[0]["event"], "device.changed");
    }

    #[tokio::test]
    async fn test_failed_logs_without_record_mutation() {
        let (mut engine, store, sink) = engine(ActivationPolicy::Ccm, None);
        let mut msg = discover_msg();
        msg["modes"] = json!([1]);
        engine.handle(&msg).await;
        engine.handle(&json!({"action": "ccmactivate"})).await;
        let (responses, flow) = engine
            .handle(&json!({"action": "ccmactivate-failed", "uuid": "x"}))
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(responses.is_empty());
        assert!(store
            .find_by_uuid("default", "12345678-1234-1234-1234-123456789012")
            .await
            .is_none());
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_activated_device_is_registered_on_discover() {
        let (mut engine, store, sink) = engine(ActivationPolicy::Acm, None);
        let mut msg = discover_msg();
        msg["currentMode"] = json!(2);
        let (_responses, flow) = engine.handle(&msg).await;
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(engine.state, HandshakeState::Activated));

        let record = store
            .find_by_uuid("default", "12345678-1234-1234-1234-123456789012")
            .await
            .unwrap();
        assert_eq!(record.amt.as_ref().unwrap().flags, amt_flags::ACM);
        assert_eq!(sink.events.lock().unwrap()[0]["event"], "device.created");
    }

    #[tokio::test]
    async fn test_activate_before_discover_is_out_of_sequence() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Ccm, None);
        let (responses, flow) = engine
            .handle(&json!({"action": "ccmactivate"}))
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(responses[0]["error"]
            .as_str()
            .unwrap()
            .contains("out of sequence"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let (mut engine, _store, _sink) = engine(ActivationPolicy::Ccm, None);
        let (responses, flow) = engine.handle(&json!({"action": "frobnicate"})).await;
        assert_eq!(flow, Flow::Close);
        assert!(responses[0]["error"]
            .as_str()
            .unwrap()
            .contains("unknown command"));
    }
}
