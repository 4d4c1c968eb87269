//! Caller authentication and device-level authorization.
//!
//! REST endpoints require an `Authorization: Bearer <key>` header. WebSocket
//! paths use a `?token=` query parameter instead (browsers can't set headers
//! on WebSocket upgrades).
//!
//! The surrounding system owns accounts, sessions, and rights computation;
//! this engine only consumes the result through the [`Authorizer`] trait: a
//! token resolves to a caller with permission bits, and a caller either may
//! or may not manage a given device. The default implementation validates a
//! single pre-shared key and grants full rights, which is what single-tenant
//! deployments use.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Permission bits attached to a caller for a given device.
pub mod rights {
    /// May edit device metadata.
    pub const EDIT: u32 = 1;
    /// May manage group membership.
    pub const MANAGE: u32 = 4;
    /// Minimum right required to open a relay session to a device.
    pub const REMOTE_CONTROL: u32 = 8;
    /// All rights.
    pub const ALL: u32 = u32::MAX;
}

/// An authenticated caller, as resolved from a connection token.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub domain_id: String,
    /// Permission bits from the [`rights`] module.
    pub rights: u32,
}

impl Caller {
    /// Whether the caller holds the minimum remote-control permission.
    pub fn may_remote_control(&self) -> bool {
        self.rights & rights::REMOTE_CONTROL != 0
    }
}

/// Outcome of resolving a connection token.
#[derive(Debug)]
pub enum AuthDecision {
    Allowed(Caller),
    /// Token missing, expired, or invalid.
    NoAuth,
    /// Token valid but the account is banned.
    Banned,
}

/// Authenticated-session lookup collaborator.
///
/// Implemented outside this engine by the surrounding web application; the
/// engine never inspects tokens itself beyond handing them to this trait.
pub trait Authorizer: Send + Sync {
    /// Resolve a connection token to a caller.
    fn authenticate(&self, token: &str) -> AuthDecision;

    /// Opaque "may manage this device" check for a resolved caller.
    fn may_manage(&self, caller: &Caller, node_id: &str) -> bool;
}

/// Single pre-shared-key authorizer granting full rights on every device.
pub struct PresharedKeyAuthorizer {
    api_key: String,
}

impl PresharedKeyAuthorizer {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

impl Authorizer for PresharedKeyAuthorizer {
    fn authenticate(&self, token: &str) -> AuthDecision {
        if constant_time_eq(self.api_key.as_bytes(), token.as_bytes()) {
            AuthDecision::Allowed(Caller {
                user_id: "admin".to_string(),
                domain_id: "default".to_string(),
                rights: rights::ALL,
            })
        } else {
            AuthDecision::NoAuth
        }
    }

    fn may_manage(&self, caller: &Caller, _node_id: &str) -> bool {
        caller.may_remote_control()
    }
}

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but invalid
/// - `500 Internal Server Error` — [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let api_key = match request.extensions().get::<ApiKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let provided = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid Authorization header"})),
            )
                .into_response();
        }
    };

    if !constant_time_eq(api_key.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected key length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_preshared_key_authorizer() {
        let auth = PresharedKeyAuthorizer::new("k3y".to_string());
        match auth.authenticate("k3y") {
            AuthDecision::Allowed(caller) => {
                assert!(caller.may_remote_control());
                assert!(auth.may_manage(&caller, "node/default/abc"));
            }
            _ => panic!("expected Allowed"),
        }
        assert!(matches!(auth.authenticate("wrong"), AuthDecision::NoAuth));
    }

    #[test]
    fn test_rights_check() {
        let caller = Caller {
            user_id: "u".into(),
            domain_id: "default".into(),
            rights: rights::EDIT,
        };
        assert!(!caller.may_remote_control());
    }
}
