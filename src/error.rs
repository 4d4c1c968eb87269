//! Typed failure taxonomy for relay sessions and activation handshakes.
//!
//! Relay failures all funnel into session teardown; the variants exist so the
//! close path can decide whether to send a structured close message to the
//! client first (authorization failures) or close silently (routing
//! failures, which must not leak cluster topology or enable relay loops).

use thiserror::Error;

/// Errors that terminate a relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Caller lacks the remote-control permission on the target device.
    #[error("caller is not authorized to manage this device")]
    Unauthorized,

    /// Caller is banned outright.
    #[error("caller is banned")]
    Banned,

    /// Device connectivity flags advertise no usable path.
    #[error("no reachable path to the device")]
    Unreachable,

    /// The request already carries a peer-relay marker but would need another
    /// hop. Closed silently to prevent relay loops.
    #[error("request already relayed once by a cluster peer")]
    PeerLoop,

    /// No device record exists for the requested identifier.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Hand-off to a cluster peer failed.
    #[error("peer dispatch failed: {0}")]
    Peer(String),

    /// The manageability-server tunnel channel failed or was refused.
    #[error("tunnel channel error: {0}")]
    Tunnel(String),

    /// Socket-level failure on the backend connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// A protocol interceptor rejected the stream. Treated exactly like a
    /// transport failure: full teardown, never propagated as a panic.
    #[error("interceptor error: {0}")]
    Interceptor(String),
}

impl RelayError {
    /// Close cause sent to the client before disconnecting, if any.
    /// Routing and transport failures close silently.
    pub fn close_cause(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized => Some("noauth"),
            Self::Banned => Some("banned"),
            _ => None,
        }
    }
}

/// Errors raised by the activation handshake engine.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// A discover/activate field failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// The negotiated activation mode is not in the device's supported list.
    #[error("activation mode not allowed for this device")]
    ModeNotAllowed,

    /// ACM requested but no signing authority is configured.
    #[error("no certificate signing authority configured")]
    NoSigner,

    /// The signing collaborator failed to produce an activation request.
    #[error("activation request signing failed: {0}")]
    Signer(String),

    /// Command verb not recognized by the state machine.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Command arrived in a state that does not accept it.
    #[error("command out of sequence: expected {0}")]
    OutOfSequence(&'static str),

    /// The device group named in the handshake does not exist.
    #[error("unknown device group: {0}")]
    UnknownDomain(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_cause_auth_only() {
        assert_eq!(RelayError::Unauthorized.close_cause(), Some("noauth"));
        assert_eq!(RelayError::Banned.close_cause(), Some("banned"));
        assert_eq!(RelayError::Unreachable.close_cause(), None);
        assert_eq!(RelayError::PeerLoop.close_cause(), None);
    }
}
