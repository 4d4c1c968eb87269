//! Routing selection: which of the three paths carries a relay session.
//!
//! Given the target device's connectivity flags and the cluster routing
//! table, pick one of: delegate to the cluster peer that owns the route,
//! bridge through the local manageability-server tunnel, or open a local
//! direct socket. Pure decision logic; channel construction happens in the
//! bridge.

use crate::devices::{conn, DeviceRecord};
use crate::error::RelayError;

/// The selected transport path for one relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    /// Another cluster server owns the route; hand the connection off to it.
    Peer(String),
    /// Bridge through a tunnel channel on the local manageability server.
    Tunnel,
    /// Open a direct socket from this server to the device.
    Direct,
}

/// Select the route for a relay request.
///
/// * `authorized` — result of the caller's "may manage this device" check.
/// * `route_owner` — server id owning the device's tunnel or direct route,
///   from the cluster routing table; `None` means unrouted (treat as local).
/// * `self_id` — this server's cluster id.
/// * `peer_marked` — the inbound request already carries the peer-relay
///   marker; it must not be forwarded a second time.
pub fn select_route(
    authorized: bool,
    device: &DeviceRecord,
    route_owner: Option<&str>,
    self_id: &str,
    peer_marked: bool,
) -> Result<RoutePlan, RelayError> {
    if !authorized {
        return Err(RelayError::Unauthorized);
    }
    if device.conn & (conn::TUNNEL | conn::DIRECT) == 0 {
        return Err(RelayError::Unreachable);
    }

    if let Some(owner) = route_owner {
        if owner != self_id {
            if peer_marked {
                return Err(RelayError::PeerLoop);
            }
            return Ok(RoutePlan::Peer(owner.to_string()));
        }
    }

    if device.conn & conn::TUNNEL != 0 {
        Ok(RoutePlan::Tunnel)
    } else {
        Ok(RoutePlan::Direct)
    }
}
