//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::activation::{CertSigner, NoCertSigner};
use crate::auth::{Authorizer, PresharedKeyAuthorizer};
use crate::cluster::{NoPeers, PeerDispatch, RoutingTable, WsPeerDispatch};
use crate::config::Config;
use crate::devices::{DeviceEventSink, DeviceStore, LogEventSink, MemoryDeviceStore};
use crate::mps::{NoTunnelPool, TunnelPool};
use crate::relay::interceptor::{InterceptorFactory, NoInterceptors};
use crate::relay::RelayRegistry;

/// Shared application state for the relay server.
///
/// The collaborator fields (`devices`, `events`, `tunnels`, `authorizer`,
/// `peers`, `interceptors`, `signer`) are the seams to the surrounding
/// system; [`AppState::new`] wires in-process defaults suitable for a
/// standalone single-server deployment, and embedders replace them before
/// building the router.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live relay sessions, insert-on-create / remove-on-teardown.
    pub registry: RelayRegistry,
    /// Node id → owning cluster server.
    pub routing: Arc<RoutingTable>,
    /// Durable device record store.
    pub devices: Arc<dyn DeviceStore>,
    /// Creation/change event fan-out.
    pub events: Arc<dyn DeviceEventSink>,
    /// Manageability-server tunnel channel pool.
    pub tunnels: Arc<dyn TunnelPool>,
    /// Token → caller resolution and device permission checks.
    pub authorizer: Arc<dyn Authorizer>,
    /// Hand-off to cluster peers owning a device's route.
    pub peers: Arc<dyn PeerDispatch>,
    /// Per-purpose protocol interceptor construction.
    pub interceptors: Arc<dyn InterceptorFactory>,
    /// ACM activation request signing.
    pub signer: Arc<dyn CertSigner>,
}

impl AppState {
    /// Build state with in-process default collaborators.
    pub fn new(config: Config) -> Self {
        let peers: Arc<dyn PeerDispatch> = if config.cluster.peers.is_empty() {
            Arc::new(NoPeers)
        } else {
            Arc::new(WsPeerDispatch::new(&config.cluster))
        };
        let authorizer = Arc::new(PresharedKeyAuthorizer::new(config.auth.api_key.clone()));

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry: RelayRegistry::new(),
            routing: RoutingTable::new(),
            devices: MemoryDeviceStore::new(),
            events: Arc::new(LogEventSink),
            tunnels: Arc::new(NoTunnelPool),
            authorizer,
            peers,
            interceptors: Arc::new(NoInterceptors),
            signer: Arc::new(NoCertSigner),
        }
    }
}
