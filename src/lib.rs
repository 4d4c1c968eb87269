#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! amtrelay library — exposes the relay and activation engine for embedding
//! in a larger device-management application.
//!
//! Key building blocks:
//! - `relay` — channel bridge, routing selector, tunnel-in-tunnel adapter,
//!   protocol interception, binary session recording
//! - `activation` — the device activation handshake engine
//! - `auth` — caller authorization seam and API-key middleware
//! - `devices` — device records, store and event-sink interfaces
//! - `mps` — manageability-server tunnel channel interface
//! - `cluster` — routing table and peer relay hand-off
//! - `config` — configuration loading

pub mod activation;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod devices;
pub mod error;
pub mod mps;
pub mod relay;
pub mod routes;
pub mod state;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use error::{ActivationError, RelayError};
pub use relay::RelayRegistry;
pub use state::AppState;
