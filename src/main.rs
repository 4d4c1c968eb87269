#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # amtrelay
//!
//! Device channel relay and activation server.
//!
//! amtrelay bridges message-oriented client connections (browser WebSockets)
//! to out-of-band manageability endpoints on devices, across three transport
//! paths: a direct socket from this server, a tunnel channel through a
//! manageability server, or a hand-off to the cluster peer owning the
//! device's route. It also runs the activation handshake that provisions a
//! device's management identity.
//!
//! ## API surface
//!
//! | Method | Path           | Auth      | Description                       |
//! |--------|----------------|-----------|-----------------------------------|
//! | GET    | `/api/health`  | No        | Liveness probe                    |
//! | GET    | `/api/relays`  | Yes       | Live relay session listing        |
//! | GET    | `/relay`       | `?token=` | Relay WebSocket to a device       |
//! | GET    | `/activate`    | `?token=` | Activation handshake WebSocket    |
//!
//! WebSocket auth is via `?token=<key>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs            — entry point, clap, router setup, graceful shutdown
//! auth.rs            — authorization seam, Bearer middleware, constant-time compare
//! config.rs          — TOML + env-var configuration
//! state.rs           — AppState wiring collaborator seams
//! devices.rs         — device records, store + event-sink interfaces
//! mps.rs             — manageability-server tunnel channel interface
//! cluster.rs         — routing table, peer relay hand-off
//! relay/
//!   mod.rs           — WS entry point, purpose codes, session registry
//!   routing.rs       — path selection (peer / tunnel / direct)
//!   bridge.rs        — backend connect + bidirectional pump
//!   serial.rs        — tunnel-in-tunnel stream adapter for TLS
//!   interceptor.rs   — pluggable protocol interception seam
//!   recorder.rs      — binary session recording
//! activation/
//!   mod.rs           — handshake state machine, WS entry point
//!   policy.rs        — validation, mode selection, credential rules
//! routes/
//!   health.rs        — GET /api/health
//!   relays.rs        — GET /api/relays
//! ```

use std::net::SocketAddr;

use axum::{middleware, routing::get, Extension, Router};
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use amtrelay::{activation, auth, relay, routes, ApiKey, AppState, Config};

/// Device channel relay and activation server.
#[derive(Parser)]
#[command(name = "amtrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("amtrelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Cluster id: {}", config.cluster.server_id);
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set AMTRELAY_API_KEY or update config");
    }
    if config.relay.recording {
        info!("Session recording enabled, dir: {}", config.recordings_dir().display());
    }

    let state = AppState::new(config);

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/relays", get(routes::relays::list_relays))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/relay", get(relay::relay_upgrade))
        .route("/activate", get(activation::activation_upgrade));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    info!("Shutting down...");
    let open = state.registry.count().await;
    if open > 0 {
        info!("{open} relay sessions were still open");
    }
    info!("Goodbye");
}
