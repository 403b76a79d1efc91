mod admission;
mod api;
mod config;
mod directory;
mod error;
mod protocol;
mod relay_tree;
mod session;
mod signaling;
mod store;
mod vip;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::directory::RoomDirectory;
use crate::error::StoreError;
use crate::relay_tree::RelayTreeManager;
use crate::session::SessionMap;
use crate::signaling::PeerRegistry;
use crate::store::{JsonFileStore, MemoryStore, RegistryStore};
use crate::vip::VipTokenStore;

// ─── AppState ───────────────────────────────────────────────────────────────

/// The one explicit server context: every piece of global mutable state,
/// constructed at startup and threaded through each handler.  Tests build
/// independent instances the same way.
pub struct AppState {
    pub directory: RoomDirectory,
    pub sessions: SessionMap,
    pub trees: RelayTreeManager,
    pub vip_tokens: VipTokenStore,
    pub peers: PeerRegistry,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config, store: Arc<dyn RegistryStore>) -> Result<Self, StoreError> {
        Ok(Self {
            directory: RoomDirectory::open(store).await?,
            sessions: SessionMap::new(),
            trees: RelayTreeManager::new(config.host_relay_capacity),
            vip_tokens: VipTokenStore::new(),
            peers: PeerRegistry::new(),
            config,
        })
    }
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-relaycast-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── CORS configuration ─────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
            ])
    }
}

// ─── TLS configuration ──────────────────────────────────────────────────────

/// Load TLS certificate and key from PEM files and build an
/// `axum_server::tls_rustls::RustlsConfig`.
async fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<axum_server::tls_rustls::RustlsConfig, Box<dyn std::error::Error>> {
    info!("Loading TLS certificate from: {}", cert_path);
    info!("Loading TLS private key from:  {}", key_path);

    let config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

    info!("TLS configuration loaded successfully");
    Ok(config)
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // ── Install rustls CryptoProvider (required by rustls 0.23+) ────────
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // ── Load configuration ──────────────────────────────────────────────
    // Load .env before anything else so RELAYCAST_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("RELAYCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = Config::from_env();

    // ── Room registry store ─────────────────────────────────────────────

    let store: Arc<dyn RegistryStore> = if cfg.registry_path.is_empty() {
        warn!("RELAYCAST_REGISTRY_PATH is empty — room claims will not survive restarts");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::new(&cfg.registry_path))
    };

    let bind_addr = cfg.bind_addr.clone();
    let tls_enabled = cfg.tls_enabled;
    let tls_cert_path = cfg.tls_cert_path.clone();
    let tls_key_path = cfg.tls_key_path.clone();
    let allowed_origins = cfg.allowed_origins.clone();

    let state = Arc::new(
        AppState::new(cfg, store)
            .await
            .expect("failed to load the room registry"),
    );

    // ── Build router ────────────────────────────────────────────────────

    let cors = build_cors_layer(&allowed_origins);

    let app = Router::new()
        // WebSocket signaling (the entire event contract)
        .route("/ws", get(signaling::ws_handler))
        // Health (no auth required)
        .route("/health", get(api::health_handler))
        // Out-of-band VIP code redemption
        .route("/v1/rooms/:room/vip-tokens", post(api::issue_vip_token))
        // Payment integration boundary
        .route("/v1/rooms/:room/purchase", post(api::mark_room_purchased))
        // Middleware
        .layer(middleware::from_fn(version_header_middleware))
        .layer(cors)
        .with_state(state);

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────

    if tls_enabled {
        let cert_path = tls_cert_path
            .as_deref()
            .expect("RELAYCAST_TLS_CERT_PATH must be set when TLS is enabled");
        let key_path = tls_key_path
            .as_deref()
            .expect("RELAYCAST_TLS_KEY_PATH must be set when TLS is enabled");

        let tls_config = load_tls_config(cert_path, key_path)
            .await
            .expect("Failed to load TLS configuration");

        info!("Relaycast listening on https://{bind_addr}");
        let addr: std::net::SocketAddr = bind_addr.parse().expect("invalid bind address");

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .unwrap();
    } else {
        info!("Relaycast listening on http://{bind_addr}");

        let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    }
}
