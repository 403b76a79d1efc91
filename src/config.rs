use tracing::info;

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `RELAYCAST_`.  Defaults are suitable for local development; production
/// deployments should override at least the bind address, the registry path
/// and the TLS settings.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP(S) listener to.
    pub bind_addr: String,
    /// Public hostname (TLS SNI, log banners).
    pub public_host: String,

    // ── TLS ─────────────────────────────────────────────────────────────
    /// Enable native TLS termination inside the binary.
    pub tls_enabled: bool,
    /// Path to PEM-encoded certificate chain.
    pub tls_cert_path: Option<String>,
    /// Path to PEM-encoded private key.
    pub tls_key_path: Option<String>,

    // ── Persistence ─────────────────────────────────────────────────────
    /// Path of the durable room registry file.  An empty string selects the
    /// in-memory store (nothing survives a restart).
    pub registry_path: String,

    // ── Relay tree ──────────────────────────────────────────────────────
    /// Relay capacity granted to the host (tree root).
    pub host_relay_capacity: u32,

    // ── CORS ────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("RELAYCAST_BIND_ADDR", "0.0.0.0:8080");
        let public_host = env_or("RELAYCAST_PUBLIC_HOST", "localhost");

        let tls_enabled = env_bool("RELAYCAST_TLS_ENABLED", false);
        let tls_cert_path = std::env::var("RELAYCAST_TLS_CERT_PATH").ok();
        let tls_key_path = std::env::var("RELAYCAST_TLS_KEY_PATH").ok();

        let registry_path = env_or("RELAYCAST_REGISTRY_PATH", "relaycast-registry.json");

        let host_relay_capacity = env_or("RELAYCAST_HOST_RELAY_CAPACITY", "10")
            .parse::<u32>()
            .unwrap_or(10);

        let allowed_origins = env_or("RELAYCAST_ALLOWED_ORIGINS", "*");
        let log_level = env_or("RELAYCAST_LOG_LEVEL", "info");

        let config = Config {
            bind_addr,
            public_host,
            tls_enabled,
            tls_cert_path,
            tls_key_path,
            registry_path,
            host_relay_capacity,
            allowed_origins,
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── Relaycast Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  public_host        : {}", self.public_host);
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path      : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path       : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        info!(
            "  registry_path      : {}",
            if self.registry_path.is_empty() {
                "(in-memory)"
            } else {
                &self.registry_path
            }
        );
        info!("  host_relay_cap     : {}", self.host_relay_capacity);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("─────────────────────────────────");
    }
}

#[cfg(test)]
impl Default for Config {
    /// Test fixture: in-memory registry, permissive CORS, no TLS.
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:0".into(),
            public_host: "localhost".into(),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            registry_path: String::new(),
            host_relay_capacity: 10,
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
