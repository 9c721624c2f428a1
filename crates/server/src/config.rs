// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own COEDIT_DB_* variables in
// db::pool.

use std::net::SocketAddr;
use std::time::Duration;

use crate::engine::{EngineConfig, MIN_TAIL_LIMIT};
use crate::presence::DEFAULT_PRESENCE_TTL;

const DEV_JWT_SECRET: &str = "coedit_local_development_jwt_secret_must_be_32_chars";

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string; documents stay in memory without one.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `coedit_server=debug`).
    pub log_filter: String,
    /// Transform tail length per document.
    pub ot_tail_limit: usize,
    /// Applied-op count that forces a write-back.
    pub persist_ops_threshold: u32,
    /// Dirty age that forces a write-back.
    pub persist_interval: Duration,
    /// Presence inactivity TTL.
    pub presence_ttl: Duration,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COEDIT_HOST` | `0.0.0.0` |
    /// | `COEDIT_PORT` | `8080` |
    /// | `COEDIT_JWT_SECRET` | dev-only placeholder |
    /// | `COEDIT_DATABASE_URL` | *(none — in-memory store)* |
    /// | `COEDIT_LOG_FILTER` | `info` |
    /// | `COEDIT_OT_TAIL_LIMIT` | `50` (floor 10) |
    /// | `COEDIT_PERSIST_OPS_THRESHOLD` | `20` |
    /// | `COEDIT_PERSIST_INTERVAL_MS` | `2000` |
    /// | `COEDIT_PRESENCE_TTL_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COEDIT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("COEDIT_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("COEDIT_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("COEDIT_DATABASE_URL").ok();
        let log_filter = env("COEDIT_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let ot_tail_limit = env("COEDIT_OT_TAIL_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(50)
            .max(MIN_TAIL_LIMIT);

        let persist_ops_threshold = env("COEDIT_PERSIST_OPS_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(20);

        let persist_interval = Duration::from_millis(
            env("COEDIT_PERSIST_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(2_000),
        );

        let presence_ttl = env("COEDIT_PRESENCE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PRESENCE_TTL);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            log_filter,
            ot_tail_limit,
            persist_ops_threshold,
            persist_interval,
            presence_ttl,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tail_limit: self.ot_tail_limit,
            persist_ops_threshold: self.persist_ops_threshold,
            persist_interval: self.persist_interval,
        }
    }
}
