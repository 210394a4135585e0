//! Configuration module for linkwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Minimum accepted length for the shared signing secret.
pub const MIN_SECRET_LEN: usize = 32;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "linkwatch.db")
    pub db_path: String,
    /// Shared HMAC secret for signed writes. Unset means every signed
    /// request is refused with a configuration error.
    pub api_secret: Option<String>,
    /// Prefix the API is mounted under; stripped before signing (default: "/api")
    pub mount_prefix: String,
    /// Silence after which the link is considered down (default: 5m)
    pub heartbeat_timeout: Duration,
    /// Delay between supervisor passes (default: 1m)
    pub downtime_check_interval: Duration,
    /// Outage age at which a downtime is confirmed (default: 30m)
    pub downtime_confirmation_delay: Duration,
    /// Maximum number of remembered nonces (default: 10000)
    pub nonce_cache_capacity: usize,
    /// Endpoint receiving JSON notifications; unset disables delivery.
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "linkwatch.db".to_string(),
            api_secret: None,
            mount_prefix: "/api".to_string(),
            heartbeat_timeout: Duration::from_millis(300_000),
            downtime_check_interval: Duration::from_millis(60_000),
            downtime_confirmation_delay: Duration::from_millis(1_800_000),
            nonce_cache_capacity: 10_000,
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LINKWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `LINKWATCH_DB_PATH`: Database file path (default: "linkwatch.db")
    /// - `LINKWATCH_API_SECRET`: Shared signing secret, at least 32 characters
    /// - `LINKWATCH_MOUNT_PREFIX`: API mount prefix (default: "/api")
    /// - `HEARTBEAT_TIMEOUT_MS`: Heartbeat timeout (default: 300000)
    /// - `DOWNTIME_CHECK_INTERVAL_MS`: Supervisor interval (default: 60000)
    /// - `DOWNTIME_CONFIRMATION_DELAY_MS`: Confirmation delay (default: 1800000)
    /// - `LINKWATCH_NONCE_CACHE_CAPACITY`: Nonce cache size (default: 10000)
    /// - `LINKWATCH_WEBHOOK_URL`: Notification webhook (default: disabled)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("LINKWATCH_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("LINKWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.api_secret = lookup("LINKWATCH_API_SECRET").filter(|s| !s.is_empty());

        if let Some(prefix) = lookup("LINKWATCH_MOUNT_PREFIX") {
            cfg.mount_prefix = normalize_prefix(&prefix);
        }

        if let Some(d) = millis(&lookup, "HEARTBEAT_TIMEOUT_MS") {
            cfg.heartbeat_timeout = d;
        }
        if let Some(d) = millis(&lookup, "DOWNTIME_CHECK_INTERVAL_MS") {
            cfg.downtime_check_interval = d;
        }
        if let Some(d) = millis(&lookup, "DOWNTIME_CONFIRMATION_DELAY_MS") {
            cfg.downtime_confirmation_delay = d;
        }

        if let Some(cap) = lookup("LINKWATCH_NONCE_CACHE_CAPACITY")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|c| *c > 0)
        {
            cfg.nonce_cache_capacity = cap;
        }

        cfg.webhook_url = lookup("LINKWATCH_WEBHOOK_URL").filter(|s| !s.trim().is_empty());

        cfg
    }

    /// Whether the configured secret is present and long enough to sign with.
    pub fn validate_secret(&self) -> Result<(), String> {
        match &self.api_secret {
            None => Err("LINKWATCH_API_SECRET is not set".to_string()),
            Some(s) if s.chars().count() < MIN_SECRET_LEN => Err(format!(
                "LINKWATCH_API_SECRET must be at least {} characters",
                MIN_SECRET_LEN
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Parse a positive millisecond duration; zero and garbage fall back to the default.
fn millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
