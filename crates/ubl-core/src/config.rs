//! Service configuration.
//!
//! All knobs are string-valued environment variables with defaults; the
//! gateway binary layers CLI overrides on top (args win). The loaded
//! configuration is immutable for the process lifetime.

use std::env;

/// Resource bounds and transport settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deployment environment label (`development`, `production`, ...).
    pub environment: String,
    /// Default log filter when `RUST_LOG` / `--log-level` are absent.
    pub log_level: String,
    /// Maximum serialized message body size in bytes.
    pub max_message_bytes: usize,
    /// Room hot-window size in messages.
    pub hot_messages_limit: usize,
    /// Ledger hot-window size in atoms.
    pub hot_atoms_limit: usize,
    /// Idempotency (`seen`) entries retained per room.
    pub seen_limit: usize,
    /// Content-id dedup entries retained per ledger shard.
    pub dedup_limit: usize,
    /// SSE keepalive interval in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Hard cap on history page size.
    pub history_page_limit: usize,
    /// Default history page size when the caller omits `limit`.
    pub history_page_default: usize,
    /// Origins allowed on the `/mcp` endpoint; an absent `Origin` header is
    /// always allowed (non-browser clients).
    pub allowed_origins: Vec<String>,
    /// Email domains that resolve to the platform tenant `t:ubl_core`.
    pub platform_domains: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
            max_message_bytes: 8000,
            hot_messages_limit: 500,
            hot_atoms_limit: 2000,
            seen_limit: 2000,
            dedup_limit: 5000,
            keepalive_interval_ms: 15_000,
            history_page_limit: 200,
            history_page_default: 50,
            allowed_origins: vec![
                "http://localhost:8787".to_string(),
                "http://127.0.0.1:8787".to_string(),
            ],
            platform_domains: vec!["ubl.dev".to_string()],
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for unset or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            environment: env_string("ENVIRONMENT", defaults.environment),
            log_level: env_string("LOG_LEVEL", defaults.log_level),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES", defaults.max_message_bytes),
            hot_messages_limit: env_parse("HOT_MESSAGES_LIMIT", defaults.hot_messages_limit),
            hot_atoms_limit: env_parse("HOT_ATOMS_LIMIT", defaults.hot_atoms_limit),
            seen_limit: env_parse("SEEN_LIMIT", defaults.seen_limit),
            dedup_limit: env_parse("DEDUP_LIMIT", defaults.dedup_limit),
            keepalive_interval_ms: env_parse("KEEPALIVE_INTERVAL_MS", defaults.keepalive_interval_ms),
            history_page_limit: defaults.history_page_limit,
            history_page_default: defaults.history_page_default,
            allowed_origins: env_list("ALLOWED_ORIGINS", defaults.allowed_origins),
            platform_domains: env_list("PLATFORM_DOMAINS", defaults.platform_domains),
        }
    }

    /// Clamps a caller-provided history page size to `[1, history_page_limit]`,
    /// substituting the default when absent or zero.
    #[must_use]
    pub fn clamp_history_limit(&self, limit: Option<usize>) -> usize {
        match limit {
            None | Some(0) => self.history_page_default,
            Some(n) => n.min(self.history_page_limit),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default,
    }
}
