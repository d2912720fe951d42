//! Central environment-variable config. Consolidates the scattered
//! `env_csv`/`env_usize`/`env_bool` helper style this repo's modules already
//! used into one constructor, since the HTTP/session server reads far more
//! tunables than a single stdio process ever did.
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub allow_remote: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub rate_limit_max: u64,
    pub rate_limit_window: Duration,
    pub server_headers_timeout: Duration,
    pub server_request_timeout: Duration,
    pub server_keep_alive_timeout: Duration,
    pub shutdown_close_idle: bool,
    pub shutdown_close_all: bool,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub max_inline_content_chars: usize,
    pub max_content_size: usize,
    pub dns_order: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_string("HOST", "127.0.0.1"),
            port: env_u64("PORT", 8787) as u16,
            allow_remote: env_bool("ALLOW_REMOTE", false),
            allowed_hosts: env_csv("ALLOWED_HOSTS"),
            allowed_origins: env_csv("ALLOWED_ORIGINS"),
            session_ttl: Duration::from_millis(env_u64("SESSION_TTL_MS", 30 * 60 * 1000)),
            max_sessions: env_usize("MAX_SESSIONS", 1000),
            rate_limit_max: env_u64("RATE_LIMIT_MAX", 600),
            rate_limit_window: Duration::from_millis(env_u64("RATE_LIMIT_WINDOW_MS", 60_000)),
            server_headers_timeout: Duration::from_millis(env_u64("SERVER_HEADERS_TIMEOUT_MS", 30_000)),
            server_request_timeout: Duration::from_millis(env_u64("SERVER_REQUEST_TIMEOUT_MS", 60_000)),
            server_keep_alive_timeout: Duration::from_millis(env_u64("SERVER_KEEP_ALIVE_TIMEOUT_MS", 5_000)),
            shutdown_close_idle: env_bool("SERVER_SHUTDOWN_CLOSE_IDLE", true),
            shutdown_close_all: env_bool("SERVER_SHUTDOWN_CLOSE_ALL", false),
            cache_enabled: env_bool("CACHE_ENABLED", true),
            cache_ttl: Duration::from_millis(env_u64("CACHE_TTL_MS", 10 * 60 * 1000)),
            cache_max_entries: env_usize("CACHE_MAX_ENTRIES", 2000),
            fetch_timeout: Duration::from_millis(env_u64("FETCH_TIMEOUT_MS", 20_000)),
            fetch_retries: env_u64("FETCH_RETRIES", 3).clamp(1, 10) as u32,
            max_inline_content_chars: env_usize("MAX_INLINE_CONTENT_CHARS", 10_000),
            max_content_size: env_usize("MAX_CONTENT_SIZE", 10 * 1024 * 1024),
            dns_order: env_string("DNS_ORDER", "verbatim"),
            log_level: env_string("LOG_LEVEL", "info"),
        }
    }

    /// The bind address actually used: `ALLOW_REMOTE=false` pins to loopback
    /// regardless of `HOST`, since a wildcard bind is not auto-allowed by the
    /// host allow-list (spec §4.9).
    pub fn bind_host(&self) -> &str {
        if self.allow_remote {
            &self.host
        } else {
            "127.0.0.1"
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.session_ttl.mul_f64(0.5).clamp(Duration::from_secs(10), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env() {
        // Doesn't touch process env, so this is safe to run alongside other tests.
        let empty = Config {
            host: "x".into(),
            port: 1,
            allow_remote: false,
            allowed_hosts: vec![],
            allowed_origins: vec![],
            session_ttl: Duration::from_secs(1800),
            max_sessions: 1000,
            rate_limit_max: 600,
            rate_limit_window: Duration::from_secs(60),
            server_headers_timeout: Duration::from_secs(30),
            server_request_timeout: Duration::from_secs(60),
            server_keep_alive_timeout: Duration::from_secs(5),
            shutdown_close_idle: true,
            shutdown_close_all: false,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(600),
            cache_max_entries: 2000,
            fetch_timeout: Duration::from_secs(20),
            fetch_retries: 3,
            max_inline_content_chars: 10_000,
            max_content_size: 10 * 1024 * 1024,
            dns_order: "verbatim".into(),
            log_level: "info".into(),
        };
        assert_eq!(empty.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(empty.bind_host(), "127.0.0.1");
    }
}
