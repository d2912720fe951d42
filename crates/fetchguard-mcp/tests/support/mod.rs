//! Shared test scaffolding: builds a real `AppState`/router without ever
//! touching the network, the same way the unit tests in `http.rs` build
//! `Config::from_env()` directly.
use axum::extract::ConnectInfo;
use axum::Router;
use fetchguard_local::{Cache, FetchPipeline, PoolConfig, SecureFetcher, TransformPool};
use fetchguard_mcp::config::Config;
use fetchguard_mcp::http::{router, AppState, RateLimiter};
use fetchguard_mcp::session::SessionStore;
use fetchguard_mcp::task_manager::TaskManager;
use fetchguard_mcp::tools::ToolContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// `rate_limit_mw` extracts `ConnectInfo<SocketAddr>`, which normally comes
/// from `into_make_service_with_connect_info`. `oneshot()` bypasses that, so
/// tests have to stamp the same extension onto the request by hand.
pub fn with_connect_info(mut req: axum::http::Request<axum::body::Body>) -> axum::http::Request<axum::body::Body> {
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

pub fn test_router() -> Router {
    let config = Config::from_env();
    let fetcher = SecureFetcher::new().expect("build http client");
    let pool = TransformPool::new(PoolConfig::default());
    let cache = Arc::new(Cache::new(config.cache_enabled, config.cache_ttl, config.cache_max_entries));
    let pipeline = Arc::new(FetchPipeline::new(
        fetcher,
        pool,
        cache,
        config.cache_enabled,
        config.cache_ttl,
        config.max_inline_content_chars,
    ));
    let tools = Arc::new(ToolContext {
        pipeline,
        fetch_timeout: config.fetch_timeout,
        fetch_retries: config.fetch_retries,
        max_content_size: config.max_content_size,
    });
    let sessions = Arc::new(SessionStore::new(config.max_sessions, config.session_ttl));
    let tasks = Arc::new(TaskManager::new(1_000, 50));
    let rate_limiter = RateLimiter::new(config.rate_limit_max, Duration::from_secs(60));
    let state = Arc::new(AppState { config, sessions, tasks, tools, rate_limiter });
    router(state)
}
