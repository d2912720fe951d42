//! `fetchguard` binary: the remote HTTP/session MCP server by default, or a
//! single-client `--stdio` local server with `--stdio`.
use clap::Parser;
use fetchguard_mcp::config::Config;
use fetchguard_mcp::http::{router, AppState, RateLimiter};
use fetchguard_mcp::session::SessionStore;
use fetchguard_mcp::task_manager::TaskManager;
use fetchguard_mcp::tools::ToolContext;
use fetchguard_local::{Cache, DnsOrder, FetchPipeline, PoolConfig, SecureFetcher, TransformPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fetchguard")]
#[command(about = "Secure, SSRF-hardened web-fetch MCP service", long_about = None)]
struct Cli {
    /// Run as a single-client MCP server over stdio instead of the HTTP/session server.
    #[cfg(feature = "stdio")]
    #[arg(long)]
    stdio: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(&config.log_level);

    #[cfg(feature = "stdio")]
    if cli.stdio {
        if let Err(e) = fetchguard_mcp::stdio::serve_stdio().await {
            tracing::error!(error = %e, "stdio server exited with an error");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = run_http_server(config).await {
        tracing::error!(error = %e, "server failed to start");
        std::process::exit(1);
    }
}

async fn run_http_server(config: Config) -> anyhow::Result<()> {
    let fetcher = SecureFetcher::with_dns_order(DnsOrder::parse(&config.dns_order))?;
    let pool = TransformPool::new(PoolConfig::default());
    let cache = Arc::new(Cache::new(config.cache_enabled, config.cache_ttl, config.cache_max_entries));
    let cleanup_cache = cache.clone();
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
    let cleanup_sessions = sessions.clone();
    let cleanup_interval = config.cleanup_interval();
    tokio::spawn(async move {
        SessionStore::run_cleanup_loop(cleanup_sessions, cleanup_interval).await;
    });
    tokio::spawn(async move {
        Cache::run_cleanup_loop(cleanup_cache, cleanup_interval).await;
    });

    let tasks = Arc::new(TaskManager::new(10_000, 200));
    let rate_limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window);

    let bind_host = config.bind_host().to_string();
    let port = config.port;
    let state = Arc::new(AppState { config, sessions, tasks, tools, rate_limiter });
    let app = router(state);

    let addr: SocketAddr = format!("{bind_host}:{port}").parse()?;
    tracing::info!(%addr, "fetchguard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}
