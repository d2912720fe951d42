//! Local `--stdio` mode: the same four tools as the HTTP/session server,
//! exposed over `rmcp`'s stdio transport for single-client, no-session use.
//!
//! Grounded on this repo's original stdio MCP server struct
//! (`#[tool_router]` struct holding shared state, one
//! `#[tool(description = ...)]` method per tool, `tool_result` wrapping a
//! JSON payload into `CallToolResult`) with the provider-specific tool set
//! replaced by `tools::fetch_*`.
use rmcp::handler::server::router::tool::ToolRouter as RmcpToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::tools::{self, ToolContext};
use fetchguard_core::FetchError;
use fetchguard_local::{Cache, DnsOrder, FetchPipeline, PoolConfig, SecureFetcher, TransformPool};

fn tool_result(payload: Value) -> CallToolResult {
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

fn error_payload(tool: &str, err: &FetchError) -> Value {
    serde_json::json!({
        "ok": false,
        "error": err.message,
        "errorCode": err.kind,
        "url": err.url,
        "tool": tool,
    })
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct SingleUrlArgs {
    url: Option<String>,
    #[serde(rename = "cacheVary")]
    cache_vary: Option<Value>,
    #[serde(rename = "includeMetadata")]
    include_metadata: Option<bool>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct FetchLinksArgs {
    url: Option<String>,
    #[serde(rename = "maxLinks")]
    max_links: Option<u64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct FetchUrlsArgs {
    urls: Option<Vec<String>>,
    concurrency: Option<u64>,
}

fn args_to_value(v: impl serde::Serialize) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

#[derive(Clone)]
pub struct FetchGuardMcp {
    tool_router: RmcpToolRouter<Self>,
    ctx: Arc<ToolContext>,
}

#[tool_router]
impl FetchGuardMcp {
    pub fn new() -> Result<Self, McpError> {
        let config = Config::from_env();
        let fetcher = SecureFetcher::with_dns_order(DnsOrder::parse(&config.dns_order))
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let pool = TransformPool::new(PoolConfig::default());
        let cache = Arc::new(Cache::new(config.cache_enabled, config.cache_ttl, config.cache_max_entries));
        let cleanup_cache = cache.clone();
        let cleanup_interval = config.cleanup_interval();
        tokio::spawn(async move {
            Cache::run_cleanup_loop(cleanup_cache, cleanup_interval).await;
        });
        let pipeline =
            Arc::new(FetchPipeline::new(fetcher, pool, cache, config.cache_enabled, config.cache_ttl, config.max_inline_content_chars));
        let ctx = Arc::new(ToolContext {
            pipeline,
            fetch_timeout: config.fetch_timeout,
            fetch_retries: config.fetch_retries,
            max_content_size: config.max_content_size,
        });
        Ok(Self { tool_router: Self::tool_router(), ctx })
    }

    #[tool(description = "Fetch a URL and return the decoded body verbatim.")]
    async fn fetch_url(&self, params: Parameters<Option<SingleUrlArgs>>) -> Result<CallToolResult, McpError> {
        let args = args_to_value(params.0.unwrap_or_default());
        let cancel = CancellationToken::new();
        match tools::fetch_url(&self.ctx, &args, &cancel).await {
            Ok(outcome) => Ok(tool_result(outcome.structured_content)),
            Err(e) => Ok(tool_result(error_payload("fetch-url", &e))),
        }
    }

    #[tool(description = "Fetch a URL and return clean Markdown.")]
    async fn fetch_markdown(&self, params: Parameters<Option<SingleUrlArgs>>) -> Result<CallToolResult, McpError> {
        let args = args_to_value(params.0.unwrap_or_default());
        let cancel = CancellationToken::new();
        match tools::fetch_markdown(&self.ctx, &args, &cancel).await {
            Ok(outcome) => Ok(tool_result(outcome.structured_content)),
            Err(e) => Ok(tool_result(error_payload("fetch-markdown", &e))),
        }
    }

    #[tool(description = "Fetch a URL and return the absolute links found in it.")]
    async fn fetch_links(&self, params: Parameters<Option<FetchLinksArgs>>) -> Result<CallToolResult, McpError> {
        let args = args_to_value(params.0.unwrap_or_default());
        let cancel = CancellationToken::new();
        match tools::fetch_links(&self.ctx, &args, &cancel).await {
            Ok(outcome) => Ok(tool_result(outcome.structured_content)),
            Err(e) => Ok(tool_result(error_payload("fetch-links", &e))),
        }
    }

    #[tool(description = "Fetch several URLs and return Markdown for each.")]
    async fn fetch_urls(&self, params: Parameters<Option<FetchUrlsArgs>>) -> Result<CallToolResult, McpError> {
        let args = args_to_value(params.0.unwrap_or_default());
        let cancel = CancellationToken::new();
        match tools::fetch_urls(&self.ctx, &args, &cancel).await {
            Ok(outcome) => Ok(tool_result(outcome.structured_content)),
            Err(e) => Ok(tool_result(error_payload("fetch-urls", &e))),
        }
    }
}

#[tool_handler]
impl rmcp::ServerHandler for FetchGuardMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Secure web-fetch tools: fetch-url, fetch-markdown, fetch-links, fetch-urls.".to_string()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub async fn serve_stdio() -> Result<(), McpError> {
    let svc = FetchGuardMcp::new()?;
    let running = svc.serve(stdio()).await.map_err(|e| McpError::internal_error(e.to_string(), None))?;
    running.waiting().await.map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}
