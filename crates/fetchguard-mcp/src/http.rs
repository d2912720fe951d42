//! C9 — HTTP Dispatch: routes `POST/GET/DELETE /mcp` and `GET /health`,
//! the host/origin/rate-limit middleware stack (in that order), and
//! JSON-RPC message routing into the session layer, task manager, and the
//! four tools.
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fetchguard_core::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, JsonRpcVersion, RequestId, INVALID_REQUEST, METHOD_NOT_FOUND, SERVER_BUSY_OR_BAD_REQUEST,
};
use fetchguard_core::{CacheEntry, ErrorKind, FetchError};
use futures::stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session::{negotiate_protocol_version, SessionStore};
use crate::task_manager::{TaskManager, TaskPatch, TaskState};
use crate::tools::{self, ToolContext};

const MCP_SESSION_HEADER: &str = "mcp-session-id";
const MCP_PROTOCOL_HEADER: &str = "mcp-protocol-version";
const TASK_DEFAULT_TTL: Duration = Duration::from_secs(600);

struct Bucket {
    count: u64,
    reset_at: Instant,
    last_seen: Instant,
}

/// Per-client-IP fixed-window limiter, swept of entries idle past `2 *
/// window` (spec §3's rate-limit bucket).
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    max: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: u64, window: Duration) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), max, window }
    }

    fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, b| now.duration_since(b.last_seen) < self.window * 2);
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket { count: 0, reset_at: now + self.window, last_seen: now });
        if now > bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + self.window;
        }
        bucket.last_seen = now;
        bucket.count += 1;
        bucket.count <= self.max
    }
}

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskManager>,
    pub tools: Arc<ToolContext>,
    pub rate_limiter: RateLimiter,
}

pub fn router(state: Arc<AppState>) -> Router {
    let allowed_origins: Vec<HeaderValue> =
        state.config.allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, HeaderName::from_static(MCP_SESSION_HEADER)])
        .allow_origin(AllowOrigin::list(allowed_origins));

    // `.layer()` composes outside-in: the last one added runs first on the
    // way in. Adding them in this order makes the actual request path
    // Trace -> Host -> Origin -> RateLimiter -> CORS -> dispatch, matching
    // the mandated check order.
    Router::new()
        .route("/mcp", post(handle_post).get(handle_get).delete(handle_delete))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_mw))
        .layer(middleware::from_fn_with_state(state.clone(), origin_allow_list_mw))
        .layer(middleware::from_fn_with_state(state.clone(), host_allow_list_mw))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health() -> Json<Value> {
    tracing::debug!("health check");
    Json(json!({ "status": "healthy" }))
}

fn host_allowed(cfg: &Config, host: &str) -> bool {
    let host_only = host.split(':').next().unwrap_or(host);
    if host_only == "localhost" || host_only == "127.0.0.1" || host_only == "::1" {
        return true;
    }
    if host_only.eq_ignore_ascii_case(&cfg.host) {
        return true;
    }
    cfg.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host_only))
}

async fn host_allow_list_mw(State(state): State<Arc<AppState>>, req: axum::extract::Request, next: Next) -> Response {
    let host = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !host_allowed(&state.config, host) {
        return jsonrpc_error_response(None, JsonRpcError::new(INVALID_REQUEST, "Host not allowed"), StatusCode::FORBIDDEN);
    }
    next.run(req).await
}

fn origin_allowed(cfg: &Config, origin: Option<&str>) -> bool {
    match origin {
        None => true,
        Some(o) if o.is_empty() => true,
        Some(o) => cfg.allowed_origins.iter().any(|allowed| allowed == o),
    }
}

async fn origin_allow_list_mw(State(state): State<Arc<AppState>>, req: axum::extract::Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config, origin) {
        return jsonrpc_error_response(None, JsonRpcError::new(INVALID_REQUEST, "Origin not allowed"), StatusCode::FORBIDDEN);
    }
    next.run(req).await
}

async fn rate_limit_mw(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    if !state.rate_limiter.check(addr.ip()) {
        return jsonrpc_error_response(None, JsonRpcError::new(SERVER_BUSY_OR_BAD_REQUEST, "rate limit exceeded"), StatusCode::TOO_MANY_REQUESTS);
    }
    next.run(req).await
}

fn jsonrpc_error_response(id: Option<RequestId>, error: JsonRpcError, status: StatusCode) -> Response {
    let body = json!({ "jsonrpc": "2.0", "id": id, "error": error });
    (status, Json(body)).into_response()
}

fn error_to_response(err: &FetchError, id: Option<RequestId>) -> Response {
    let status = StatusCode::from_u16(err.status_code.unwrap_or(err.kind.http_status())).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match err.kind {
        ErrorKind::ServerBusy | ErrorKind::SessionNotFound => SERVER_BUSY_OR_BAD_REQUEST,
        _ => INVALID_REQUEST,
    };
    jsonrpc_error_response(id, JsonRpcError::new(code, err.message.clone()), status)
}

fn accept_is_valid(headers: &HeaderMap) -> bool {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).unwrap_or("");
    accept.contains("*/*") || (accept.contains("application/json") && accept.contains("text/event-stream"))
}

async fn handle_post(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if !accept_is_valid(&headers) {
        return jsonrpc_error_response(
            None,
            JsonRpcError::new(INVALID_REQUEST, "Accept header must include application/json and text/event-stream"),
            StatusCode::NOT_ACCEPTABLE,
        );
    }

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return jsonrpc_error_response(None, JsonRpcError::parse_error(), StatusCode::BAD_REQUEST),
    };

    let message = match JsonRpcMessage::parse(&raw) {
        Ok(m) => m,
        Err(e) => return jsonrpc_error_response(None, e, StatusCode::BAD_REQUEST),
    };

    let request = match message {
        JsonRpcMessage::Request(req) => req,
        JsonRpcMessage::Notification(note) => {
            tracing::debug!(method = %note.method, "received notification");
            return StatusCode::NO_CONTENT.into_response();
        }
        _ => return jsonrpc_error_response(None, JsonRpcError::invalid_request("expected a request or notification"), StatusCode::BAD_REQUEST),
    };

    let protocol_header = headers.get(MCP_PROTOCOL_HEADER).and_then(|v| v.to_str().ok());
    let protocol_version = match negotiate_protocol_version(protocol_header) {
        Ok(v) => v,
        Err(e) => return jsonrpc_error_response(Some(request.id), e, StatusCode::BAD_REQUEST),
    };

    if request.method == "initialize" {
        let init = state.sessions.initialize_session(protocol_version, Duration::from_secs(10), |_id| async { Ok(()) }).await;
        return match init {
            Ok(session) => {
                let result = json!({
                    "protocolVersion": session.protocol_version,
                    "serverInfo": { "name": "fetchguard-mcp", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {}, "resources": { "listChanged": true } },
                });
                let mut resp = Json(JsonRpcResponse { jsonrpc: JsonRpcVersion, id: request.id, result }).into_response();
                resp.headers_mut().insert(MCP_SESSION_HEADER, HeaderValue::from_str(&session.id).unwrap_or(HeaderValue::from_static("")));
                resp
            }
            Err(e) => error_to_response(&e, Some(request.id)),
        };
    }

    let session_id = match headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_string(),
        None => {
            return jsonrpc_error_response(
                Some(request.id),
                JsonRpcError::new(SERVER_BUSY_OR_BAD_REQUEST, "mcp-session-id header is required"),
                StatusCode::BAD_REQUEST,
            )
        }
    };
    if state.sessions.get(&session_id).is_none() {
        return jsonrpc_error_response(Some(request.id), JsonRpcError::invalid_request("unknown session"), StatusCode::NOT_FOUND);
    }

    dispatch_method(&state, &request.method, request.params.unwrap_or(Value::Null), request.id).await
}

async fn dispatch_method(state: &Arc<AppState>, method: &str, params: Value, id: RequestId) -> Response {
    let result = match method {
        "tools/list" => Ok(tools_list_result()),
        "tools/call" => call_tool(state, &params).await,
        "resources/read" => read_resource(state, &params),
        "resources/list" => Ok(resources_list(state)),
        "tasks/create" => task_create(state, &params),
        "tasks/get" => task_get(state, &params),
        "tasks/update" => task_update(state, &params),
        "tasks/cancel" => task_cancel(state, &params),
        "tasks/list" => task_list(state, &params),
        "tasks/wait" => task_wait(state, &params).await,
        _ => return jsonrpc_error_response(Some(id), JsonRpcError::new(METHOD_NOT_FOUND, format!("unknown method `{method}`")), StatusCode::NOT_FOUND),
    };

    match result {
        Ok(result) => Json(JsonRpcResponse { jsonrpc: JsonRpcVersion, id, result }).into_response(),
        Err(e) => error_to_response(&e, Some(id)),
    }
}

fn tools_list_result() -> Value {
    let placeholder_schema = json!({ "type": "object" });
    json!({ "tools": [
        { "name": "fetch-url", "description": "Fetch a URL and return the decoded body verbatim.", "inputSchema": placeholder_schema },
        { "name": "fetch-markdown", "description": "Fetch a URL and return clean Markdown.", "inputSchema": placeholder_schema },
        { "name": "fetch-links", "description": "Fetch a URL and return the absolute links found in it.", "inputSchema": placeholder_schema },
        { "name": "fetch-urls", "description": "Fetch several URLs and return Markdown for each.", "inputSchema": placeholder_schema },
    ]})
}

async fn call_tool(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let name = params.get("name").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `name`"))?;
    let args = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
    let cancel = CancellationToken::new();

    let outcome = match name {
        "fetch-url" => tools::fetch_url(&state.tools, &args, &cancel).await?,
        "fetch-markdown" => tools::fetch_markdown(&state.tools, &args, &cancel).await?,
        "fetch-links" => tools::fetch_links(&state.tools, &args, &cancel).await?,
        "fetch-urls" => tools::fetch_urls(&state.tools, &args, &cancel).await?,
        other => return Err(FetchError::new(ErrorKind::ValidationError, format!("unknown tool `{other}`"))),
    };
    Ok(json!({ "content": outcome.content, "structuredContent": outcome.structured_content }))
}

fn mime_for_resource_namespace(namespace: &str) -> &'static str {
    match namespace {
        "markdown" => "text/markdown",
        "links" => "application/x-ndjson",
        _ => "text/plain",
    }
}

/// Enumerates every live cache entry as an `internal://cache/{namespace}/{hash}`
/// resource, so a client can discover spilled tool output without already
/// knowing its URI.
fn resources_list(state: &Arc<AppState>) -> Value {
    let resources: Vec<Value> = state
        .tools
        .pipeline
        .cache()
        .list_keys()
        .iter()
        .filter_map(|key| {
            let (namespace, hash) = key.split_once(':')?;
            Some(json!({
                "uri": format!("internal://cache/{namespace}/{hash}"),
                "name": key,
                "mimeType": mime_for_resource_namespace(namespace),
            }))
        })
        .collect();
    json!({ "resources": resources })
}

fn read_resource(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let uri = params.get("uri").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `uri`"))?;
    let rest = uri
        .strip_prefix("internal://cache/")
        .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "unrecognised resource uri"))?;
    let (namespace, hash) = rest.split_once('/').ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "malformed resource uri"))?;
    let key = format!("{namespace}:{hash}");

    let entry: CacheEntry = state
        .tools
        .pipeline
        .cache()
        .get(&key, true)
        .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "resource not found").with_status(404))?;
    let mime = mime_for_resource_namespace(namespace);
    Ok(json!({ "contents": [{ "uri": uri, "mimeType": mime, "text": entry.content }] }))
}

fn task_create(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let owner = params.get("owner").and_then(Value::as_str).unwrap_or("default").to_string();
    let ttl_ms = params.get("ttl").and_then(Value::as_u64);
    let ttl = ttl_ms.map(Duration::from_millis).unwrap_or(TASK_DEFAULT_TTL);
    let id = state.tasks.create_task(&owner, ttl)?;
    Ok(json!({ "id": id, "state": "working" }))
}

fn owner_of(params: &Value) -> String {
    params.get("owner").and_then(Value::as_str).unwrap_or("default").to_string()
}

fn task_get(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let id = params.get("id").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `id`"))?;
    let owner = owner_of(params);
    let task = state.tasks.get_task(id, &owner).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "task not found").with_status(404))?;
    Ok(serde_json::to_value(task).unwrap_or(Value::Null))
}

fn task_update(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let id = params.get("id").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `id`"))?;
    let patch = TaskPatch {
        state: params.get("state").and_then(Value::as_str).and_then(parse_task_state),
        result: params.get("result").cloned(),
        error: params.get("error").and_then(Value::as_str).map(str::to_string),
    };
    state.tasks.update_task(id, patch);
    Ok(json!({ "ok": true }))
}

fn parse_task_state(s: &str) -> Option<TaskState> {
    match s {
        "working" => Some(TaskState::Working),
        "input_required" => Some(TaskState::InputRequired),
        "completed" => Some(TaskState::Completed),
        "failed" => Some(TaskState::Failed),
        "cancelled" => Some(TaskState::Cancelled),
        _ => None,
    }
}

fn task_cancel(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let id = params.get("id").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `id`"))?;
    let owner = owner_of(params);
    state.tasks.cancel_task(id, &owner)?;
    Ok(json!({ "ok": true }))
}

fn task_list(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let owner = owner_of(params);
    let cursor = params.get("cursor").and_then(Value::as_str);
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let page = state.tasks.list_tasks(&owner, cursor, limit);
    Ok(json!({ "items": page.items, "nextCursor": page.next_cursor }))
}

async fn task_wait(state: &Arc<AppState>, params: &Value) -> Result<Value, FetchError> {
    let id = params.get("id").and_then(Value::as_str).ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing `id`"))?;
    let owner = owner_of(params);
    let deadline = params.get("timeoutMs").and_then(Value::as_u64).map(Duration::from_millis).unwrap_or(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let task = state.tasks.wait_for_terminal_task(id, &owner, deadline, &cancel).await;
    Ok(json!({ "task": task }))
}

async fn handle_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !accept.contains("text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let session_id = match headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if state.sessions.get(id).is_some() => id.to_string(),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    tracing::debug!(session_id, "opening SSE stream");
    let events = stream::once(async { Ok::<_, std::convert::Infallible>(Event::default().comment("connected")) });
    Sse::new(events).into_response()
}

async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.sessions.remove(session_id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_allow_list_always_admits_loopback() {
        let cfg = Config::from_env();
        assert!(host_allowed(&cfg, "127.0.0.1:8787"));
        assert!(host_allowed(&cfg, "localhost"));
    }

    #[test]
    fn origin_allow_list_passes_absent_origin() {
        let cfg = Config::from_env();
        assert!(origin_allowed(&cfg, None));
    }

    #[test]
    fn rate_limiter_rejects_past_the_configured_max() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn accept_header_requires_both_media_types_unless_wildcard() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        assert!(accept_is_valid(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!accept_is_valid(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(accept_is_valid(&headers));
    }
}
