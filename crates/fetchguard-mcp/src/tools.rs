//! The four tools exposed over MCP: `fetch-url`, `fetch-markdown`,
//! `fetch-links`, `fetch-urls`. Each is a thin argument-parsing/response-
//! shaping layer in front of the shared `FetchPipeline` (C7); the JSON-RPC
//! schema for their arguments is an external collaborator (spec §1), so
//! parsing here is deliberately permissive rather than schema-derived.
use fetchguard_core::{create_cache_key, ErrorKind, FetchError, ToolContent, ToolErrorResponse};
use fetchguard_local::{extract_links, FetchPipeline, PipelineOutcome, PipelineParams, TransformKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RAW_NAMESPACE: &str = "raw";
const MARKDOWN_NAMESPACE: &str = "markdown";
const LINKS_NAMESPACE: &str = "links";
const DEFAULT_MAX_LINKS: usize = 100;
const DEFAULT_URLS_CONCURRENCY: usize = 4;

pub struct ToolContext {
    pub pipeline: Arc<FetchPipeline>,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub max_content_size: usize,
}

#[derive(Debug, Serialize)]
pub struct ToolCallOutcome {
    pub content: Vec<ToolContent>,
    pub structured_content: Value,
}

fn str_arg(args: &Value, name: &str) -> Result<String, FetchError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, format!("missing required argument `{name}`")))
}

fn bool_arg(args: &Value, name: &str, default: bool) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

fn usize_arg(args: &Value, name: &str, default: usize) -> usize {
    args.get(name).and_then(Value::as_u64).map(|v| v as usize).unwrap_or(default)
}

fn cache_vary(args: &Value) -> Option<Value> {
    args.get("cacheVary").cloned()
}

fn resource_uri(cache_key: &str) -> Option<(String, String)> {
    let (namespace, hash) = cache_key.split_once(':')?;
    Some((format!("internal://cache/{namespace}/{hash}"), hash.to_string()))
}

fn mime_for_namespace(namespace: &str) -> &'static str {
    match namespace {
        MARKDOWN_NAMESPACE => "text/markdown",
        LINKS_NAMESPACE => "application/x-ndjson",
        _ => "text/plain",
    }
}

/// Shapes a pipeline outcome into the tool response contract: inline text
/// below `maxInlineContentChars`, a `resource_link` above it (spec §4.7's
/// inline-vs-spill decision).
fn shape_outcome(
    ctx: &ToolContext,
    namespace: &str,
    outcome: PipelineOutcome,
    extra_structured: Vec<(&'static str, Value)>,
) -> ToolCallOutcome {
    let mut structured = serde_json::Map::new();
    structured.insert("url".to_string(), Value::String(outcome.url.clone()));
    if let Some(title) = &outcome.title {
        structured.insert("title".to_string(), Value::String(title.clone()));
    }
    structured.insert("cached".to_string(), Value::Bool(outcome.from_cache));
    structured.insert("truncated".to_string(), Value::Bool(outcome.truncated));
    for (k, v) in extra_structured {
        structured.insert(k.to_string(), v);
    }

    if ctx.pipeline.exceeds_inline_limit(&outcome.markdown) {
        if let Some((uri, hash)) = resource_uri(&outcome.cache_key) {
            structured.insert("resourceUri".to_string(), Value::String(uri.clone()));
            return ToolCallOutcome {
                content: vec![ToolContent::ResourceLink {
                    uri,
                    name: format!("{namespace}:{hash}"),
                    mime_type: mime_for_namespace(namespace).to_string(),
                }],
                structured_content: Value::Object(structured),
            };
        }
    }

    structured.insert("markdown".to_string(), Value::String(outcome.markdown.clone()));
    ToolCallOutcome { content: vec![ToolContent::Text { text: outcome.markdown }], structured_content: Value::Object(structured) }
}

fn pipeline_params(ctx: &ToolContext, url: String, namespace: &str, args: &Value, transform: TransformKind) -> PipelineParams {
    PipelineParams {
        url,
        cache_namespace: namespace.to_string(),
        cache_vary: cache_vary(args),
        include_metadata: bool_arg(args, "includeMetadata", true),
        retries: ctx.fetch_retries,
        timeout: ctx.fetch_timeout,
        max_bytes: ctx.max_content_size,
        headers: BTreeMap::new(),
        transform,
    }
}

pub async fn fetch_url(ctx: &ToolContext, args: &Value, cancel: &CancellationToken) -> Result<ToolCallOutcome, FetchError> {
    let url = str_arg(args, "url")?;
    let params = pipeline_params(ctx, url, RAW_NAMESPACE, args, TransformKind::Raw);
    let outcome = ctx.pipeline.run(params, cancel).await?;
    Ok(shape_outcome(ctx, RAW_NAMESPACE, outcome, vec![]))
}

pub async fn fetch_markdown(ctx: &ToolContext, args: &Value, cancel: &CancellationToken) -> Result<ToolCallOutcome, FetchError> {
    let url = str_arg(args, "url")?;
    let params = pipeline_params(ctx, url, MARKDOWN_NAMESPACE, args, TransformKind::Markdown);
    let outcome = ctx.pipeline.run(params, cancel).await?;
    Ok(shape_outcome(ctx, MARKDOWN_NAMESPACE, outcome, vec![]))
}

/// Like `shape_outcome`, but the content being sized/spilled is the joined
/// link list rather than the pipeline's own cached markdown, so it gets its
/// own cache entry under `LINKS_NAMESPACE` rather than reusing the raw-fetch
/// one the pipeline already wrote.
pub async fn fetch_links(ctx: &ToolContext, args: &Value, cancel: &CancellationToken) -> Result<ToolCallOutcome, FetchError> {
    let url = str_arg(args, "url")?;
    let max_links = usize_arg(args, "maxLinks", DEFAULT_MAX_LINKS);
    let params = pipeline_params(ctx, url.clone(), RAW_NAMESPACE, args, TransformKind::Raw);
    let outcome = ctx.pipeline.run(params, cancel).await?;
    let links = extract_links(&outcome.markdown, Some(&outcome.url), max_links);
    let joined = links.join("\n");

    let mut structured = serde_json::Map::new();
    structured.insert("url".to_string(), Value::String(outcome.url.clone()));
    structured.insert("cached".to_string(), Value::Bool(outcome.from_cache));

    if ctx.pipeline.exceeds_inline_limit(&joined) {
        let key = create_cache_key(LINKS_NAMESPACE, &outcome.url, cache_vary(args).as_ref());
        ctx.pipeline.cache().set(&key, joined.clone(), outcome.url.clone(), None, None);
        if let Some((uri, hash)) = resource_uri(&key) {
            structured.insert("resourceUri".to_string(), Value::String(uri.clone()));
            return Ok(ToolCallOutcome {
                content: vec![ToolContent::ResourceLink {
                    uri,
                    name: format!("{LINKS_NAMESPACE}:{hash}"),
                    mime_type: mime_for_namespace(LINKS_NAMESPACE).to_string(),
                }],
                structured_content: Value::Object(structured),
            });
        }
    }

    structured.insert("links".to_string(), serde_json::to_value(&links).unwrap_or(Value::Null));
    Ok(ToolCallOutcome { content: vec![ToolContent::Text { text: joined }], structured_content: Value::Object(structured) })
}

/// Runs `fetch-markdown` over each input URL with bounded concurrency,
/// collecting a per-URL result or `ToolErrorResponse` rather than failing
/// the whole batch on one bad URL.
pub async fn fetch_urls(ctx: &ToolContext, args: &Value, cancel: &CancellationToken) -> Result<ToolCallOutcome, FetchError> {
    let urls = args
        .get("urls")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "missing required argument `urls`"))?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "`urls` must be an array of strings"))?;
    if urls.is_empty() {
        return Err(FetchError::new(ErrorKind::ValidationError, "`urls` must contain at least one entry"));
    }

    let concurrency = usize_arg(args, "concurrency", DEFAULT_URLS_CONCURRENCY).clamp(1, 16);
    let mut results: Vec<Value> = Vec::with_capacity(urls.len());
    for chunk in urls.chunks(concurrency) {
        let mut handles = Vec::with_capacity(chunk.len());
        for url in chunk {
            let params = pipeline_params(ctx, url.clone(), MARKDOWN_NAMESPACE, args, TransformKind::Markdown);
            let pipeline = ctx.pipeline.clone();
            let cancel = cancel.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move { (url, pipeline.run(params, &cancel).await) }));
        }
        for handle in handles {
            let (url, result) = handle.await.map_err(|e| FetchError::new(ErrorKind::InternalError, format!("task join failed: {e}")))?;
            match result {
                Ok(outcome) => results.push(serde_json::json!({
                    "url": outcome.url,
                    "title": outcome.title,
                    "markdown": outcome.markdown,
                    "cached": outcome.from_cache,
                })),
                Err(err) => {
                    let tool_err = ToolErrorResponse { error: err.message.clone(), url: Some(url), error_code: err.kind };
                    results.push(serde_json::to_value(tool_err).unwrap_or(Value::Null));
                }
            }
        }
    }

    let structured = serde_json::json!({ "results": results });
    Ok(ToolCallOutcome {
        content: vec![ToolContent::Text { text: serde_json::to_string_pretty(&structured).unwrap_or_default() }],
        structured_content: structured,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_uri_splits_namespace_and_hash() {
        let (uri, hash) = resource_uri("markdown:abcd1234").unwrap();
        assert_eq!(uri, "internal://cache/markdown/abcd1234");
        assert_eq!(hash, "abcd1234");
    }

    #[test]
    fn resource_uri_rejects_malformed_keys() {
        assert!(resource_uri("no-colon-here").is_none());
    }

    #[test]
    fn mime_types_match_the_documented_namespaces() {
        assert_eq!(mime_for_namespace("markdown"), "text/markdown");
        assert_eq!(mime_for_namespace("links"), "application/x-ndjson");
        assert_eq!(mime_for_namespace("raw"), "text/plain");
    }
}
