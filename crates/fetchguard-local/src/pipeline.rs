//! C7 — Fetch Pipeline: composes normalise → cache lookup → (retry → fetch)
//! → transform → serialise → cache store, plus the inline-vs-resource-link
//! spill decision.
use crate::cache::Cache;
use crate::fetcher::{FetchOptions, SecureFetcher};
use crate::pool::TransformPool;
use crate::retry::with_retry;
use crate::url::{normalise, transform_to_raw_url};
use fetchguard_core::{create_cache_key, ErrorKind, FetchError, TransformResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What step 5 of the pipeline contract (`data <- transform(html, u)`) does
/// with the fetched body. `Markdown` dispatches to the C6 worker pool;
/// `Raw` is the identity transform, used by tools that want the decoded
/// body verbatim (`fetch-url`, `fetch-links`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Markdown,
    Raw,
}

pub struct PipelineParams {
    pub url: String,
    pub cache_namespace: String,
    pub cache_vary: Option<Value>,
    pub include_metadata: bool,
    pub retries: u32,
    pub timeout: Duration,
    pub max_bytes: usize,
    pub headers: BTreeMap<String, String>,
    pub transform: TransformKind,
}

pub struct PipelineOutcome {
    pub markdown: String,
    pub title: Option<String>,
    pub truncated: bool,
    pub from_cache: bool,
    pub url: String,
    pub fetched_at: String,
    pub cache_key: String,
}

pub struct FetchPipeline {
    fetcher: SecureFetcher,
    pool: Arc<TransformPool>,
    cache: Arc<Cache>,
    cache_enabled: bool,
    default_ttl: Duration,
    max_inline_content_chars: usize,
}

impl FetchPipeline {
    pub fn new(
        fetcher: SecureFetcher,
        pool: Arc<TransformPool>,
        cache: Arc<Cache>,
        cache_enabled: bool,
        default_ttl: Duration,
        max_inline_content_chars: usize,
    ) -> Self {
        Self { fetcher, pool, cache, cache_enabled, default_ttl, max_inline_content_chars }
    }

    pub async fn run(&self, params: PipelineParams, cancel: &CancellationToken) -> Result<PipelineOutcome, FetchError> {
        let normalised = normalise(&params.url)?;
        let rewritten = transform_to_raw_url(&normalised);
        if rewritten.transformed {
            tracing::debug!(from = %normalised, to = %rewritten.url, "rewrote url to raw content variant");
        }
        let u = rewritten.url;

        let key = create_cache_key(&params.cache_namespace, &u, params.cache_vary.as_ref());

        if let Some(entry) = self.cache.get(&key, false) {
            if let Ok(cached) = serde_json::from_str::<TransformResult>(&entry.content) {
                return Ok(PipelineOutcome {
                    markdown: cached.markdown,
                    title: cached.title,
                    truncated: cached.truncated,
                    from_cache: true,
                    url: u,
                    fetched_at: entry.fetched_at,
                    cache_key: key,
                });
            }
        }

        let opts = FetchOptions { timeout: params.timeout, max_bytes: params.max_bytes, headers: params.headers };
        let u_for_attempt = u.clone();
        let fetched = with_retry(params.retries, cancel, |_attempt| {
            let u = u_for_attempt.clone();
            let opts = &opts;
            async move { self.fetcher.fetch(&u, opts, cancel).await }
        })
        .await?;

        let transform_result = if params.transform == TransformKind::Markdown
            && looks_like_html(fetched.content_type.as_deref(), &fetched.text)
        {
            self.pool.transform(fetched.text.clone(), u.clone(), params.include_metadata, cancel).await?
        } else {
            TransformResult { markdown: fetched.text.clone(), title: None, truncated: fetched.truncated }
        };

        if self.cache_enabled {
            let serialised = serde_json::to_string(&transform_result)
                .map_err(|e| FetchError::new(ErrorKind::InternalError, format!("failed to serialise transform result: {e}")))?;
            self.cache.set(&key, serialised, u.clone(), transform_result.title.clone(), Some(self.default_ttl));
        } else if transform_result.markdown.len() > self.max_inline_content_chars {
            // Forced write: even with the cache disabled, an oversized
            // payload needs a stable resource-link target.
            let serialised = serde_json::to_string(&transform_result)
                .map_err(|e| FetchError::new(ErrorKind::InternalError, format!("failed to serialise transform result: {e}")))?;
            self.cache.set(&key, serialised, u.clone(), transform_result.title.clone(), Some(self.default_ttl));
        }

        Ok(PipelineOutcome {
            markdown: transform_result.markdown,
            title: transform_result.title,
            truncated: transform_result.truncated,
            from_cache: false,
            url: u,
            fetched_at: crate::cache::now_rfc3339(),
            cache_key: key,
        })
    }

    /// After a pipeline run, decides whether the result fits inline or must
    /// be returned as a resource link. The cache key is stable either way so
    /// repeated calls land on the same resource.
    pub fn exceeds_inline_limit(&self, content: &str) -> bool {
        content.len() > self.max_inline_content_chars
    }

    /// Gives the MCP `resources/read` handler direct access to the same
    /// cache the pipeline writes through, so a resource link can be
    /// resolved without re-running the fetch.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if let Some(ct) = content_type {
        if ct.to_ascii_lowercase().contains("html") {
            return true;
        }
    }
    let trimmed = body.trim_start();
    trimmed.starts_with('<')
}
