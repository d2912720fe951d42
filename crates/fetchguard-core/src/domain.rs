//! Shared domain types that cross crate boundaries: the cache entry shape,
//! the transform task message contract, and the tool-facing response shapes.
use serde::{Deserialize, Serialize};

/// The cache entry stored under a `createCacheKey` result. Content is opaque
/// bytes as far as the cache is concerned — namespace decides how to
/// serialise/deserialise it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: String,
    pub fetched_at: String,
    pub expires_at: String,
    pub url: String,
    pub title: Option<String>,
}

/// A single worker-pool transform result, as delivered back to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformResult {
    pub markdown: String,
    pub title: Option<String>,
    pub truncated: bool,
}

/// Content returned to a tool caller, either inlined or spilled to a
/// resource link when it exceeds `maxInlineContentChars`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    ResourceLink { uri: String, name: String, mime_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorResponse {
    pub error: String,
    pub url: Option<String>,
    pub error_code: crate::error::ErrorKind,
}
