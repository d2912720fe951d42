use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kinds named by the taxonomy, not by Rust type — one enum carries all
/// of them so callers match on `.kind()` rather than on a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    HostNotAllowed,
    OriginNotAllowed,
    UnsupportedContentType,
    BinaryContent,
    Eblocked,
    #[serde(rename = "ETIMEOUT")]
    DnsTimeout,
    Enodata,
    Timeout,
    Aborted,
    RateLimited,
    Http5xx,
    Http4xx,
    SessionNotFound,
    ServerBusy,
    InternalError,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying, per the table in
    /// the error-handling design.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::DnsTimeout | ErrorKind::Enodata | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Http5xx
        )
    }

    /// The HTTP-equivalent status surfaced to a tool caller.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::HostNotAllowed | ErrorKind::OriginNotAllowed => 403,
            ErrorKind::UnsupportedContentType | ErrorKind::BinaryContent => 415,
            ErrorKind::Eblocked => 502,
            ErrorKind::DnsTimeout => 504,
            ErrorKind::Enodata => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Aborted => 499,
            ErrorKind::RateLimited => 429,
            ErrorKind::Http5xx => 502,
            ErrorKind::Http4xx => 400,
            ErrorKind::SessionNotFound => 404,
            ErrorKind::ServerBusy => 503,
            ErrorKind::InternalError => 500,
        }
    }
}

/// A pipeline stage tag, attached when an error is re-thrown across a
/// component boundary so the caller can tell where it originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    DnsPreflight,
    FetchRequest,
    FetchBody,
    TransformDispatch,
    TransformWorkerTimeout,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::DnsPreflight => "dns:preflight",
            Stage::FetchRequest => "fetch:request",
            Stage::FetchBody => "fetch:body",
            Stage::TransformDispatch => "transform:dispatch",
            Stage::TransformWorkerTimeout => "transform:worker-timeout",
        }
    }
}

/// The one error type that crosses every component boundary in the fetch
/// pipeline. Carries enough context to build both a JSON-RPC error object and
/// a tool `ToolErrorResponse` without re-deriving anything.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
    pub url: Option<String>,
    pub stage: Option<Stage>,
    pub status_code: Option<u16>,
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            url: None,
            stage: None,
            status_code: None,
            retry_after_ms: None,
            details: Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.details.is_object() {
            self.details = Value::Object(Default::default());
        }
        self.details[key] = value.into();
        self
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "operation was aborted").with_status(499)
    }

    pub fn timeout(stage: Stage) -> Self {
        Self::new(ErrorKind::Timeout, "deadline exceeded")
            .with_stage(stage)
            .with_status(504)
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// Tag this error with a stage, unless it already carries one — matches
    /// the propagation policy: annotate once, at the first boundary crossed.
    pub fn annotate(mut self, url: &str, stage: Stage) -> Self {
        if self.url.is_none() {
            self.url = Some(url.to_string());
        }
        if self.stage.is_none() {
            self.stage = Some(stage);
        }
        self
    }
}

/// Backend-agnostic result alias used throughout the fetch pipeline.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
