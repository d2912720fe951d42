//! C3 — Fetcher: one HTTP request at a time, manual redirect handling (each
//! hop re-validated through the secure resolver), charset decoding and
//! binary rejection.
//!
//! Grounded on this repo's original `LocalFetcher` (streaming body read
//! bounded by `max_bytes`, sensitive-header stripping) for the reqwest
//! client-builder conventions, and on a sibling `webfetch` SSRF module for
//! the manual redirect / per-hop DNS re-validation shape.
use crate::binary::sniff_binary;
use crate::resolver::{resolve_secure, DnsOrder};
use fetchguard_core::{ErrorKind, FetchError, Stage};
use futures_util::StreamExt;
use reqwest::redirect::Policy;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const MAX_REDIRECT_HOPS: usize = 5;
const DEFAULT_MAX_HTML_BYTES: usize = 10 * 1024 * 1024;
const CHARSET_SCAN_WINDOW: usize = 8 * 1024;

/// Content-types accepted besides the bare `text/*` prefix.
const ALLOWED_APPLICATION_SUBTYPES: &[&str] = &[
    "json",
    "xml",
    "xhtml+xml",
    "rss+xml",
    "atom+xml",
    "javascript",
    "ecmascript",
    "ld+json",
    "x-yaml",
    "yaml",
];

pub struct FetchedBody {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub text: String,
    pub truncated: bool,
}

pub struct FetchOptions {
    pub timeout: Duration,
    pub max_bytes: usize,
    pub headers: BTreeMap<String, String>,
}

pub struct SecureFetcher {
    pool_max_idle_per_host: usize,
    connect_timeout: Duration,
    dns_order: DnsOrder,
}

impl SecureFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_dns_order(DnsOrder::Verbatim)
    }

    pub fn with_dns_order(dns_order: DnsOrder) -> Result<Self, FetchError> {
        // Sanity-build once at startup so a broken TLS backend fails fast,
        // even though every actual request builds its own pinned client.
        reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| FetchError::new(ErrorKind::InternalError, format!("failed to build http client: {e}")))?;
        Ok(Self {
            pool_max_idle_per_host: usize::max(2 * num_cpus(), 25),
            connect_timeout: Duration::from_secs(10),
            dns_order,
        })
    }

    /// Builds a client whose connection to `host` is pinned to the exact
    /// addresses the secure resolver already validated. Without this, a
    /// DNS-rebinding attacker could serve a safe address to the preflight
    /// lookup and a private one to the connection reqwest performs a moment
    /// later, defeating the SSRF check entirely.
    fn pinned_client(&self, host: &str, port: u16, ips: &[std::net::IpAddr]) -> Result<reqwest::Client, FetchError> {
        let addrs: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
        reqwest::Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .connect_timeout(self.connect_timeout)
            .resolve_to_addrs(host, &addrs)
            .build()
            .map_err(|e| FetchError::new(ErrorKind::InternalError, format!("failed to build pinned http client: {e}")))
    }

    /// `fetch(normalisedUrl, opts) -> decodedBodyString | FetchError`. One
    /// attempt end to end, including following redirects manually. `cancel`
    /// propagates into the DNS preflight and the in-flight request.
    pub async fn fetch(
        &self,
        normalised_url: &str,
        opts: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<FetchedBody, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::aborted().with_url(normalised_url));
        }
        let mut current = normalised_url.to_string();
        for hop in 0..=MAX_REDIRECT_HOPS {
            let url = Url::parse(&current)
                .map_err(|e| FetchError::new(ErrorKind::ValidationError, format!("invalid url: {e}")).with_url(&current))?;
            let host = url
                .host_str()
                .ok_or_else(|| FetchError::new(ErrorKind::ValidationError, "url has no host").with_url(&current))?;
            let port = url.port_or_known_default().unwrap_or(80);

            let resolved_ips = resolve_secure(host, port, cancel, self.dns_order).await?;
            let client = self.pinned_client(host, port, &resolved_ips)?;

            let mut builder = client.get(url.clone()).timeout(opts.timeout);
            for (k, v) in &opts.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }

            let resp = tokio::select! {
                res = builder.send() => res.map_err(|e| map_request_error(e, &current))?,
                _ = cancel.cancelled() => return Err(FetchError::aborted().with_stage(Stage::FetchRequest).with_url(&current)),
            };
            let status = resp.status();

            if status.is_redirection() {
                if hop == MAX_REDIRECT_HOPS {
                    return Err(FetchError::new(ErrorKind::Http4xx, "too many redirects")
                        .with_stage(Stage::FetchRequest)
                        .with_url(&current)
                        .with_status(502));
                }
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FetchError::new(ErrorKind::Http5xx, "redirect without Location header")
                            .with_stage(Stage::FetchRequest)
                            .with_url(&current)
                    })?;
                current = url
                    .join(location)
                    .map_err(|e| FetchError::new(ErrorKind::ValidationError, format!("invalid redirect target: {e}")).with_url(&current))?
                    .to_string();
                continue;
            }

            if status.as_u16() == 429 {
                let retry_after_ms = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs.saturating_mul(1000));
                let mut err = FetchError::new(ErrorKind::RateLimited, "rate limited by upstream")
                    .with_stage(Stage::FetchRequest)
                    .with_url(&current)
                    .with_status(429);
                if let Some(ms) = retry_after_ms {
                    err = err.with_retry_after_ms(ms);
                }
                return Err(err);
            }

            if status.is_client_error() {
                return Err(FetchError::new(ErrorKind::Http4xx, format!("upstream returned {status}"))
                    .with_stage(Stage::FetchRequest)
                    .with_url(&current)
                    .with_status(status.as_u16()));
            }
            if status.is_server_error() {
                return Err(FetchError::new(ErrorKind::Http5xx, format!("upstream returned {status}"))
                    .with_stage(Stage::FetchRequest)
                    .with_url(&current)
                    .with_status(status.as_u16()));
            }

            let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
            check_content_type(content_type.as_deref(), &current)?;

            let mut headers = BTreeMap::new();
            for (name, value) in resp.headers() {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.as_str().to_string(), v.to_string());
                }
            }
            let final_url = resp.url().to_string();

            let bytes = read_body_bounded(resp, opts.max_bytes, &current, cancel).await?;
            if let Some(format) = sniff_binary(&bytes) {
                return Err(FetchError::new(ErrorKind::BinaryContent, format!("response body looks like binary ({format})"))
                    .with_stage(Stage::FetchBody)
                    .with_url(&current));
            }

            let (text, truncated) = decode_and_truncate(&bytes, content_type.as_deref());

            return Ok(FetchedBody {
                final_url,
                status: status.as_u16(),
                content_type,
                headers,
                text,
                truncated,
            });
        }
        unreachable!("loop either returns or errors before exhausting hops")
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn map_request_error(e: reqwest::Error, url: &str) -> FetchError {
    if e.is_timeout() {
        FetchError::timeout(Stage::FetchRequest).with_url(url)
    } else {
        FetchError::new(ErrorKind::Http5xx, format!("network error: {e}"))
            .with_stage(Stage::FetchRequest)
            .with_url(url)
            .with_status(502)
    }
}

fn check_content_type(content_type: Option<&str>, url: &str) -> Result<(), FetchError> {
    let Some(ct) = content_type else {
        return Ok(());
    };
    let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if mime.starts_with("text/") {
        return Ok(());
    }
    if let Some(subtype) = mime.strip_prefix("application/") {
        if ALLOWED_APPLICATION_SUBTYPES.iter().any(|s| *s == subtype) {
            return Ok(());
        }
    }
    Err(FetchError::new(ErrorKind::UnsupportedContentType, format!("unsupported content-type: {mime}"))
        .with_stage(Stage::FetchBody)
        .with_url(url))
}

async fn read_body_bounded(
    resp: reqwest::Response,
    max_bytes: usize,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError> {
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(FetchError::aborted().with_stage(Stage::FetchBody).with_url(url)),
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| map_request_error(e, url))?;
        buf.extend_from_slice(&chunk);
        if buf.len() >= max_bytes {
            buf.truncate(max_bytes);
            break;
        }
    }
    Ok(buf)
}

/// Charset priority: BOM bytes, then `Content-Type: charset=`, then an HTML
/// meta tag or XML declaration within the first 8 KiB. Then enforces the
/// max-HTML-size limit, truncating at the nearest `>` within a 10% window.
fn decode_and_truncate(bytes: &[u8], content_type: Option<&str>) -> (String, bool) {
    let encoding = detect_bom(bytes)
        .or_else(|| content_type.and_then(detect_content_type_charset))
        .or_else(|| detect_meta_charset(bytes))
        .unwrap_or(encoding_rs::UTF_8);

    let (cow, _, _) = encoding.decode(bytes);
    let text = cow.into_owned();

    if text.len() <= DEFAULT_MAX_HTML_BYTES {
        return (text, false);
    }
    (truncate_at_tag_boundary(&text, DEFAULT_MAX_HTML_BYTES), true)
}

fn detect_bom(bytes: &[u8]) -> Option<&'static encoding_rs::Encoding> {
    encoding_rs::Encoding::for_bom(bytes).map(|(enc, _len)| enc)
}

fn detect_content_type_charset(content_type: &str) -> Option<&'static encoding_rs::Encoding> {
    let lower = content_type.to_ascii_lowercase();
    let idx = lower.find("charset=")?;
    let rest = &lower[idx + "charset=".len()..];
    let name = rest.split([';', ' ', '"', '\'']).next()?.trim();
    encoding_rs::Encoding::for_label(name.as_bytes())
}

fn detect_meta_charset(bytes: &[u8]) -> Option<&'static encoding_rs::Encoding> {
    let window = &bytes[..bytes.len().min(CHARSET_SCAN_WINDOW)];
    let ascii = String::from_utf8_lossy(window);
    let lower = ascii.to_ascii_lowercase();

    if let Some(idx) = lower.find("charset=") {
        let rest = &lower[idx + "charset=".len()..];
        let name = rest.trim_start_matches(['"', '\'']).split(['"', '\'', ' ', '>', ';']).next()?;
        if let Some(enc) = encoding_rs::Encoding::for_label(name.as_bytes()) {
            return Some(enc);
        }
    }
    if let Some(idx) = lower.find("encoding=") {
        let rest = &lower[idx + "encoding=".len()..];
        let name = rest.trim_start_matches(['"', '\'']).split(['"', '\'', ' ', '?']).next()?;
        return encoding_rs::Encoding::for_label(name.as_bytes());
    }
    None
}

fn truncate_at_tag_boundary(text: &str, limit: usize) -> String {
    let window_start = limit.saturating_sub(limit / 10);
    let search_region = &text[window_start.min(text.len())..limit.min(text.len())];
    if let Some(rel_idx) = search_region.rfind('>') {
        let cut = window_start + rel_idx + 1;
        return text[..cut].to_string();
    }
    let mut cut = limit.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_gate_accepts_text() {
        assert!(check_content_type(Some("text/html; charset=utf-8"), "u").is_ok());
    }

    #[test]
    fn content_type_gate_accepts_whitelisted_application() {
        assert!(check_content_type(Some("application/json"), "u").is_ok());
    }

    #[test]
    fn content_type_gate_rejects_octet_stream() {
        assert!(check_content_type(Some("application/octet-stream"), "u").is_err());
    }

    #[test]
    fn meta_charset_is_detected() {
        let html = b"<html><head><meta charset=\"iso-8859-1\"></head></html>";
        let enc = detect_meta_charset(html).unwrap();
        assert_eq!(enc.name(), "windows-1252");
    }

    #[test]
    fn bom_takes_priority_over_meta() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"<meta charset=\"iso-8859-1\">");
        let (text, _) = decode_and_truncate(&bytes, None);
        assert!(text.starts_with("<meta"));
    }

    #[test]
    fn truncation_lands_on_a_tag_boundary() {
        let html = format!("<p>{}</p><div>tail</div>", "x".repeat(100));
        let truncated = truncate_at_tag_boundary(&html, 90);
        assert!(truncated.ends_with('>'));
    }
}
