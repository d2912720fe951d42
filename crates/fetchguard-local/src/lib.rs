//! The secure fetch pipeline: URL normalisation (C1), SSRF-safe DNS
//! resolution (C2), the manual-redirect fetcher (C3), retry with backoff
//! (C4), the in-memory cache (C5), the Markdown transform worker pool (C6),
//! and pipeline composition (C7).

pub mod binary;
pub mod cache;
pub mod fetcher;
pub mod links;
pub mod pipeline;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod url;

pub use cache::{Cache, ChangeEvent};
pub use fetcher::{FetchOptions, FetchedBody, SecureFetcher};
pub use links::extract_links;
pub use pipeline::{FetchPipeline, PipelineOutcome, PipelineParams, TransformKind};
pub use pool::{PoolConfig, TransformPool};
pub use resolver::{resolve_secure, DnsOrder};
pub use retry::with_retry;
pub use url::{normalise, transform_to_raw_url, RawUrlTransform};
