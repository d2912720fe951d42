//! Backend-agnostic types, the fetch-pipeline error taxonomy, canonical JSON
//! for cache keys, and the JSON-RPC envelope shared by the session layer.
//! This crate performs no IO.

pub mod domain;
pub mod error;
pub mod jsonrpc;
pub mod stable_json;

pub use domain::*;
pub use error::{ErrorKind, FetchError, FetchResult, Stage};
pub use stable_json::{create_cache_key, stable_stringify};
