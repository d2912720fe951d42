//! `fetchguard-mcp` crate (library surface).
//!
//! The primary entrypoint for end users is the `fetchguard` binary (CLI +
//! HTTP/session MCP server, plus an optional `--stdio` local mode). This
//! library module exists to support embedding and to give integration tests
//! a stable surface without depending on internal crate layout.

pub mod config;
pub mod http;
pub mod session;
pub mod task_manager;
pub mod tools;

#[cfg(feature = "stdio")]
pub mod stdio;

pub use fetchguard_core as core;
