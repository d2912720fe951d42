//! Public facade crate for `fetchguard`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `fetchguard-core`.

pub use fetchguard_core::*;
