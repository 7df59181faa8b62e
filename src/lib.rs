//! Dependency-aware caching engine with reference-counted named locks.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod soak;
