//! Repository Module
//!
//! Data access layer for the cache index.

pub mod cache;

// Re-export for convenience
pub use cache as cache_repository;
