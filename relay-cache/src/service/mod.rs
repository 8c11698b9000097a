//! Service Module
//!
//! Business logic layer for the artifact cache. Services combine the
//! index repository with blob storage and own the protocol rules.

pub mod cache;

// Re-export for convenience
pub use cache as cache_service;
