//! Relay artifact cache
//!
//! A small HTTP blob store that jobs use to save and restore build caches.
//! Metadata lives in SQLite, payloads as flat files; stale entries are
//! garbage collected after requests and on a timer.

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod server;
pub mod service;
pub mod storage;

pub use config::CacheConfig;
pub use server::{CacheServer, ServerError};
pub use service::cache_service::{CacheError, CacheService};
