//! Cache domain types

use serde::{Deserialize, Serialize};

/// Metadata for one cached blob
///
/// At most one complete record exists per `(key, version)` pair. A record is
/// only ever served as a hit when `complete` is set and its blob exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub complete: bool,
    /// Last read/write touch, unix seconds
    pub used_at: i64,
}
