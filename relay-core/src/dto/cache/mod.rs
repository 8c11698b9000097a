//! Artifact cache DTOs

use serde::{Deserialize, Serialize};

/// Query string of `GET /cache`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupQuery {
    /// Comma separated; the first key is matched exactly, the rest as prefixes
    #[serde(default)]
    pub keys: String,
    #[serde(default)]
    pub version: String,
}

impl LookupQuery {
    /// Splits `keys`, keeping every position
    ///
    /// Only a trailing empty entry (from a trailing comma or an empty
    /// parameter) is dropped, so the first entry always stays the exact key.
    pub fn key_list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.split(',').map(str::to_string).collect();
        if keys.last().is_some_and(|k| k.is_empty()) {
            keys.pop();
        }
        keys
    }
}

/// Body of a cache hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHit {
    pub result: String,
    pub archive_location: String,
    pub cache_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveCacheRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheResponse {
    pub cache_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_list_keeps_positions() {
        let query = LookupQuery {
            keys: "linux-npm-abc,linux-npm-,".to_string(),
            version: "v1".to_string(),
        };
        assert_eq!(query.key_list(), vec!["linux-npm-abc", "linux-npm-"]);

        let no_exact = LookupQuery {
            keys: ",linux-npm-".to_string(),
            version: "v1".to_string(),
        };
        assert_eq!(no_exact.key_list(), vec!["", "linux-npm-"]);

        let empty = LookupQuery {
            keys: String::new(),
            version: "v1".to_string(),
        };
        assert!(empty.key_list().is_empty());
    }
}
