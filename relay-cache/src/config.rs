//! Cache service configuration

use std::path::PathBuf;
use std::time::Duration;

/// Settings for the embedded artifact cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the SQLite index and the blob store
    pub dir: PathBuf,

    /// Host the cache is advertised on; detected from the outbound route when unset
    pub host: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Incomplete records untouched for this long are reclaimed
    pub idle_timeout: Duration,

    /// Any record untouched for this long is reclaimed
    pub expiration: Duration,

    /// Interval of the background sweep that runs regardless of traffic
    pub gc_interval: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            host: None,
            port: 0,
            idle_timeout: Duration::from_secs(30 * 60),
            expiration: Duration::from_secs(30 * 24 * 60 * 60),
            gc_interval: Duration::from_secs(10 * 60),
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host.filter(|h| !h.is_empty());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("sqlite.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.dir.join("cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = CacheConfig::new("/tmp/actcache");
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.expiration, Duration::from_secs(2_592_000));
        assert_eq!(config.index_path(), PathBuf::from("/tmp/actcache/sqlite.db"));
        assert_eq!(config.blob_dir(), PathBuf::from("/tmp/actcache/cache"));
    }

    #[test]
    fn test_empty_host_means_detect() {
        let config = CacheConfig::new("/tmp/actcache").with_host(Some(String::new()));
        assert!(config.host.is_none());

        let config = config.with_host(Some("10.1.2.3".to_string())).with_port(4000);
        assert_eq!(config.host.as_deref(), Some("10.1.2.3"));
        assert_eq!(config.port, 4000);
    }
}
