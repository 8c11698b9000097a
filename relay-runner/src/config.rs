//! Runner configuration
//!
//! Defines all configurable parameters for the runner: concurrency,
//! fetch pacing, job lifetime, reporting cadence, the embedded artifact
//! cache and the workflow engine command.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of variables forwarded into every job's environment
pub const ENV_PREFIX: &str = "RELAY_ENV_";

/// Runner configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default tracing level when RUST_LOG is unset
    pub log_level: String,

    /// Where the registration is persisted
    pub registration_file: PathBuf,

    /// Maximum number of tasks executed concurrently
    pub capacity: usize,

    /// Extra environment passed to every job
    pub envs: HashMap<String, String>,

    /// Maximum lifetime of a single job
    pub timeout: Duration,

    /// Timeout of one fetch request
    pub fetch_timeout: Duration,

    /// Minimum spacing between fetch requests
    pub fetch_interval: Duration,

    /// Pause after a failed fetch
    pub retry_delay: Duration,

    /// How often a running task flushes logs and state
    pub report_interval: Duration,

    /// Skip TLS certificate verification towards the control plane
    pub insecure: bool,

    pub cache: CacheSettings,

    /// Workflow engine command line (program followed by fixed arguments)
    pub engine: String,
}

/// Settings of the embedded artifact cache
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Advertised host; detected from the outbound route when unset
    pub host: Option<String>,
    /// 0 picks an ephemeral port
    pub port: u16,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            registration_file: PathBuf::from(".runner"),
            capacity: 1,
            envs: HashMap::new(),
            timeout: Duration::from_secs(3 * 60 * 60),
            fetch_timeout: Duration::from_secs(5),
            fetch_interval: Duration::from_secs(2),
            retry_delay: Duration::from_secs(5),
            report_interval: Duration::from_millis(1000),
            insecure: false,
            cache: CacheSettings {
                enabled: true,
                dir: default_cache_dir(None),
                host: None,
                port: 0,
            },
            engine: "act-engine".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - RELAY_LOG_LEVEL (default: info)
    /// - RELAY_REGISTRATION_FILE (default: .runner)
    /// - RELAY_CAPACITY (default: 1)
    /// - RELAY_ENV_<NAME> (forwarded to jobs as <NAME>)
    /// - RELAY_TIMEOUT (seconds, default: 10800)
    /// - RELAY_FETCH_TIMEOUT (seconds, default: 5)
    /// - RELAY_FETCH_INTERVAL (seconds, default: 2)
    /// - RELAY_RETRY_DELAY (seconds, default: 5)
    /// - RELAY_REPORT_INTERVAL (milliseconds, default: 1000)
    /// - RELAY_INSECURE (default: false)
    /// - RELAY_CACHE_ENABLED (default: true)
    /// - RELAY_CACHE_DIR (default: $HOME/.cache/actcache)
    /// - RELAY_CACHE_HOST (default: detected)
    /// - RELAY_CACHE_PORT (default: 0)
    /// - RELAY_ENGINE (default: act-engine)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the configuration from an explicit set of variables
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |name: &str| lookup(&vars, name);
        let defaults = Self::new();

        let secs = |name: &str, default: Duration| {
            get(name)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let capacity = get("RELAY_CAPACITY")
            .and_then(|s| s.parse::<i64>().ok())
            .map(|c| c.max(1) as usize)
            .unwrap_or(defaults.capacity);

        let envs = vars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        let report_interval = get("RELAY_REPORT_INTERVAL")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.report_interval);

        let cache = CacheSettings {
            enabled: get("RELAY_CACHE_ENABLED")
                .map(parse_bool)
                .unwrap_or(defaults.cache.enabled),
            dir: get("RELAY_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_cache_dir(get("HOME"))),
            host: get("RELAY_CACHE_HOST").map(str::to_string),
            port: get("RELAY_CACHE_PORT")
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(defaults.cache.port),
        };

        Ok(Self {
            log_level: get("RELAY_LOG_LEVEL")
                .map(str::to_string)
                .unwrap_or(defaults.log_level),
            registration_file: get("RELAY_REGISTRATION_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.registration_file),
            capacity,
            envs,
            timeout: secs("RELAY_TIMEOUT", defaults.timeout),
            fetch_timeout: secs("RELAY_FETCH_TIMEOUT", defaults.fetch_timeout),
            fetch_interval: secs("RELAY_FETCH_INTERVAL", defaults.fetch_interval),
            retry_delay: secs("RELAY_RETRY_DELAY", defaults.retry_delay),
            report_interval,
            insecure: get("RELAY_INSECURE").map(parse_bool).unwrap_or(false),
            cache,
            engine: get("RELAY_ENGINE")
                .map(str::to_string)
                .unwrap_or(defaults.engine),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            anyhow::bail!("capacity must be greater than 0");
        }

        if self.timeout.is_zero() {
            anyhow::bail!("timeout must be greater than 0");
        }

        if self.fetch_timeout.is_zero() {
            anyhow::bail!("fetch_timeout must be greater than 0");
        }

        if self.fetch_interval.is_zero() {
            anyhow::bail!("fetch_interval must be greater than 0");
        }

        if self.report_interval.is_zero() {
            anyhow::bail!("report_interval must be greater than 0");
        }

        if self.engine.split_whitespace().next().is_none() {
            anyhow::bail!("engine command cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn default_cache_dir(home: Option<&str>) -> PathBuf {
    let home = home
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_default();
    home.join(".cache").join("actcache")
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
