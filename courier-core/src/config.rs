//! # Configuration
//!
//! Courier configuration is a flat string key/value store. Values are
//! layered by the application (defaults, then environment) and turned into
//! typed settings once, at startup, through [`EngineSettings::from_snapshot`].
//!
//! ## Environment overrides
//! Variables carrying the `COURIER__` prefix are lower-cased and `__`
//! becomes `.`:
//!
//! ```bash
//! export COURIER__CACHE__HOST=redis.internal   # cache.host
//! export COURIER__QUEUE__CONCURRENCY=50        # queue.concurrency
//! ```
//!
//! ```rust
//! use courier_core::config::{CourierConfig, EngineSettings};
//!
//! let mut config = CourierConfig::new();
//! config.set("cache.host", "localhost");
//! config.set("queue.concurrency", "20");
//!
//! let settings = EngineSettings::from_snapshot(&config.snapshot()).unwrap();
//! assert!(settings.cache.is_enabled());
//! assert_eq!(settings.queue.concurrency, 20);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Prefix used by [`CourierConfig::from_env`]
pub const ENV_PREFIX: &str = "COURIER__";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Default, Clone)]
pub struct CourierConfig {
    values: HashMap<String, String>,
}

impl CourierConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Build a config store from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        config.load_env(ENV_PREFIX, std::env::vars());
        config
    }

    /// Load `PREFIX__SECTION__KEY=value` pairs as `section.key`.
    pub fn load_env<I>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                self.set(normalized, value);
            }
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn snapshot(&self) -> CourierConfigSnapshot {
        CourierConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CourierConfigSnapshot {
    map: HashMap<String, String>,
}

impl CourierConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    /// Parse a value, failing loudly on malformed input instead of silently
    /// falling back to the default.
    pub fn parse<T: FromStr>(&self, key: &str) -> ConfigResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> ConfigResult<T> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub fn millis_or(&self, key: &str, default_ms: u64) -> ConfigResult<Duration> {
        self.parse_or(key, default_ms).map(Duration::from_millis)
    }

    pub fn get_bool(&self, key: &str) -> ConfigResult<bool> {
        match self.get(key) {
            None => Ok(false),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            },
        }
    }
}

/// Deployment mode. Destructive maintenance operations only run in `Test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeEnv {
    #[default]
    Production,
    Development,
    Test,
}

impl RuntimeEnv {
    pub fn allows_destructive_ops(&self) -> bool {
        matches!(self, Self::Test)
    }
}

impl FromStr for RuntimeEnv {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "local" => Ok(Self::Development),
            "test" | "ci" => Ok(Self::Test),
            other => Err(ConfigError::Invalid {
                key: "runtime.env".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Test => "test",
        };
        write!(f, "{name}")
    }
}

/// Connection details for one key/value backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<u32>,
    pub tls: bool,
}

impl BackendEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: None,
            tls: false,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_db(mut self, db: Option<u32>) -> Self {
        self.db = db;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Connection url in `redis://[:password@]host:port[/db]` form.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_ref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let db = self.db.map(|db| format!("/{db}")).unwrap_or_default();
        format!("{scheme}://{auth}{}:{}{db}", self.host, self.port)
    }

    /// Parse `host[:port]`, defaulting the port.
    pub fn parse(raw: &str, default_port: u16) -> ConfigResult<Self> {
        let raw = raw.trim();
        let invalid = || ConfigError::Invalid {
            key: "endpoint".to_string(),
            value: raw.to_string(),
        };
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(invalid()),
            None if raw.is_empty() => Err(invalid()),
            None => Ok(Self::new(raw, default_port)),
        }
    }
}

/// Cache Store settings. The cache is disabled when no endpoint is set.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Master switch; a cache without an endpoint is off regardless
    pub enabled: bool,
    pub endpoint: Option<BackendEndpoint>,
    pub connect_timeout: Duration,
    pub key_prefix: Option<String>,
    /// Default entry TTL in seconds
    pub default_ttl_secs: u64,
}

impl CacheSettings {
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.endpoint.is_some()
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            connect_timeout: Duration::from_secs(10),
            key_prefix: None,
            default_ttl_secs: 60 * 60 * 2,
        }
    }
}

/// Distributed lock settings; quorum tuning follows the usual Redlock knobs.
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub endpoints: Vec<BackendEndpoint>,
    pub connect_timeout: Duration,
    /// Fraction of the lock TTL reserved for clock drift between backends
    pub drift_factor: f64,
    /// Extra acquisition rounds after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to `retry_delay`
    pub retry_jitter: Duration,
    /// Longest wait for one backend to answer a lock or unlock call.
    /// Kept well under `default_ttl`; a slower backend counts as a denial.
    pub backend_timeout: Duration,
    pub default_ttl: Duration,
}

impl LockSettings {
    pub fn is_enabled(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            drift_factor: 0.01,
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
            backend_timeout: Duration::from_millis(100),
            default_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub default_attempts: u32,
    /// Durable queue backend; the in-memory queue is used when unset
    pub endpoint: Option<BackendEndpoint>,
    pub key_prefix: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "standard".to_string(),
            concurrency: 200,
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
            default_attempts: 3,
            endpoint: None,
            key_prefix: "courier".to_string(),
        }
    }
}

/// Settings handed to repository implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceSettings {
    pub min_pool: u32,
    pub max_pool: u32,
    pub auto_index: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            min_pool: 10,
            max_pool: 50,
            auto_index: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub env: RuntimeEnv,
    pub cache: CacheSettings,
    pub lock: LockSettings,
    pub queue: QueueSettings,
    pub persistence: PersistenceSettings,
}

impl EngineSettings {
    /// Read typed settings from the `COURIER__*` environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_snapshot(&CourierConfig::from_env().snapshot())
    }

    pub fn from_snapshot(snapshot: &CourierConfigSnapshot) -> ConfigResult<Self> {
        let defaults = Self::default();

        let env = snapshot.parse_or("runtime.env", defaults.env)?;

        let cache = CacheSettings {
            enabled: match snapshot.get("cache.enabled") {
                Some(_) => snapshot.get_bool("cache.enabled")?,
                None => defaults.cache.enabled,
            },
            endpoint: endpoint_from(snapshot, "cache")?,
            connect_timeout: snapshot.millis_or("cache.connect_timeout_ms", 10_000)?,
            key_prefix: snapshot.get_string("cache.key_prefix"),
            default_ttl_secs: snapshot.parse_or("cache.ttl_secs", defaults.cache.default_ttl_secs)?,
        };

        let lock_password = snapshot.get_string("lock.password");
        let lock_tls = snapshot.get_bool("lock.tls")?;
        let endpoints = match snapshot.get("lock.endpoints") {
            Some(raw) => raw
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| {
                    BackendEndpoint::parse(part, 6379).map(|endpoint| {
                        endpoint
                            .with_password(lock_password.clone())
                            .with_tls(lock_tls)
                    })
                })
                .collect::<ConfigResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let lock = LockSettings {
            endpoints,
            connect_timeout: snapshot.millis_or("lock.connect_timeout_ms", 10_000)?,
            drift_factor: snapshot.parse_or("lock.drift_factor", defaults.lock.drift_factor)?,
            retry_count: snapshot.parse_or("lock.retry_count", defaults.lock.retry_count)?,
            retry_delay: snapshot.millis_or("lock.retry_delay_ms", 200)?,
            retry_jitter: snapshot.millis_or("lock.retry_jitter_ms", 200)?,
            backend_timeout: snapshot.millis_or("lock.backend_timeout_ms", 100)?,
            default_ttl: snapshot.millis_or("lock.ttl_ms", 5_000)?,
        };
        if lock.backend_timeout.is_zero() || lock.backend_timeout >= lock.default_ttl {
            return Err(ConfigError::Inconsistent(format!(
                "lock.backend_timeout_ms ({:?}) must be positive and below lock.ttl_ms ({:?})",
                lock.backend_timeout, lock.default_ttl
            )));
        }
        if !(0.0..1.0).contains(&lock.drift_factor) {
            return Err(ConfigError::Invalid {
                key: "lock.drift_factor".to_string(),
                value: lock.drift_factor.to_string(),
            });
        }

        let queue = QueueSettings {
            name: snapshot.get_string("queue.name").unwrap_or(defaults.queue.name),
            concurrency: snapshot.parse_or("queue.concurrency", defaults.queue.concurrency)?,
            lease_duration: Duration::from_secs(snapshot.parse_or("queue.lease_secs", 300u64)?),
            poll_interval: snapshot.millis_or("queue.poll_interval_ms", 100)?,
            default_attempts: snapshot
                .parse_or("queue.default_attempts", defaults.queue.default_attempts)?,
            endpoint: endpoint_from(snapshot, "queue")?,
            key_prefix: snapshot
                .get_string("queue.key_prefix")
                .unwrap_or(defaults.queue.key_prefix),
        };
        if queue.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "queue.concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        if queue.default_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "queue.default_attempts".to_string(),
                value: "0".to_string(),
            });
        }

        let persistence = PersistenceSettings {
            min_pool: snapshot.parse_or("persistence.min_pool", defaults.persistence.min_pool)?,
            max_pool: snapshot.parse_or("persistence.max_pool", defaults.persistence.max_pool)?,
            auto_index: snapshot.get_bool("persistence.auto_index")?,
        };
        if persistence.min_pool > persistence.max_pool {
            return Err(ConfigError::Inconsistent(format!(
                "persistence.min_pool ({}) exceeds persistence.max_pool ({})",
                persistence.min_pool, persistence.max_pool
            )));
        }

        Ok(Self {
            env,
            cache,
            lock,
            queue,
            persistence,
        })
    }
}

fn endpoint_from(snapshot: &CourierConfigSnapshot, section: &str) -> ConfigResult<Option<BackendEndpoint>> {
    let Some(host) = snapshot.get_string(&format!("{section}.host")) else {
        return Ok(None);
    };
    let port = snapshot.parse_or(&format!("{section}.port"), 6379u16)?;
    Ok(Some(
        BackendEndpoint::new(host, port)
            .with_password(snapshot.get_string(&format!("{section}.password")))
            .with_db(snapshot.parse(&format!("{section}.db"))?)
            .with_tls(snapshot.get_bool(&format!("{section}.tls"))?),
    ))
}
