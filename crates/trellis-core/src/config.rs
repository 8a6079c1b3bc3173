//! # Configuration
//!
//! Reads the process environment once at startup into an [`AppConfig`].
//! Toggling a capability requires a restart.
//!
//! Parsing is written against a lookup function rather than
//! `std::env::var` directly so it can be exercised without mutating the
//! process environment.
//!
//! ## Variables
//!
//! | Variable                          | Default         |
//! |-----------------------------------|-----------------|
//! | `PORT`                            | `3000`          |
//! | `APP_ENV`                         | `development`   |
//! | `COMPONENTS_DIR`                  | `components`    |
//! | `SLOW_REQUEST_MS`                 | `1000`          |
//! | `BODY_LIMIT_BYTES`                | `5242880`       |
//! | `RATE_LIMIT_MAX`                  | `100`           |
//! | `RATE_LIMIT_WINDOW_SECS`          | `60`            |
//! | `SHUTDOWN_DRAIN_SECS`             | `10`            |
//! | `METRICS_ENABLED`                 | `false`         |
//! | `LOG_FORMAT`                      | `pretty`        |
//! | `ENABLE_DATABASE`                 | `false`         |
//! | `ENABLE_CACHE`                    | `false`         |
//! | `ENABLE_FILE_SERVICE`             | `false`         |
//! | `SERVICE_STRICT_CLIENT`           | `false`         |
//! | `SERVICE_CONNECT_TIMEOUT_SECS`    | `5`             |
//! | `SERVICE_RECONNECT_BASE_MS`       | `500`           |
//! | `SERVICE_RECONNECT_MAX_MS`        | `30000`         |
//! | `SERVICE_RECONNECT_MAX_ATTEMPTS`  | `10` (`0` = unbounded) |
//!
//! Per-capability connection parameters are documented on
//! [`DatabaseSettings`], [`CacheSettings`] and [`StorageSettings`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::capability::Capability;
use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::mode::RunMode;

/// What to do when an enabled capability fails to connect at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Abort the process before accepting traffic.
    Fatal,
    /// Continue with a Degraded handle and retry in the background.
    #[default]
    Degrade,
}

impl FromStr for StartupPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "degrade" => Ok(Self::Degrade),
            _ => Err(ConfigError::Invalid {
                key: "policy".to_string(),
                value: s.to_string(),
                reason: "expected fatal or degrade".to_string(),
            }),
        }
    }
}

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles on each consecutive failure.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Consecutive failures after which the handle stops retrying.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Enablement of one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggle<T> {
    Disabled,
    Enabled { policy: StartupPolicy, params: T },
}

impl<T> Toggle<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// PostgreSQL connection parameters.
///
/// Variables: `DATABASE_URL` (required when enabled),
/// `DATABASE_MAX_CONNECTIONS` (10), `DATABASE_MIGRATE` (false),
/// `DATABASE_POLICY` (degrade).
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    /// Run embedded migrations once the pool is ready.
    pub migrate: bool,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("migrate", &self.migrate)
            .finish()
    }
}

/// Redis connection parameters.
///
/// Variables: `REDIS_URL`, or `REDIS_HOST` (localhost), `REDIS_PORT`
/// (6379) and `REDIS_PASSWORD`; `CACHE_KEY_PREFIX` (empty);
/// `CACHE_POLICY` (degrade).
#[derive(Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub url: String,
    pub key_prefix: String,
}

impl std::fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSettings")
            .field("url", &"[REDACTED]")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Object store parameters.
///
/// Variables: `STORAGE_ENDPOINT`, or `MINIO_ENDPOINT` (required when
/// enabled), `MINIO_PORT` (9000) and `MINIO_USE_SSL` (false);
/// `MINIO_BUCKET` (default); `MINIO_ACCESS_KEY` and `MINIO_SECRET_KEY`,
/// set together or not at all, with `MINIO_REGION` (us-east-1) as the
/// signing region; `STORAGE_POLICY` (degrade).
///
/// Without keys, requests go out unsigned.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Declarative enablement map for the backing services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicesConfig {
    pub database: Toggle<DatabaseSettings>,
    pub cache: Toggle<CacheSettings>,
    pub storage: Toggle<StorageSettings>,
    /// Reject client access while a handle is mid-connect instead of
    /// returning the unavailable sentinel.
    pub strict_client: bool,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ServicesConfig {
    /// Every capability disabled.
    pub fn disabled() -> Self {
        Self {
            database: Toggle::Disabled,
            cache: Toggle::Disabled,
            storage: Toggle::Disabled,
            strict_client: false,
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::Database => self.database.is_enabled(),
            Capability::Cache => self.cache.is_enabled(),
            Capability::Storage => self.storage.is_enabled(),
        }
    }
}

/// Fixed-window admission control settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    pub mode: RunMode,
    /// Root of the route descriptor tree.
    pub components_dir: PathBuf,
    /// Requests slower than this are logged at WARN with memory statistics.
    pub slow_request: Duration,
    pub body_limit_bytes: usize,
    pub rate_limit: RateLimitSettings,
    /// Upper bound on the in-flight drain after a termination signal.
    pub shutdown_drain: Duration,
    pub metrics_enabled: bool,
    pub log_format: LogFormat,
    pub services: ServicesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            mode: RunMode::Development,
            components_dir: PathBuf::from("components"),
            slow_request: Duration::from_millis(1000),
            body_limit_bytes: 5 * 1024 * 1024,
            rate_limit: RateLimitSettings::default(),
            shutdown_drain: Duration::from_secs(10),
            metrics_enabled: false,
            log_format: LogFormat::Pretty,
            services: ServicesConfig::disabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = Self::default();

        let max_attempts = vars.parse("SERVICE_RECONNECT_MAX_ATTEMPTS", 10u32)?;
        let reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(vars.parse("SERVICE_RECONNECT_BASE_MS", 500u64)?),
            max_delay: Duration::from_millis(vars.parse("SERVICE_RECONNECT_MAX_MS", 30_000u64)?),
            max_attempts: (max_attempts > 0).then_some(max_attempts),
        };

        let services = ServicesConfig {
            database: database_toggle(&vars)?,
            cache: cache_toggle(&vars)?,
            storage: storage_toggle(&vars)?,
            strict_client: vars.flag("SERVICE_STRICT_CLIENT", false)?,
            connect_timeout: Duration::from_secs(vars.parse("SERVICE_CONNECT_TIMEOUT_SECS", 5u64)?),
            reconnect,
        };

        Ok(Self {
            port: vars.parse("PORT", defaults.port)?,
            mode: vars.parse("APP_ENV", defaults.mode)?,
            components_dir: vars
                .string("COMPONENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.components_dir),
            slow_request: Duration::from_millis(vars.parse("SLOW_REQUEST_MS", 1000u64)?),
            body_limit_bytes: vars.parse("BODY_LIMIT_BYTES", defaults.body_limit_bytes)?,
            rate_limit: RateLimitSettings {
                max_requests: vars.parse("RATE_LIMIT_MAX", defaults.rate_limit.max_requests)?,
                window: Duration::from_secs(vars.parse("RATE_LIMIT_WINDOW_SECS", 60u64)?),
            },
            shutdown_drain: Duration::from_secs(vars.parse("SHUTDOWN_DRAIN_SECS", 10u64)?),
            metrics_enabled: vars.flag("METRICS_ENABLED", false)?,
            log_format: vars.parse("LOG_FORMAT", defaults.log_format)?,
            services,
        })
    }
}

fn database_toggle<F>(vars: &Vars<F>) -> Result<Toggle<DatabaseSettings>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !vars.flag("ENABLE_DATABASE", false)? {
        return Ok(Toggle::Disabled);
    }
    let url = vars.required(Capability::Database, "DATABASE_URL")?;
    Ok(Toggle::Enabled {
        policy: vars.parse("DATABASE_POLICY", StartupPolicy::default())?,
        params: DatabaseSettings {
            url,
            max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", 10u32)?,
            migrate: vars.flag("DATABASE_MIGRATE", false)?,
        },
    })
}

fn cache_toggle<F>(vars: &Vars<F>) -> Result<Toggle<CacheSettings>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !vars.flag("ENABLE_CACHE", false)? {
        return Ok(Toggle::Disabled);
    }
    let url = match vars.string("REDIS_URL") {
        Some(url) => url,
        None => {
            let host = vars.string("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
            let port: u16 = vars.parse("REDIS_PORT", 6379)?;
            match vars.string("REDIS_PASSWORD") {
                Some(password) => format!("redis://:{password}@{host}:{port}"),
                None => format!("redis://{host}:{port}"),
            }
        }
    };
    Ok(Toggle::Enabled {
        policy: vars.parse("CACHE_POLICY", StartupPolicy::default())?,
        params: CacheSettings {
            url,
            key_prefix: vars.string("CACHE_KEY_PREFIX").unwrap_or_default(),
        },
    })
}

fn storage_toggle<F>(vars: &Vars<F>) -> Result<Toggle<StorageSettings>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !vars.flag("ENABLE_FILE_SERVICE", false)? {
        return Ok(Toggle::Disabled);
    }
    let endpoint = match vars.string("STORAGE_ENDPOINT") {
        Some(endpoint) => endpoint,
        None => {
            let host = vars.required(Capability::Storage, "MINIO_ENDPOINT")?;
            let port: u16 = vars.parse("MINIO_PORT", 9000)?;
            let scheme = if vars.flag("MINIO_USE_SSL", false)? {
                "https"
            } else {
                "http"
            };
            format!("{scheme}://{host}:{port}")
        }
    };
    let access_key = vars.string("MINIO_ACCESS_KEY");
    let secret_key = vars.string("MINIO_SECRET_KEY");
    match (&access_key, &secret_key) {
        (Some(_), None) => return Err(missing(Capability::Storage, "MINIO_SECRET_KEY")),
        (None, Some(_)) => return Err(missing(Capability::Storage, "MINIO_ACCESS_KEY")),
        _ => {}
    }
    Ok(Toggle::Enabled {
        policy: vars.parse("STORAGE_POLICY", StartupPolicy::default())?,
        params: StorageSettings {
            endpoint,
            bucket: vars.string("MINIO_BUCKET").unwrap_or_else(|| "default".to_string()),
            region: vars.string("MINIO_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key,
            secret_key,
        },
    })
}

fn missing(capability: Capability, key: &str) -> ConfigError {
    ConfigError::Missing {
        capability: capability.to_string(),
        key: key.to_string(),
    }
}

/// Typed accessors over a variable lookup. Empty values count as unset.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, capability: Capability, key: &str) -> Result<String, ConfigError> {
        self.string(key).ok_or_else(|| missing(capability, key))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: "could not be parsed".to_string(),
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_matches_defaults() {
        assert_eq!(load(&[]).unwrap(), AppConfig::default());
    }

    #[test]
    fn server_settings_are_parsed() {
        let config = load(&[
            ("PORT", "8080"),
            ("APP_ENV", "production"),
            ("COMPONENTS_DIR", "/srv/components"),
            ("SLOW_REQUEST_MS", "250"),
            ("RATE_LIMIT_MAX", "5"),
            ("RATE_LIMIT_WINDOW_SECS", "2"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.mode.is_production());
        assert_eq!(config.components_dir, PathBuf::from("/srv/components"));
        assert_eq!(config.slow_request, Duration::from_millis(250));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(2));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = load(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "PORT"));
    }

    #[test]
    fn enabled_database_requires_url() {
        let err = load(&[("ENABLE_DATABASE", "true")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                capability: "database".to_string(),
                key: "DATABASE_URL".to_string(),
            }
        );
    }

    #[test]
    fn database_toggle_reads_policy_and_params() {
        let config = load(&[
            ("ENABLE_DATABASE", "true"),
            ("DATABASE_URL", "postgres://localhost/app"),
            ("DATABASE_POLICY", "fatal"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
        ])
        .unwrap();
        match config.services.database {
            Toggle::Enabled { policy, params } => {
                assert_eq!(policy, StartupPolicy::Fatal);
                assert_eq!(params.max_connections, 4);
                assert!(!params.migrate);
            }
            Toggle::Disabled => panic!("database should be enabled"),
        }
    }

    #[test]
    fn cache_url_is_built_from_host_parts() {
        let config = load(&[
            ("ENABLE_CACHE", "true"),
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "s3cret"),
        ])
        .unwrap();
        match config.services.cache {
            Toggle::Enabled { params, policy } => {
                assert_eq!(params.url, "redis://:s3cret@cache.internal:6380");
                assert_eq!(policy, StartupPolicy::Degrade);
            }
            Toggle::Disabled => panic!("cache should be enabled"),
        }
    }

    #[test]
    fn storage_endpoint_is_built_from_minio_vars() {
        let config = load(&[
            ("ENABLE_FILE_SERVICE", "yes"),
            ("MINIO_ENDPOINT", "minio"),
            ("MINIO_USE_SSL", "true"),
            ("MINIO_BUCKET", "uploads"),
        ])
        .unwrap();
        match config.services.storage {
            Toggle::Enabled { params, .. } => {
                assert_eq!(params.endpoint, "https://minio:9000");
                assert_eq!(params.bucket, "uploads");
                assert_eq!(params.region, "us-east-1");
                assert_eq!(params.access_key, None);
            }
            Toggle::Disabled => panic!("storage should be enabled"),
        }
    }

    #[test]
    fn storage_keys_come_in_pairs() {
        let base = [("ENABLE_FILE_SERVICE", "true"), ("STORAGE_ENDPOINT", "http://minio:9000")];

        let err = load(&[base[0], base[1], ("MINIO_ACCESS_KEY", "ak")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                capability: "storage".to_string(),
                key: "MINIO_SECRET_KEY".to_string(),
            }
        );
        let err = load(&[base[0], base[1], ("MINIO_SECRET_KEY", "sk")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key, .. } if key == "MINIO_ACCESS_KEY"));

        let config = load(&[
            base[0],
            base[1],
            ("MINIO_ACCESS_KEY", "ak"),
            ("MINIO_SECRET_KEY", "sk"),
            ("MINIO_REGION", "eu-west-1"),
        ])
        .unwrap();
        match config.services.storage {
            Toggle::Enabled { params, .. } => {
                assert_eq!(params.region, "eu-west-1");
                assert_eq!(params.access_key.as_deref(), Some("ak"));
                assert_eq!(params.secret_key.as_deref(), Some("sk"));
            }
            Toggle::Disabled => panic!("storage should be enabled"),
        }
    }

    #[test]
    fn disabled_capability_ignores_missing_params() {
        let config = load(&[("ENABLE_CACHE", "false")]).unwrap();
        assert!(!config.services.is_enabled(Capability::Cache));
    }

    #[test]
    fn zero_max_attempts_means_unbounded() {
        let config = load(&[("SERVICE_RECONNECT_MAX_ATTEMPTS", "0")]).unwrap();
        assert_eq!(config.services.reconnect.max_attempts, None);
    }

    #[test]
    fn bad_flag_is_rejected() {
        assert!(load(&[("ENABLE_CACHE", "maybe")]).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let settings = StorageSettings {
            endpoint: "http://minio:9000".to_string(),
            bucket: "b".to_string(),
            region: "us-east-1".to_string(),
            access_key: Some("ak".to_string()),
            secret_key: Some("very-secret".to_string()),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("very-secret"));

        let db = DatabaseSettings {
            url: "postgres://user:pw@host/db".to_string(),
            max_connections: 1,
            migrate: false,
        };
        assert!(!format!("{db:?}").contains("pw@"));
    }

    proptest::proptest! {
        #[test]
        fn any_port_is_accepted(port in 1u16..=u16::MAX) {
            let config = load(&[("PORT", &port.to_string())]).unwrap();
            proptest::prop_assert_eq!(config.port, port);
        }
    }
}
