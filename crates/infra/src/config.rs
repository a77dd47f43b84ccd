//! Environment-driven configuration.
//!
//! Every setting has a default matching a single-host development setup, so
//! an empty environment yields a runnable config with the two stock vendors.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use vendorgate_core::{DomainError, VendorConfig};

use crate::jobs::BackoffPolicy;
use crate::rate_limit::DEFAULT_KEY_PREFIX;
use crate::vendor::VendorRegistry;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_SYNC_VENDOR_URL: &str = "http://localhost:8001";
pub const DEFAULT_ASYNC_VENDOR_URL: &str = "http://localhost:8002";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("failed to load vendors from {path}: {reason}")]
    VendorsFile { path: PathBuf, reason: String },

    #[error("invalid vendor configuration: {0}")]
    Vendor(#[from] DomainError),
}

/// Dispatch retry and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub use_persistent_stores: bool,
    pub vendors: Vec<VendorConfig>,
    pub dispatch: DispatchSettings,
    pub rate_limit_window: Duration,
    /// Namespace for limiter keys when `redis_url` is set
    pub rate_limit_key_prefix: String,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr: SocketAddr = parse_or(&get, "BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let use_persistent_stores = parse_bool(&get, "USE_PERSISTENT_STORES")?;
        let database_url = get("DATABASE_URL");
        let redis_url = get("REDIS_URL");

        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let timeout = Duration::from_secs(parse_or(&get, "VENDOR_TIMEOUT_SECS", Some(30u64))?);
        let vendors = match get("VENDORS_FILE") {
            Some(path) => load_vendors_file(PathBuf::from(path))?,
            None => vec![
                VendorConfig::sync(
                    "sync",
                    get("VENDOR_SYNC_URL").unwrap_or_else(|| DEFAULT_SYNC_VENDOR_URL.to_string()),
                    parse_or(&get, "SYNC_VENDOR_RATE_LIMIT", Some(30u32))?,
                )
                .with_timeout(timeout),
                VendorConfig::asynchronous(
                    "async",
                    get("VENDOR_ASYNC_URL").unwrap_or_else(|| DEFAULT_ASYNC_VENDOR_URL.to_string()),
                    parse_or(&get, "ASYNC_VENDOR_RATE_LIMIT", Some(20u32))?,
                )
                .with_timeout(timeout),
            ],
        };
        for vendor in &vendors {
            vendor.validate()?;
        }

        let dispatch = DispatchSettings {
            base_delay: Duration::from_millis(parse_or(&get, "DISPATCH_BASE_DELAY_MS", Some(500u64))?),
            max_delay: Duration::from_millis(parse_or(&get, "DISPATCH_MAX_DELAY_MS", Some(60_000u64))?),
            max_attempts: positive(&get, "DISPATCH_MAX_ATTEMPTS", 10u32)?,
            workers: positive(&get, "DISPATCH_WORKERS", 4usize)?,
        };

        let window_secs: u64 = positive(&get, "RATE_LIMIT_WINDOW_SECS", 60u64)?;

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            use_persistent_stores,
            vendors,
            dispatch,
            rate_limit_window: Duration::from_secs(window_secs),
            rate_limit_key_prefix: get("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.dispatch.base_delay,
            self.dispatch.max_delay,
            self.dispatch.max_attempts,
        )
    }

    pub fn registry(&self) -> Result<VendorRegistry, ConfigError> {
        Ok(VendorRegistry::from_configs(self.vendors.iter().cloned())?)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database_url: None,
            redis_url: None,
            use_persistent_stores: false,
            vendors: vec![
                VendorConfig::sync("sync", DEFAULT_SYNC_VENDOR_URL, 30),
                VendorConfig::asynchronous("async", DEFAULT_ASYNC_VENDOR_URL, 20),
            ],
            dispatch: DispatchSettings::default(),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => default.ok_or(ConfigError::Missing(key)),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, Some(default))?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            value: v,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn load_vendors_file(path: PathBuf) -> Result<Vec<VendorConfig>, ConfigError> {
    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::VendorsFile {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let vendors: Vec<VendorConfig> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::VendorsFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    if vendors.is_empty() {
        return Err(ConfigError::VendorsFile {
            path,
            reason: "no vendors defined".to_string(),
        });
    }
    Ok(vendors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vendorgate_core::{VendorId, VendorMode};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.backoff(), BackoffPolicy::default());
        assert_eq!(cfg.registry().unwrap().len(), 2);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("VENDOR_SYNC_URL", "http://sync-vendor:8001"),
            ("ASYNC_VENDOR_RATE_LIMIT", "5"),
            ("VENDOR_TIMEOUT_SECS", "7"),
            ("DISPATCH_MAX_ATTEMPTS", "3"),
            ("DISPATCH_WORKERS", "16"),
            ("RATE_LIMIT_WINDOW_SECS", "10"),
            ("RATE_LIMIT_KEY_PREFIX", "staging:ratelimit"),
        ]))
        .unwrap();

        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.vendors[0].base_url, "http://sync-vendor:8001");
        assert_eq!(cfg.vendors[0].timeout(), Duration::from_secs(7));
        assert_eq!(cfg.vendors[1].rate_limit_per_minute, 5);
        assert_eq!(cfg.dispatch.max_attempts, 3);
        assert_eq!(cfg.dispatch.workers, 16);
        assert_eq!(cfg.rate_limit_window, Duration::from_secs(10));
        assert_eq!(cfg.rate_limit_key_prefix, "staging:ratelimit");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("SYNC_VENDOR_RATE_LIMIT", "lots")])),
            Err(ConfigError::Invalid { key: "SYNC_VENDOR_RATE_LIMIT", .. })
        ));
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("DISPATCH_WORKERS", "0")])),
            Err(ConfigError::Invalid { key: "DISPATCH_WORKERS", .. })
        ));
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("SYNC_VENDOR_RATE_LIMIT", "0")])),
            Err(ConfigError::Vendor(_))
        ));
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn vendors_file_replaces_defaults() {
        let path = std::env::temp_dir().join(format!("vendors-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(
            &path,
            r#"[{"id": "vendorA", "mode": "async", "base_url": "http://a", "path": "/submit", "rate_limit_per_minute": 12}]"#,
        )
        .unwrap();

        let cfg =
            AppConfig::from_lookup(lookup(&[("VENDORS_FILE", path.to_str().unwrap())])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.vendors.len(), 1);
        assert_eq!(cfg.vendors[0].id, VendorId::new("vendorA"));
        assert_eq!(cfg.vendors[0].mode, VendorMode::Async);
    }
}
