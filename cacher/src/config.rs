//! This module provides the cacher configuration.

use std::num::NonZeroU8;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const MAX_CACHE_DEPTH: u8 = 5;

const DEFAULT_STORAGE_DIR: &str = "assets";
const DEFAULT_SIZE_LIMIT: usize = 6 * 1_024 * 1_024;
const DEFAULT_POOL_SIZE: NonZeroU8 = match NonZeroU8::new(32) {
    Some(size) => size,
    None => unreachable!(),
};
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_OVERFLOW_CAPACITY: usize = 1_024;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(6);
const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_DEDUP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_ERROR_CAPACITY: usize = 1_024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable `{0}`")]
    Missing(&'static str),
    #[error("invalid value `{value}` for `{name}`: {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
    #[error("invalid request header `{0}`")]
    InvalidHeader(String),
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Cacher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public origin mirrored assets are served from, rewritten stylesheets point to it.
    pub assets_origin: Url,
    /// Root directory of the filesystem storage.
    pub storage_dir: PathBuf,
    /// Maximum size in bytes of a fetched asset.
    pub size_limit: usize,
    /// Extra headers sent with every fetch.
    pub request_headers: Vec<(String, String)>,
    /// Number of workers.
    pub pool_size: NonZeroU8,
    /// Number of tasks waiting for a worker before submissions block.
    pub queue_capacity: usize,
    /// Number of child tasks waiting for room in the full queue before further ones are dropped.
    pub overflow_capacity: usize,
    pub fetch_timeout: Duration,
    /// Recursion budget of page assets, ie. how deep stylesheet references are followed.
    pub max_depth: u8,
    /// Age below which a stored asset is not fetched again.
    pub freshness_window: Duration,
    /// Age after which a deduplication entry is purged by maintenance.
    pub dedup_timeout: Duration,
    /// Number of error reports buffered for the consumer before the oldest are dropped.
    pub error_capacity: usize,
}

impl Config {
    /// Create a configuration with default values.
    pub fn new(assets_origin: Url) -> Self {
        Self {
            assets_origin,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            size_limit: DEFAULT_SIZE_LIMIT,
            request_headers: Vec::new(),
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_capacity: DEFAULT_OVERFLOW_CAPACITY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_depth: MAX_CACHE_DEPTH,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            dedup_timeout: DEFAULT_DEDUP_TIMEOUT,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }

    /// Load the configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ASSETS_ORIGIN` | required |
    /// | `ASSETS_STORAGE_DIR` | `assets` |
    /// | `ASSETS_SIZE_LIMIT` | 6 MiB |
    /// | `ASSETS_REQUEST_HEADERS` | none, `name:value` pairs separated by `,` |
    /// | `ASSETS_POOL_SIZE` | 32 |
    /// | `ASSETS_MAX_DEPTH` | 5 |
    /// | `ASSETS_FRESHNESS_SECS` | 86400 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the configuration from any variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        const ORIGIN: &str = "ASSETS_ORIGIN";

        let origin = lookup(ORIGIN).ok_or(ConfigError::Missing(ORIGIN))?;
        let origin = Url::parse(&origin).map_err(|err| invalid(ORIGIN, &origin, err))?;

        let mut config = Self::new(origin);

        if let Some(dir) = lookup("ASSETS_STORAGE_DIR") {
            config.storage_dir = dir.into();
        }
        if let Some(limit) = parse(&lookup, "ASSETS_SIZE_LIMIT")? {
            config.size_limit = limit;
        }
        if let Some(headers) = lookup("ASSETS_REQUEST_HEADERS") {
            config.request_headers = parse_headers(&headers)?;
        }
        if let Some(size) = parse(&lookup, "ASSETS_POOL_SIZE")? {
            config.pool_size = size;
        }
        if let Some(depth) = parse(&lookup, "ASSETS_MAX_DEPTH")? {
            config.max_depth = depth;
        }
        if let Some(secs) = parse(&lookup, "ASSETS_FRESHNESS_SECS")? {
            config.freshness_window = Duration::from_secs(secs);
        }

        Ok(config)
    }

    #[inline]
    pub fn with_storage_dir(self, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..self
        }
    }

    #[inline]
    pub fn with_size_limit(self, size_limit: usize) -> Self {
        Self { size_limit, ..self }
    }

    #[inline]
    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    #[inline]
    pub fn with_pool_size(self, pool_size: NonZeroU8) -> Self {
        Self { pool_size, ..self }
    }

    #[inline]
    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self { queue_capacity, ..self }
    }

    #[inline]
    pub fn with_overflow_capacity(self, overflow_capacity: usize) -> Self {
        Self { overflow_capacity, ..self }
    }

    #[inline]
    pub fn with_fetch_timeout(self, fetch_timeout: Duration) -> Self {
        Self { fetch_timeout, ..self }
    }

    #[inline]
    pub fn with_max_depth(self, max_depth: u8) -> Self {
        Self { max_depth, ..self }
    }

    #[inline]
    pub fn with_freshness_window(self, freshness_window: Duration) -> Self {
        Self { freshness_window, ..self }
    }

    #[inline]
    pub fn with_dedup_timeout(self, dedup_timeout: Duration) -> Self {
        Self { dedup_timeout, ..self }
    }

    #[inline]
    pub fn with_error_capacity(self, error_capacity: usize) -> Self {
        Self { error_capacity, ..self }
    }
}

fn invalid(name: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

fn parse<T>(lookup: impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: ToString,
{
    lookup(name)
        .map(|value| value.trim().parse().map_err(|err| invalid(name, &value, err)))
        .transpose()
}

/// Parse `name:value` pairs separated by `,`.
fn parse_headers(headers: &str) -> Result<Vec<(String, String)>, ConfigError> {
    headers
        .split(',')
        .map(str::trim)
        .filter(|header| !header.is_empty())
        .map(|header| match header.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_owned(), value.trim().to_owned())),
            _ => Err(ConfigError::InvalidHeader(header.to_owned())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = Config::from_lookup(lookup(&[("ASSETS_ORIGIN", "https://assets.example")])).unwrap();

        assert_eq!(config.assets_origin.as_str(), "https://assets.example/");
        assert_eq!(config.storage_dir, PathBuf::from("assets"));
        assert_eq!(config.size_limit, DEFAULT_SIZE_LIMIT);
        assert!(config.request_headers.is_empty());
        assert_eq!(config.pool_size.get(), 32);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.overflow_capacity, 1_024);
        assert_eq!(config.fetch_timeout, Duration::from_secs(6));
        assert_eq!(config.max_depth, MAX_CACHE_DEPTH);
        assert_eq!(config.freshness_window, Duration::from_secs(86_400));
        assert!(config.dedup_timeout < config.freshness_window);
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("ASSETS_ORIGIN", "https://assets.example/mirror/"),
            ("ASSETS_STORAGE_DIR", "/var/lib/assets"),
            ("ASSETS_SIZE_LIMIT", " 1024 "),
            ("ASSETS_REQUEST_HEADERS", "X-Token: abc, Accept-Language:fr,"),
            ("ASSETS_POOL_SIZE", "4"),
            ("ASSETS_MAX_DEPTH", "2"),
            ("ASSETS_FRESHNESS_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/assets"));
        assert_eq!(config.size_limit, 1024);
        assert_eq!(
            config.request_headers,
            [("X-Token".to_owned(), "abc".to_owned()), ("Accept-Language".to_owned(), "fr".to_owned())]
        );
        assert_eq!(config.pool_size.get(), 4);
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.freshness_window, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(matches!(Config::from_lookup(lookup(&[])), Err(ConfigError::Missing("ASSETS_ORIGIN"))));

        assert!(matches!(
            Config::from_lookup(lookup(&[("ASSETS_ORIGIN", "not a url")])),
            Err(ConfigError::Invalid { name: "ASSETS_ORIGIN", .. })
        ));

        assert!(matches!(
            Config::from_lookup(lookup(&[("ASSETS_ORIGIN", "https://a"), ("ASSETS_POOL_SIZE", "0")])),
            Err(ConfigError::Invalid { name: "ASSETS_POOL_SIZE", .. })
        ));

        assert!(matches!(
            Config::from_lookup(lookup(&[("ASSETS_ORIGIN", "https://a"), ("ASSETS_REQUEST_HEADERS", "no-colon")])),
            Err(ConfigError::InvalidHeader(header)) if header == "no-colon"
        ));
    }
}
