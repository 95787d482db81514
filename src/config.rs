use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Worker slots of the cache's internal scheduler.
pub const DEFAULT_CACHE_CONCURRENCY: usize = 2;

/// Parallelism used by batch helpers when the caller does not pick one.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

/// Sub-directory created under a shared group directory.
pub const CACHE_SUBDIR: &str = "image-cache";

/// Character substituted for path separators when deriving a cache key.
pub const KEY_SEPARATOR_SUBSTITUTE: char = '_';

/// Deployment environment the cache is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Environment {
    Test,
    Staging,
    Staging2,
    #[default]
    Production,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Test => "Test",
            Environment::Staging => "Staging",
            Environment::Staging2 => "Staging2",
            Environment::Production => "Production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "staging" => Ok(Environment::Staging),
            "staging2" => Ok(Environment::Staging2),
            "production" => Ok(Environment::Production),
            other => Err(anyhow!("unknown environment: {}", other)),
        }
    }
}

/// Read-only key lookup supplied by the host application.
///
/// Keys are dotted paths such as `cache.dir`.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory configuration, mostly useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    values: HashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Environment-variable lookup: `cache.dir` with prefix `MA` reads `MA_CACHE_DIR`.
#[derive(Debug, Clone)]
pub struct EnvConfigSource {
    prefix: String,
}

impl EnvConfigSource {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        let key = key.replace('.', "_").to_ascii_uppercase();
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{}", self.prefix.to_ascii_uppercase(), key)
        }
    }
}

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

/// Top-level configuration for the resource cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Explicit durable store directory. Empty means "resolve".
    pub cache_dir: String,
    /// Shared container directory; the store lives in its `image-cache` child.
    pub group_dir: Option<String>,
    /// Worker slots of the internal scheduler.
    pub max_concurrency: usize,
    /// Share one in-flight fetch between concurrent loads of the same key.
    pub coalesce_requests: bool,
    pub environment: Environment,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            group_dir: None,
            max_concurrency: DEFAULT_CACHE_CONCURRENCY,
            coalesce_requests: false,
            environment: Environment::default(),
        }
    }
}

impl CacheConfig {
    /// Build a configuration from a host lookup. Unparsable values keep their defaults.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let mut config = Self::default();

        if let Some(dir) = source.get("cache.dir") {
            config.cache_dir = dir;
        }
        if let Some(dir) = source.get("cache.group_dir") {
            if !dir.trim().is_empty() {
                config.group_dir = Some(dir);
            }
        }
        if let Some(raw) = source.get("cache.max_concurrency") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n >= 1 => config.max_concurrency = n,
                _ => warn!("ignoring invalid cache.max_concurrency={}", raw),
            }
        }
        if let Some(raw) = source.get("cache.coalesce") {
            match raw.trim().parse::<bool>() {
                Ok(flag) => config.coalesce_requests = flag,
                Err(_) => warn!("ignoring invalid cache.coalesce={}", raw),
            }
        }
        if let Some(raw) = source.get("environment") {
            match raw.parse::<Environment>() {
                Ok(env) => config.environment = env,
                Err(e) => warn!("{}", e),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be >= 1"));
        }
        Ok(())
    }

    /// Pick the durable store directory: explicit dir, then the shared group
    /// container, then the process temporary directory.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        if !self.cache_dir.trim().is_empty() {
            return PathBuf::from(&self.cache_dir);
        }

        if let Some(group) = &self.group_dir {
            let dir = PathBuf::from(group).join(CACHE_SUBDIR);
            match fs::create_dir_all(&dir) {
                Ok(()) => return dir,
                Err(e) => warn!(
                    "group cache dir {} unavailable, using temp dir: {}",
                    dir.display(),
                    e
                ),
            }
        }

        let dir = std::env::temp_dir();
        debug!("using temp dir {} for cache", dir.display());
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_source_reads_known_keys() {
        let source = MapConfigSource::new()
            .with("cache.dir", "/var/cache/ma")
            .with("cache.max_concurrency", "5")
            .with("cache.coalesce", "true")
            .with("environment", "staging2");

        let config = CacheConfig::from_source(&source);
        assert_eq!(config.cache_dir, "/var/cache/ma");
        assert_eq!(config.max_concurrency, 5);
        assert!(config.coalesce_requests);
        assert_eq!(config.environment, Environment::Staging2);
    }

    #[test]
    fn test_deserialize_fills_missing_fields_with_defaults() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"cache_dir": "/data/images", "coalesce_requests": true, "environment": "Staging"}"#,
        )
        .unwrap();
        assert_eq!(config.cache_dir, "/data/images");
        assert!(config.coalesce_requests);
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.max_concurrency, DEFAULT_CACHE_CONCURRENCY);
        assert!(config.group_dir.is_none());

        let empty: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.environment, Environment::Production);
        assert!(!empty.coalesce_requests);
    }

    #[test]
    fn test_from_source_keeps_defaults_on_garbage() {
        let source = MapConfigSource::new()
            .with("cache.max_concurrency", "0")
            .with("cache.coalesce", "maybe")
            .with("environment", "moon");

        let config = CacheConfig::from_source(&source);
        assert_eq!(config.max_concurrency, DEFAULT_CACHE_CONCURRENCY);
        assert!(!config.coalesce_requests);
        assert_eq!(config.environment, Environment::Production);
    }

    #[test]
    fn test_resolve_prefers_group_dir() {
        let group = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            group_dir: Some(group.path().to_string_lossy().into_owned()),
            ..CacheConfig::default()
        };

        let dir = config.resolve_cache_dir();
        assert_eq!(dir, group.path().join(CACHE_SUBDIR));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_resolve_falls_back_to_temp_dir() {
        let config = CacheConfig::default();
        assert_eq!(config.resolve_cache_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_env_source_var_name() {
        let source = EnvConfigSource::new("ma");
        assert_eq!(source.var_name("cache.group_dir"), "MA_CACHE_GROUP_DIR");
    }
}
