//! Proxy configuration, loaded from TOML with every field defaulted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the listener binds to.
    pub host: String,
    /// Listener port, 0 picks an ephemeral one.
    pub port: u16,
    /// Directory holding one cache file per upstream URL.
    pub cache_dir: PathBuf,
    /// Partial requests starting further than this fraction of the source
    /// length past the cached bytes bypass the cache.
    pub no_cache_barrier: f64,
    pub engine: EngineConfig,
    pub upstream: UpstreamConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_dir: PathBuf::from("video-cache"),
            no_cache_barrier: 0.2,
            engine: EngineConfig::default(),
            upstream: UpstreamConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Knobs of the fetch/read coordination in [`ProxyCache`](crate::ProxyCache).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed fetches tolerated before a waiting read fails.
    pub max_read_source_attempts: usize,
    /// Longest a blocked read waits for a progress signal before re-checking.
    pub read_wait_ms: u64,
    /// Size of the buffer used to stream bodies to clients.
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_read_source_attempts: 1,
            read_wait_ms: 1000,
            buffer_size: 8 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub max_redirects: usize,
    pub connect_timeout_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            max_redirects: 5,
            connect_timeout_ms: 10_000,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string() }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("reading {}: {e}", path.display())))?;
        Config::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text).map_err(|e| ProxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.no_cache_barrier.is_finite() || self.no_cache_barrier < 0.0 {
            return Err(ProxyError::Config(format!(
                "no_cache_barrier must be a non-negative number, got {}",
                self.no_cache_barrier
            )));
        }
        if self.engine.max_read_source_attempts == 0 {
            return Err(ProxyError::Config("engine.max_read_source_attempts must be at least 1".to_string()));
        }
        if self.engine.read_wait_ms == 0 {
            return Err(ProxyError::Config("engine.read_wait_ms must be positive".to_string()));
        }
        if self.engine.buffer_size == 0 {
            return Err(ProxyError::Config("engine.buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(Config::default(), config);
        assert_eq!(0.2, config.no_cache_barrier);
        assert_eq!(1, config.engine.max_read_source_attempts);
        assert_eq!(Duration::from_secs(1), config.engine.read_wait());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            port = 8181
            cache_dir = "/tmp/cache"

            [engine]
            max_read_source_attempts = 3

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(8181, config.port);
        assert_eq!(PathBuf::from("/tmp/cache"), config.cache_dir);
        assert_eq!(3, config.engine.max_read_source_attempts);
        assert_eq!(1000, config.engine.read_wait_ms);
        assert_eq!("debug", config.log.level);
        assert_eq!(5, config.upstream.max_redirects);
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(Config::from_toml("no_cache_barrier = -0.5"), Err(ProxyError::Config(_)));
        assert_matches!(
            Config::from_toml("[engine]\nmax_read_source_attempts = 0"),
            Err(ProxyError::Config(_))
        );
        assert_matches!(Config::from_toml("[engine]\nbuffer_size = 0"), Err(ProxyError::Config(_)));
        assert_matches!(Config::from_toml("port = \"eighty\""), Err(ProxyError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        assert_matches!(Config::load("/definitely/not/here.toml"), Err(ProxyError::Config(_)));
    }
}
