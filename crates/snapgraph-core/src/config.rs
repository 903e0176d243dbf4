//! Cache configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Environment variables override file values:
//! - `SNAPGRAPH_SNAPSHOT_CACHE_SIZE` overrides `snapshot_cache_size`
//! - `SNAPGRAPH_SHARED_CACHE` overrides `shared_cache`

use std::path::Path;

use serde::Deserialize;

use crate::errors::GraphError;

pub const ENV_SNAPSHOT_CACHE_SIZE: &str = "SNAPGRAPH_SNAPSHOT_CACHE_SIZE";
pub const ENV_SHARED_CACHE: &str = "SNAPGRAPH_SHARED_CACHE";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    /// A value parsed but is out of range, or an override is malformed
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl From<ConfigError> for GraphError {
    fn from(err: ConfigError) -> Self {
        GraphError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum snapshot entries before least-recently-used ones are evicted
    #[serde(default = "default_snapshot_cache_size")]
    pub snapshot_cache_size: usize,

    /// Age after which a snapshot reads as absent; 0 disables expiry
    #[serde(default = "default_snapshot_expiration_secs")]
    pub snapshot_expiration_secs: u64,

    /// Sessions of one runtime share a snapshot store
    #[serde(default = "default_true")]
    pub shared_cache: bool,

    /// Keys per query for disjoint-by-id prefetching
    #[serde(default = "default_max_id_qualifier_size")]
    pub max_id_qualifier_size: usize,

    /// Fetched rows replace cached snapshots of known identities
    #[serde(default = "default_true")]
    pub refresh_on_fetch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_cache_size: default_snapshot_cache_size(),
            snapshot_expiration_secs: default_snapshot_expiration_secs(),
            shared_cache: true,
            max_id_qualifier_size: default_max_id_qualifier_size(),
            refresh_on_fetch: true,
        }
    }
}

impl CacheConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Toml`] if it is not valid TOML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the string is not valid TOML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a set variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override values from an arbitrary key lookup
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a present value does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_SNAPSHOT_CACHE_SIZE) {
            self.snapshot_cache_size =
                val.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: ENV_SNAPSHOT_CACHE_SIZE.to_string(),
                    reason: format!("expected a positive integer, got {:?}", val),
                })?;
        }
        if let Some(val) = lookup(ENV_SHARED_CACHE) {
            self.shared_cache = match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: ENV_SHARED_CACHE.to_string(),
                        reason: format!("expected a boolean, got {:?}", val),
                    })
                }
            };
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero cache size or batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_cache_size == 0 {
            return Err(ConfigError::Invalid {
                key: "snapshot_cache_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_id_qualifier_size == 0 {
            return Err(ConfigError::Invalid {
                key: "max_id_qualifier_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Expiry as a duration, `None` when disabled
    pub fn expiration(&self) -> Option<std::time::Duration> {
        match self.snapshot_expiration_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

const fn default_snapshot_cache_size() -> usize {
    10_000
}

const fn default_snapshot_expiration_secs() -> u64 {
    2 * 60 * 60
}

const fn default_max_id_qualifier_size() -> usize {
    1_000
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let mut config: CacheConfig = toml::from_str("").unwrap();
        config.apply_overrides(no_env).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.snapshot_cache_size, 10_000);
        assert_eq!(config.expiration(), Some(std::time::Duration::from_secs(7200)));
    }

    #[test]
    fn test_partial_document() {
        let config: CacheConfig =
            toml::from_str("snapshot_cache_size = 5\nsnapshot_expiration_secs = 0").unwrap();
        assert_eq!(config.snapshot_cache_size, 5);
        assert_eq!(config.expiration(), None);
        assert!(config.shared_cache);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let result: Result<CacheConfig, _> = toml::from_str("cache_sise = 5");
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = CacheConfig::default();
        config
            .apply_overrides(|key| match key {
                ENV_SNAPSHOT_CACHE_SIZE => Some("42".to_string()),
                ENV_SHARED_CACHE => Some("false".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.snapshot_cache_size, 42);
        assert!(!config.shared_cache);
    }

    #[test]
    fn test_malformed_override_is_rejected() {
        let mut config = CacheConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_SHARED_CACHE).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_cache_size_is_invalid() {
        let config = CacheConfig {
            snapshot_cache_size: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
        let graph_err: GraphError = config.validate().unwrap_err().into();
        assert!(matches!(graph_err, GraphError::InvalidConfig { .. }));
    }
}
