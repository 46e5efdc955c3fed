//! Engine configuration: a small TOML schema plus env-var overrides
//!
//! The engine has two knobs worth configuring from outside: how many page
//! frames the buffer pool gets and whether the adaptive hash index starts
//! enabled. A config can come from a TOML file (pointed at by
//! `LEAFHASH_CONFIG`), from `LEAFHASH__engine__*` environment variables,
//! or both, with the environment winning.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// What can go wrong while assembling an [`EngineConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid TOML for this schema
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// A setting was present but its value does not parse or is out of
    /// range
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Which setting was rejected
        key: String,
        /// The offending text, verbatim
        value: String,
    },
}

impl ConfigError {
    fn bad(key: &str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    engine: Option<EngineSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EngineSection {
    buffer_pool_blocks: Option<usize>,
    adaptive_hash_enabled: Option<bool>,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Buffer pool capacity in page frames
    pub buffer_pool_blocks: usize,
    /// Whether the adaptive hash index starts enabled
    pub adaptive_hash_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_blocks: 256,
            adaptive_hash_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Read a config from a TOML file, filling gaps with defaults
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&contents)?;
        Self::from_raw(raw)
    }

    /// Build a config from the environment: the file named by
    /// `LEAFHASH_CONFIG` first (defaults if unset), then any
    /// `LEAFHASH__engine__*` overrides on top
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("LEAFHASH_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(engine) = raw.engine {
            if let Some(blocks) = engine.buffer_pool_blocks {
                config.buffer_pool_blocks = blocks;
            }
            if let Some(enabled) = engine.adaptive_hash_enabled {
                config.adaptive_hash_enabled = enabled;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Fold `LEAFHASH__section__field` environment variables into this
    /// config. Keys outside the known schema are left for whatever other
    /// tooling shares the prefix.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix("LEAFHASH__") else {
                continue;
            };
            let value = value.trim();
            match path.to_ascii_lowercase().as_str() {
                "engine__buffer_pool_blocks" => {
                    self.buffer_pool_blocks =
                        value.parse().map_err(|_| ConfigError::bad(&key, value))?;
                }
                "engine__adaptive_hash_enabled" => {
                    self.adaptive_hash_enabled =
                        value.parse().map_err(|_| ConfigError::bad(&key, value))?;
                }
                _ => {}
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_pool_blocks == 0 {
            return Err(ConfigError::bad("engine.buffer_pool_blocks", "0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_pool_blocks, 256);
        assert!(config.adaptive_hash_enabled);
    }

    #[test]
    fn test_parse_toml() {
        let raw: RawConfig = toml::from_str(
            r#"
            [engine]
            buffer_pool_blocks = 64
            adaptive_hash_enabled = false
            "#,
        )
        .unwrap();
        let config = EngineConfig::from_raw(raw).unwrap();
        assert_eq!(config.buffer_pool_blocks, 64);
        assert!(!config.adaptive_hash_enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw: RawConfig = toml::from_str("[engine]\nbuffer_pool_blocks = 8\n").unwrap();
        let config = EngineConfig::from_raw(raw).unwrap();
        assert_eq!(config.buffer_pool_blocks, 8);
        assert!(config.adaptive_hash_enabled);
    }

    #[test]
    fn test_zero_pool_rejected() {
        let raw: RawConfig = toml::from_str("[engine]\nbuffer_pool_blocks = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::from_raw(raw),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_value_error_names_the_setting() {
        let err = ConfigError::bad("LEAFHASH__engine__buffer_pool_blocks", "abc");
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert!(key.contains("buffer_pool_blocks"));
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
