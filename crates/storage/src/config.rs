//! Configuration of the storage layer, read from TOML and the environment.
//!
//! ```toml
//! [block-store]
//! max-blocks = 128
//! ```
//!
//! Every key is optional.
//! `TUPLESTORE_MAX_BLOCKS` overrides `block-store.max-blocks`.

use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding [`BlockStoreConfig::max_blocks`].
pub const MAX_BLOCKS_ENV: &str = "TUPLESTORE_MAX_BLOCKS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse storage config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Environment variable `{var}` has invalid value `{value}`")]
    InvalidEnv { var: &'static str, value: String },
    #[error("`block-store.max-blocks` must be at least 1")]
    ZeroMaxBlocks,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    pub block_store: BlockStoreConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BlockStoreConfig {
    /// The maximum number of blocks handed out at once.
    pub max_blocks: usize,
}

impl BlockStoreConfig {
    pub const DEFAULT_MAX_BLOCKS: usize = 128;
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            max_blocks: Self::DEFAULT_MAX_BLOCKS,
        }
    }
}

impl StorageConfig {
    /// Parses a config from TOML, filling in defaults for missing keys.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(MAX_BLOCKS_ENV) {
            self.block_store.max_blocks = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: MAX_BLOCKS_ENV,
                value: value.clone(),
            })?;
            log::debug!("{MAX_BLOCKS_ENV} overrides max-blocks to {}", self.block_store.max_blocks);
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.block_store.max_blocks == 0 {
            return Err(ConfigError::ZeroMaxBlocks);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |var: &str| (var == MAX_BLOCKS_ENV).then(|| value.to_owned())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = StorageConfig::from_toml_str("").unwrap();
        assert_eq!(config, StorageConfig::default());
        assert_eq!(config.block_store.max_blocks, 128);
    }

    #[test]
    fn parses_kebab_case_keys() {
        let config = StorageConfig::from_toml_str("[block-store]\nmax-blocks = 7\n").unwrap();
        assert_eq!(config.block_store.max_blocks, 7);
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(matches!(
            StorageConfig::from_toml_str("[block-store]\nmax-blocks = \"many\"\n"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            StorageConfig::from_toml_str("[block-store]\nmax-blocks = 0\n"),
            Err(ConfigError::ZeroMaxBlocks)
        ));
    }

    #[test]
    fn env_overrides_file() {
        let config = StorageConfig::from_toml_str("[block-store]\nmax-blocks = 7\n").unwrap();
        let config = config.with_overrides_from(env(" 32 ")).unwrap();
        assert_eq!(config.block_store.max_blocks, 32);

        let unset = StorageConfig::default().with_overrides_from(|_| None).unwrap();
        assert_eq!(unset, StorageConfig::default());
    }

    #[test]
    fn env_overrides_are_validated() {
        assert!(matches!(
            StorageConfig::default().with_overrides_from(env("lots")),
            Err(ConfigError::InvalidEnv { var: MAX_BLOCKS_ENV, value }) if value == "lots"
        ));
        assert!(matches!(
            StorageConfig::default().with_overrides_from(env("0")),
            Err(ConfigError::ZeroMaxBlocks)
        ));
    }
}
