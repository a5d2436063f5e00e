//! # numadp Configuration System
//!
//! Layered configuration for the NUMA pool system and its operator tooling.
//!
//! ## Features
//! - **Layered sources**: defaults, YAML files, then `NUMADP_*` environment variables
//! - **Validation**: every section is checked before it reaches the allocator
//! - **Core conversion**: [`NumaDpConfig::pool_system_config`] yields the allocator's own config

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use numadp_core::PoolSystemConfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

mod blocks;
mod error;
mod pool;
mod telemetry;
mod validation;

pub use blocks::{BlocksConfig, WorkersConfig};
pub use error::ConfigError;
pub use pool::PoolConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/numadp.yaml";
const ENV_PREFIX: &str = "NUMADP_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct NumaDpConfig {
    /// Pool sizing and startup behaviour.
    #[validate(nested)]
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-node carve-out counts.
    #[validate(nested)]
    #[serde(default)]
    pub blocks: BlocksConfig,

    #[validate(nested)]
    #[serde(default)]
    pub workers: WorkersConfig,

    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl NumaDpConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/numadp.yaml`, skipped if missing
    /// 3. `config/<NUMADP_ENV>.yaml`, environment-specific overrides
    /// 4. `NUMADP_*` environment variables, `__` separating sections
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(NumaDpConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        let env = std::env::var("NUMADP_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file on top of the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment =
            Figment::from(Serialized::defaults(NumaDpConfig::default())).merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }

    /// Startup parameters for `numadp_core::PoolSystem::init`.
    pub fn pool_system_config(&self) -> PoolSystemConfig {
        self.pool.to_pool_system_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numadp_core::PoolSizing;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn default_config_validates() {
        let config = NumaDpConfig::default();
        config.validate().expect("Default config should validate");
        assert_eq!(config.pool.fraction, 0.25);
        assert_eq!(config.blocks.small, 1024);
        assert_eq!(config.blocks.medium, 512);
        assert_eq!(config.blocks.large, 0);
        assert!(config.workers.per_node >= 1);
    }

    #[test]
    fn pool_system_config_prefers_explicit_size() {
        let mut config = NumaDpConfig::default();
        assert_eq!(config.pool_system_config().sizing, PoolSizing::Fraction(0.25));

        config.pool.per_node_bytes = Some(1 << 20);
        config.pool.trace_allocations = true;
        let pool = config.pool_system_config();
        assert_eq!(pool.sizing, PoolSizing::PerNode(1 << 20));
        assert!(pool.trace_allocations);
        assert!(pool.prefault);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "partial.yaml",
            "pool:\n  per_node_bytes: 2097152\n  strict_affinity: true\nblocks:\n  small: 64\n",
        );
        let config = NumaDpConfig::load_from_path(&path).unwrap();
        assert_eq!(config.pool.per_node_bytes, Some(2 * 1024 * 1024));
        assert!(config.pool.strict_affinity);
        assert_eq!(config.blocks.small, 64);
        assert_eq!(config.blocks.medium, 512);
        assert_eq!(config.telemetry.log_filter, "info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "bad-fraction.yaml", "pool:\n  fraction: 0.99\n");
        assert!(matches!(
            NumaDpConfig::load_from_path(&path),
            Err(ConfigError::Validation(_))
        ));

        let path = write_config(&dir, "bad-size.yaml", "pool:\n  per_node_bytes: 5000\n");
        assert!(matches!(
            NumaDpConfig::load_from_path(&path),
            Err(ConfigError::Validation(_))
        ));

        let path = write_config(&dir, "bad-filter.yaml", "telemetry:\n  log_filter: loud\n");
        let err = NumaDpConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("invalid_log_filter"));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            NumaDpConfig::load_from_path("/nonexistent/numadp.yaml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn environment_override() {
        std::env::set_var("NUMADP_WORKERS__PER_NODE", "3");
        let config = NumaDpConfig::load().unwrap();
        std::env::remove_var("NUMADP_WORKERS__PER_NODE");
        assert_eq!(config.workers.per_node, 3);
    }
}
