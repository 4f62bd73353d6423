// src/config/mod.rs
mod schema;

use std::path::{Path, PathBuf};
use config::{Config as ConfigLoader, FileFormat};
use tracing::{info, warn};

pub use schema::{Config, ManagerConfig, ResolverConfig, RunnerConfig};

use crate::error::{ScanError, ScanResult};

/// Centralized configuration handling
impl Config {
    /// Load configuration from a file or fall back to built-in defaults
    pub fn load(config_path: Option<&Path>) -> ScanResult<Self> {
        let mut config_builder = ConfigLoader::builder();

        // Default configuration
        config_builder = config_builder.add_source(
            config::File::from_str(
                include_str!("../../config/default.toml"),
                FileFormat::Toml,
            )
        );

        // User-provided configuration
        if let Some(path) = config_path {
            if path.exists() {
                config_builder = config_builder.add_source(config::File::from(path));
                info!("Loading user configuration from: {}", path.display());
            } else {
                warn!("Specified configuration file not found: {}", path.display());
            }
        } else {
            let default_path = Self::get_default_config_path();
            if default_path.exists() {
                config_builder = config_builder.add_source(config::File::from(default_path.as_path()));
                info!("Loading default configuration from: {}", default_path.display());
            }
        }

        // Environment variables
        config_builder = config_builder.add_source(
            config::Environment::with_prefix("RANGESCAN").separator("_")
        );

        let config: Config = match config_builder.build() {
            Ok(c) => match c.try_deserialize() {
                Ok(config) => config,
                Err(e) => return Err(ScanError::ConfigError(format!("Failed to parse configuration: {}", e))),
            },
            Err(e) => return Err(ScanError::ConfigError(format!("Failed to build configuration: {}", e))),
        };

        Ok(config)
    }

    /// Get the default configuration path
    pub fn get_default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rangescan/config.toml")
    }

    /// Initialize a new configuration file
    pub fn init(force: bool) -> ScanResult<PathBuf> {
        let config_path = Self::get_default_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::ConfigError(format!(
                    "Failed to create {}: {}", parent.display(), e
                )))?;
        }

        if config_path.exists() && !force {
            return Err(ScanError::ConfigError(
                format!("Configuration already exists at {}. Use --force to overwrite.", config_path.display())
            ));
        }

        let config = Config::default();
        config.save(&config_path)?;

        Ok(config_path)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ScanResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| ScanError::ConfigError(format!("Failed to serialize configuration: {}", e)))?;

        std::fs::write(path, config_str)?;

        info!("Configuration saved to {}", path.display());

        Ok(())
    }
}
