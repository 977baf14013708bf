mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = ["./framescope.toml", "~/.config/framescope/config.toml"];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.demux.chunk_size == 0 {
        anyhow::bail!("demux.chunk_size cannot be 0");
    }

    // Anything smaller cannot hold a box header.
    if config.demux.max_box_size < 8 {
        anyhow::bail!(
            "demux.max_box_size must be at least 8 bytes, got {}",
            config.demux.max_box_size
        );
    }

    if let Some(filter) = &config.logging.filter {
        if filter.trim().is_empty() {
            tracing::warn!("logging.filter is empty, falling back to defaults");
        }
    }

    Ok(())
}
