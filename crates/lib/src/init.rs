//! Initialize the configuration directory: create `~/.herald` and a default `config.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Ensure the configuration has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `herald init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and write a pretty-printed default config if none exists.
/// An existing config file is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config + "\n")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_defaults_once() {
        let dir = std::env::temp_dir().join(format!("herald-init-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.json");
        assert!(require_initialized(&path).is_err());

        init_config_dir(&path).unwrap();
        require_initialized(&path).unwrap();
        let (config, used) = crate::config::load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 15252);

        std::fs::write(&path, r#"{"gateway":{"port":1}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let (config, _) = crate::config::load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
