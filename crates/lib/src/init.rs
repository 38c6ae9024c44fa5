//! Initialize the configuration directory: create ~/.wakechat and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Create the config directory and write a default `config.json` if missing.
/// The default file spells out every setting so it can be edited in place.
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
        std::fs::write(config_path, default_config)
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
    use crate::config::load_config;

    #[test]
    fn writes_loadable_defaults_once() {
        let dir = std::env::temp_dir().join(format!("wakechat-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let created = init_config_dir(&path).unwrap();
        assert_eq!(created, dir);
        let (config, _) = load_config(Some(path.clone())).unwrap();
        assert_eq!(config.context.window_size, 10);

        std::fs::write(&path, r#"{"retry":{"maxRetries":7}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let (config, _) = load_config(Some(path)).unwrap();
        assert_eq!(config.retry.max_retries, 7);
        let _ = std::fs::remove_dir_all(dir);
    }
}
