//! Configuration loading and saving utilities.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::schema::Config;
use crate::utils::helpers::get_data_path;

/// Get the default configuration file path (`~/.codescout/config.json`).
pub fn get_config_path() -> PathBuf {
    get_data_path().join("config.json")
}

/// Load configuration from a file, or return a default [`Config`] if the file
/// does not exist or cannot be parsed.
///
/// If `config_path` is `None`, the default path (`~/.codescout/config.json`)
/// is used.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        "Failed to parse config from {}: {}. Using default configuration.",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read config from {}: {}. Using default configuration.",
                    path.display(),
                    e
                );
            }
        }
    }

    Config::default()
}

/// Save configuration to a JSON file.
///
/// If `config_path` is `None`, the default path is used.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> std::io::Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(&path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_default() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(Some(&tmp.path().join("nope.json")));
        assert_eq!(cfg.agent.max_iterations, 20);
    }

    #[test]
    fn test_load_invalid_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let cfg = load_config(Some(&path));
        assert_eq!(cfg.agent.max_iterations, 20);
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let mut cfg = Config::default();
        cfg.agent.max_iterations = 7;
        cfg.provider.model = "test-model".into();
        save_config(&cfg, Some(&path)).unwrap();

        let loaded = load_config(Some(&path));
        assert_eq!(loaded.agent.max_iterations, 7);
        assert_eq!(loaded.provider.model, "test-model");
    }
}
