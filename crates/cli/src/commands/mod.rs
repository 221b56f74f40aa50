pub mod ask;
pub mod doctor;
pub mod init;
pub mod serve;

use std::path::{Path, PathBuf};

use concierge_config::AppConfig;

/// Where the config file lives: the `--config` path, or the default.
pub fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Load the config file with environment overrides applied.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    AppConfig::load_with_env(&config_path(path))
        .map_err(|e| format!("Failed to load config: {e}").into())
}
