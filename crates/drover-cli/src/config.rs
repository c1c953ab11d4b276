//! Config path resolution: CLI flag > `CONFIG_PATH` env var > XDG default.

use std::path::{Path, PathBuf};

/// Default config directory: `$XDG_CONFIG_HOME/drover` or
/// `~/.config/drover`. XDG layout on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Resolve the config file path.
pub fn resolve_config_path(cli_flag: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("config.toml")
}
