//! Persistent CLI defaults, stored as JSON.

use std::path::{Path, PathBuf};

use llama_core::LogLevel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default GPU layers (-1 = all).
    #[serde(default = "default_gpu_layers")]
    pub default_n_gpu_layers: i32,
    /// Default context size (0 = model's training size).
    #[serde(default = "default_ctx_size")]
    pub default_ctx_size: u32,
    /// Verbosity of llama.cpp's own diagnostics.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

fn default_gpu_layers() -> i32 {
    -1
}
fn default_ctx_size() -> u32 {
    4096
}
fn default_log_level() -> LogLevel {
    LogLevel::ErrorsOnly
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_n_gpu_layers: default_gpu_layers(),
            default_ctx_size: default_ctx_size(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Platform config directory: `~/.config/llama-bind/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-bind")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Update one field from its `config set` spelling.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "n_gpu_layers" | "gpu_layers" => self.default_n_gpu_layers = value.parse()?,
            "ctx_size" | "context_size" => self.default_ctx_size = value.parse()?,
            "log_level" => self.log_level = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {key} (expected n_gpu_layers, ctx_size or log_level)"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = AppConfig::default();
        cfg.set("ctx_size", "2048").unwrap();
        cfg.set("log_level", "silent").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.default_ctx_size, 2048);
        assert_eq!(loaded.log_level, LogLevel::Silent);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_n_gpu_layers":0}"#).unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.default_n_gpu_layers, 0);
        assert_eq!(cfg.default_ctx_size, 4096);
        assert_eq!(cfg.log_level, LogLevel::ErrorsOnly);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let mut cfg = AppConfig::default();
        assert!(cfg.set("port", "8080").is_err());
        assert!(cfg.set("ctx_size", "lots").is_err());
        assert!(cfg.set("log_level", "chatty").is_err());
        assert_eq!(cfg, AppConfig::default());
    }
}
