use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "bwflow.toml";
pub const CONFIG_PATH_ENV: &str = "BWFLOW_CONFIG";
pub const BW_EXECUTABLE_ENV: &str = "BWFLOW_BW_EXECUTABLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Plugin-local settings. The host launcher owns the user-facing settings
/// (see `settings.rs`); this file only carries deployment knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path or bare name of the Bitwarden CLI.
    pub bw_executable: PathBuf,
    /// Hostname `bw serve` binds to and the client connects to.
    pub server_hostname: String,
    pub request_timeout_ms: u64,
    /// How many times `start_bw_server` polls `/status` after spawning.
    pub readiness_attempts: usize,
    pub stop_server_on_exit: bool,
    pub login_help_url: String,
    pub icon_path: String,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bw_executable: PathBuf::from(default_bw_executable()),
            server_hostname: "localhost".to_string(),
            request_timeout_ms: 10_000,
            readiness_attempts: 8,
            stop_server_on_exit: false,
            login_help_url: "https://github.com/Etheirystech/Flow-Launcher-Bitwarden-Plugin"
                .to_string(),
            icon_path: "./icon.png".to_string(),
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
        }
    }
}

fn default_bw_executable() -> &'static str {
    if cfg!(windows) {
        "bw.exe"
    } else {
        "bw"
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Loads `path`, falling back to defaults when the file is missing.
    /// `BWFLOW_BW_EXECUTABLE` overrides the executable from the file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = match fs::read_to_string(path.as_ref()) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };

        if let Ok(value) = env::var(BW_EXECUTABLE_ENV) {
            if !value.trim().is_empty() {
                config.bw_executable = PathBuf::from(value.trim());
            }
        }

        validate(&config)?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// `BWFLOW_CONFIG` when set, otherwise `bwflow.toml` in the working
/// directory (the launcher starts plugins from their install folder).
pub fn default_config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.bw_executable.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("bw_executable is required".into()));
    }

    if cfg.server_hostname.trim().is_empty() {
        return Err(ConfigError::Invalid("server_hostname is required".into()));
    }

    if !(100..=120_000).contains(&cfg.request_timeout_ms) {
        return Err(ConfigError::Invalid(
            "request_timeout_ms must be between 100 and 120000".into(),
        ));
    }

    if cfg.log_dir.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("log_dir is required".into()));
    }

    Ok(())
}
