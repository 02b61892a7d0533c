/// Optional settings file
/// Stored in ~/.config/ragctl/config.toml; every key can be overridden from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings as written in the TOML file. Durations use humantime syntax ("15s", "2m").
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub project: Option<String>,
    pub base_path: Option<String>,
    pub compose_dir: Option<String>,
    pub backup_retention: Option<usize>,
    pub health_url: Option<String>,
    pub health_request_timeout: Option<String>,
    pub health_wait: Option<String>,
    pub health_interval: Option<String>,
    pub graceful_timeout: Option<String>,
    pub gather_timeout: Option<String>,
    pub kill_timeout: Option<String>,
    pub remove_timeout: Option<String>,
    pub daemon_restart_timeout: Option<String>,
    pub host_kill_timeout: Option<String>,
    pub cleanup_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub bringup_timeout: Option<String>,
    pub volume_op_timeout: Option<String>,
    pub utility_image: Option<String>,
    pub daemon_service: Option<String>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub remote_path: Option<String>,
}

impl AppConfig {
    /// Default config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ragctl").join("config.toml"))
    }

    /// Load the default config file; a missing file yields empty settings
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Look up a setting by its environment variable name
    pub fn get(&self, env_key: &str) -> Option<String> {
        let value = match env_key {
            "RAGCTL_PROJECT" => self.project.clone(),
            "RAGCTL_BASE_PATH" => self.base_path.clone(),
            "RAGCTL_COMPOSE_DIR" => self.compose_dir.clone(),
            "RAGCTL_BACKUP_RETENTION" => self.backup_retention.map(|n| n.to_string()),
            "RAGCTL_HEALTH_URL" => self.health_url.clone(),
            "RAGCTL_HEALTH_REQUEST_TIMEOUT" => self.health_request_timeout.clone(),
            "RAGCTL_HEALTH_WAIT" => self.health_wait.clone(),
            "RAGCTL_HEALTH_INTERVAL" => self.health_interval.clone(),
            "RAGCTL_GRACEFUL_TIMEOUT" => self.graceful_timeout.clone(),
            "RAGCTL_GATHER_TIMEOUT" => self.gather_timeout.clone(),
            "RAGCTL_KILL_TIMEOUT" => self.kill_timeout.clone(),
            "RAGCTL_REMOVE_TIMEOUT" => self.remove_timeout.clone(),
            "RAGCTL_DAEMON_RESTART_TIMEOUT" => self.daemon_restart_timeout.clone(),
            "RAGCTL_HOST_KILL_TIMEOUT" => self.host_kill_timeout.clone(),
            "RAGCTL_CLEANUP_TIMEOUT" => self.cleanup_timeout.clone(),
            "RAGCTL_POLL_INTERVAL" => self.poll_interval.clone(),
            "RAGCTL_BRINGUP_TIMEOUT" => self.bringup_timeout.clone(),
            "RAGCTL_VOLUME_OP_TIMEOUT" => self.volume_op_timeout.clone(),
            "RAGCTL_UTILITY_IMAGE" => self.utility_image.clone(),
            "RAGCTL_DAEMON_SERVICE" => self.daemon_service.clone(),
            "RAGCTL_REMOTE_HOST" => self.remote_host.clone(),
            "RAGCTL_REMOTE_USER" => self.remote_user.clone(),
            "RAGCTL_REMOTE_PATH" => self.remote_path.clone(),
            _ => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}
