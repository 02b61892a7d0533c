/// Controller configuration
///
/// Built once at startup from the settings file, the env file and the process
/// environment, validated, then passed by reference into every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{
    is_valid_project_id, ACTIVE_DIR, ARCHIVED_DIR, DEFAULT_BRINGUP_TIMEOUT,
    DEFAULT_CLEANUP_TIMEOUT, DEFAULT_DAEMON_RESTART_TIMEOUT, DEFAULT_DAEMON_SERVICE,
    DEFAULT_GATHER_TIMEOUT, DEFAULT_GRACEFUL_TIMEOUT, DEFAULT_HEALTH_INTERVAL,
    DEFAULT_HEALTH_REQUEST_TIMEOUT, DEFAULT_HEALTH_URL, DEFAULT_HEALTH_WAIT,
    DEFAULT_HOST_KILL_TIMEOUT, DEFAULT_KILL_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_REMOVE_TIMEOUT, DEFAULT_UTILITY_IMAGE, DEFAULT_VOLUME_OP_TIMEOUT, STAGING_DIR,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Deadlines for every bounded wait the controller performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub graceful: Duration,
    pub gather: Duration,
    pub kill: Duration,
    pub remove: Duration,
    pub daemon_restart: Duration,
    pub host_kill: Duration,
    pub cleanup: Duration,
    pub poll_interval: Duration,
    pub bringup: Duration,
    pub volume_op: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            graceful: DEFAULT_GRACEFUL_TIMEOUT,
            gather: DEFAULT_GATHER_TIMEOUT,
            kill: DEFAULT_KILL_TIMEOUT,
            remove: DEFAULT_REMOVE_TIMEOUT,
            daemon_restart: DEFAULT_DAEMON_RESTART_TIMEOUT,
            host_kill: DEFAULT_HOST_KILL_TIMEOUT,
            cleanup: DEFAULT_CLEANUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            bringup: DEFAULT_BRINGUP_TIMEOUT,
            volume_op: DEFAULT_VOLUME_OP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub url: String,
    pub request_timeout: Duration,
    /// How long to keep polling after a bring-up before giving up
    pub wait: Duration,
    pub interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_HEALTH_URL.to_string(),
            request_timeout: DEFAULT_HEALTH_REQUEST_TIMEOUT,
            wait: DEFAULT_HEALTH_WAIT,
            interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Off-box transfer coordinates. Parsed and validated only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub project: String,
    pub base_path: PathBuf,
    pub compose_dir: PathBuf,
    /// Safety copies kept per volume by rotation; `None` keeps everything
    pub backup_retention: Option<usize>,
    pub health: HealthSettings,
    pub timeouts: Timeouts,
    pub utility_image: String,
    pub daemon_service: String,
    pub remote: Option<RemoteTarget>,
}

impl ControllerConfig {
    /// Build the configuration from a key lookup (environment first, then settings file).
    ///
    /// Every problem is collected so the operator sees them all at once.
    pub fn from_lookup<F>(lookup: F, cwd: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let project = get("RAGCTL_PROJECT")
            .or_else(|| get("COMPOSE_PROJECT_NAME"))
            .unwrap_or_else(|| {
                errors.push("RAGCTL_PROJECT is not set".to_string());
                String::new()
            });

        let base_path = get("RAGCTL_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                errors.push("RAGCTL_BASE_PATH is not set".to_string());
                PathBuf::new()
            });

        let compose_dir = match get("RAGCTL_COMPOSE_DIR").map(PathBuf::from) {
            Some(dir) if dir.is_relative() => cwd.join(dir),
            Some(dir) => dir,
            None => cwd.to_path_buf(),
        };

        let backup_retention = match get("RAGCTL_BACKUP_RETENTION") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    errors.push(format!("RAGCTL_BACKUP_RETENTION is not a number: {}", raw));
                    None
                }
            },
            None => None,
        };

        let mut duration = |key: &str, default: Duration| -> Duration {
            match get(key) {
                Some(raw) => match humantime::parse_duration(&raw) {
                    Ok(d) => d,
                    Err(e) => {
                        errors.push(format!("{} is not a duration ({}): {}", key, e, raw));
                        default
                    }
                },
                None => default,
            }
        };

        let timeouts = Timeouts {
            graceful: duration("RAGCTL_GRACEFUL_TIMEOUT", DEFAULT_GRACEFUL_TIMEOUT),
            gather: duration("RAGCTL_GATHER_TIMEOUT", DEFAULT_GATHER_TIMEOUT),
            kill: duration("RAGCTL_KILL_TIMEOUT", DEFAULT_KILL_TIMEOUT),
            remove: duration("RAGCTL_REMOVE_TIMEOUT", DEFAULT_REMOVE_TIMEOUT),
            daemon_restart: duration("RAGCTL_DAEMON_RESTART_TIMEOUT", DEFAULT_DAEMON_RESTART_TIMEOUT),
            host_kill: duration("RAGCTL_HOST_KILL_TIMEOUT", DEFAULT_HOST_KILL_TIMEOUT),
            cleanup: duration("RAGCTL_CLEANUP_TIMEOUT", DEFAULT_CLEANUP_TIMEOUT),
            poll_interval: duration("RAGCTL_POLL_INTERVAL", DEFAULT_POLL_INTERVAL),
            bringup: duration("RAGCTL_BRINGUP_TIMEOUT", DEFAULT_BRINGUP_TIMEOUT),
            volume_op: duration("RAGCTL_VOLUME_OP_TIMEOUT", DEFAULT_VOLUME_OP_TIMEOUT),
        };

        let health = HealthSettings {
            url: get("RAGCTL_HEALTH_URL").unwrap_or_else(|| DEFAULT_HEALTH_URL.to_string()),
            request_timeout: duration("RAGCTL_HEALTH_REQUEST_TIMEOUT", DEFAULT_HEALTH_REQUEST_TIMEOUT),
            wait: duration("RAGCTL_HEALTH_WAIT", DEFAULT_HEALTH_WAIT),
            interval: duration("RAGCTL_HEALTH_INTERVAL", DEFAULT_HEALTH_INTERVAL),
        };

        let remote = match (
            get("RAGCTL_REMOTE_HOST"),
            get("RAGCTL_REMOTE_USER"),
            get("RAGCTL_REMOTE_PATH"),
        ) {
            (Some(host), Some(user), Some(path)) => Some(RemoteTarget { host, user, path }),
            (None, None, None) => None,
            _ => {
                errors.push(
                    "RAGCTL_REMOTE_HOST, RAGCTL_REMOTE_USER and RAGCTL_REMOTE_PATH must be set together"
                        .to_string(),
                );
                None
            }
        };

        let config = Self {
            project,
            base_path,
            compose_dir,
            backup_retention,
            health,
            timeouts,
            utility_image: get("RAGCTL_UTILITY_IMAGE").unwrap_or_else(|| DEFAULT_UTILITY_IMAGE.to_string()),
            daemon_service: get("RAGCTL_DAEMON_SERVICE").unwrap_or_else(|| DEFAULT_DAEMON_SERVICE.to_string()),
            remote,
        };

        // Missing keys were already reported; skip the checks that depend on them
        if errors.is_empty() {
            errors.extend(config.validate());
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !is_valid_project_id(&self.project) {
            errors.push(format!("Invalid project identifier: {:?}", self.project));
        }

        if !self.base_path.is_absolute() {
            errors.push(format!(
                "RAGCTL_BASE_PATH must be absolute: {}",
                self.base_path.display()
            ));
        }

        if self.backup_retention == Some(0) {
            errors.push("RAGCTL_BACKUP_RETENTION must be at least 1".to_string());
        }

        if !self.health.url.starts_with("http://") && !self.health.url.starts_with("https://") {
            errors.push(format!("RAGCTL_HEALTH_URL is not an http(s) URL: {}", self.health.url));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("graceful", t.graceful),
            ("gather", t.gather),
            ("kill", t.kill),
            ("remove", t.remove),
            ("daemon restart", t.daemon_restart),
            ("host kill", t.host_kill),
            ("cleanup", t.cleanup),
            ("poll interval", t.poll_interval),
            ("bring-up", t.bringup),
            ("volume operation", t.volume_op),
            ("health request", self.health.request_timeout),
        ] {
            if value.is_zero() {
                errors.push(format!("The {} deadline must be greater than zero", name));
            }
        }

        if self.utility_image.trim().is_empty() {
            errors.push("RAGCTL_UTILITY_IMAGE is empty".to_string());
        }

        errors
    }

    /// Directory holding live data
    pub fn active_dir(&self) -> PathBuf {
        self.base_path.join(ACTIVE_DIR)
    }

    /// Directory holding one archive file per snapshot
    pub fn archive_dir(&self) -> PathBuf {
        self.base_path.join(ARCHIVED_DIR)
    }

    /// Transient staging and scratch space
    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join(STAGING_DIR)
    }

    /// Advisory lock guarding snapshot and restore for this project
    pub fn lock_path(&self) -> PathBuf {
        self.base_path.join(format!(".ragctl-{}.lock", self.project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(
            lookup(&[("RAGCTL_PROJECT", "r2r"), ("RAGCTL_BASE_PATH", "/srv/rag")]),
            Path::new("/opt/stack"),
        )
        .unwrap();

        assert_eq!(config.project, "r2r");
        assert_eq!(config.compose_dir, PathBuf::from("/opt/stack"));
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.timeouts.graceful, Duration::from_secs(15));
        assert_eq!(config.backup_retention, None);
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/rag/archived"));
        assert_eq!(config.active_dir(), PathBuf::from("/srv/rag/active"));
        assert_eq!(config.lock_path(), PathBuf::from("/srv/rag/.ragctl-r2r.lock"));
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = ControllerConfig::from_lookup(
            lookup(&[
                ("COMPOSE_PROJECT_NAME", "rag"),
                ("RAGCTL_BASE_PATH", "/data"),
                ("RAGCTL_COMPOSE_DIR", "deploy"),
                ("RAGCTL_GRACEFUL_TIMEOUT", "30s"),
                ("RAGCTL_POLL_INTERVAL", "250ms"),
                ("RAGCTL_BACKUP_RETENTION", "2"),
            ]),
            Path::new("/home/ops"),
        )
        .unwrap();

        assert_eq!(config.project, "rag");
        assert_eq!(config.compose_dir, PathBuf::from("/home/ops/deploy"));
        assert_eq!(config.timeouts.graceful, Duration::from_secs(30));
        assert_eq!(config.timeouts.poll_interval, Duration::from_millis(250));
        assert_eq!(config.backup_retention, Some(2));
    }

    #[test]
    fn test_missing_required_keys_are_all_reported() {
        let err = ControllerConfig::from_lookup(lookup(&[]), Path::new("/")).unwrap_err();
        let ConfigError::Invalid(errors) = err;
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("RAGCTL_PROJECT")));
        assert!(errors.iter().any(|e| e.contains("RAGCTL_BASE_PATH")));
    }

    #[test]
    fn test_invalid_values() {
        let err = ControllerConfig::from_lookup(
            lookup(&[
                ("RAGCTL_PROJECT", "r2r"),
                ("RAGCTL_BASE_PATH", "relative/path"),
                ("RAGCTL_BACKUP_RETENTION", "0"),
                ("RAGCTL_KILL_TIMEOUT", "soon"),
                ("RAGCTL_REMOTE_HOST", "backup.example.org"),
            ]),
            Path::new("/"),
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("RAGCTL_KILL_TIMEOUT"));
        assert!(message.contains("must be set together"));

        // With the parse errors fixed, semantic validation kicks in
        let err = ControllerConfig::from_lookup(
            lookup(&[
                ("RAGCTL_PROJECT", "r2r"),
                ("RAGCTL_BASE_PATH", "relative/path"),
                ("RAGCTL_BACKUP_RETENTION", "0"),
            ]),
            Path::new("/"),
        )
        .unwrap_err();
        let ConfigError::Invalid(errors) = err;
        assert_eq!(errors.len(), 2);
    }
}
