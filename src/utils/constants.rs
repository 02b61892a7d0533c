/// Controller constants: runtime labels, naming patterns and defaults
///
/// Default deadlines follow the operational runbook for the stack: the
/// graceful `compose down` gets 15s before the controller starts escalating.

use std::time::Duration;

/// Label docker compose puts on every container, volume and network it owns
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label docker compose uses to map a volume back to its short name
pub const COMPOSE_VOLUME_LABEL: &str = "com.docker.compose.volume";

/// Label set on safety copies, pointing at the volume they were cloned from
pub const SAFETY_COPY_LABEL: &str = "ragctl.safety-copy-of";

/// Label set on one-shot utility containers
pub const UTILITY_LABEL: &str = "ragctl.utility";

/// Infix between a volume name and the unix time of its safety copy
pub const SAFETY_COPY_INFIX: &str = "_backup_";

/// Name of the manifest stored inside every consolidated archive
pub const MANIFEST_FILE: &str = "manifest.json";

/// Archive file extension (gzip compressed tar)
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Default archive name when `snapshot` is called without one
pub const DEFAULT_SNAPSHOT_NAME: &str = "snapshot";

/// Timestamp layout embedded in archive names (sorts lexicographically)
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Fixed body the health endpoint returns when the engine is up
pub const HEALTHY_BODY: &str = r#"{"results":{"message":"ok"}}"#;

pub const DEFAULT_HEALTH_URL: &str = "http://localhost:7272/v3/health";
pub const DEFAULT_UTILITY_IMAGE: &str = "alpine:3.20";
pub const DEFAULT_DAEMON_SERVICE: &str = "docker";

/// Sub-directories of the base storage path
pub const ACTIVE_DIR: &str = "active";
pub const ARCHIVED_DIR: &str = "archived";
pub const STAGING_DIR: &str = "staging";

pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REMOVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DAEMON_RESTART_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HOST_KILL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BRINGUP_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_VOLUME_OP_TIMEOUT: Duration = Duration::from_secs(3600);
/// Part of the volume-operation deadline reserved for removing an overdue utility container
pub const UTILITY_CLEANUP_MARGIN: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_WAIT: Duration = Duration::from_secs(120);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
