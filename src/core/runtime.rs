/// Runtime driver abstraction
///
/// The only seam between the controller and the container runtime. Every
/// operation is idempotent: killing or removing something that is already
/// gone succeeds, so a call that completes after its deadline was abandoned
/// cannot break the escalation that followed it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::utils::UnitState;

/// One container of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub state: UnitState,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{operation} utility container exited with status {code}: {detail}")]
    UtilityFailed {
        operation: String,
        code: i64,
        detail: String,
    },

    #[error("{0} requires root privileges")]
    PrivilegeRequired(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Stack-level stop (`compose down`)
    async fn stop_stack(&self, project: &str) -> Result<(), DriverError>;

    /// Stack bring-up (`compose up -d`)
    async fn start_stack(&self, project: &str) -> Result<(), DriverError>;

    /// Units carrying the project label; stopped ones only when `include_stopped`
    async fn list_units(&self, project: &str, include_stopped: bool) -> Result<Vec<Unit>, DriverError>;

    async fn kill_unit(&self, id: &str) -> Result<(), DriverError>;

    /// Forced removal; removing a missing unit is not an error
    async fn remove_unit(&self, id: &str) -> Result<(), DriverError>;

    /// Restart the runtime's background service
    async fn restart_daemon(&self) -> Result<(), DriverError>;

    /// SIGKILL the host processes backing `units`; returns how many were signalled
    async fn kill_unit_processes(&self, units: &[Unit]) -> Result<usize, DriverError>;

    /// Remove unused networks of the project; returns the pruned names
    async fn prune_networks(&self, project: &str) -> Result<Vec<String>, DriverError>;

    /// Whether privilege-gated operations may be attempted
    fn is_privileged(&self) -> bool;

    /// Names of all volumes starting with `prefix`, sorted
    async fn list_volumes(&self, prefix: &str) -> Result<Vec<String>, DriverError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError>;

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<(), DriverError>;

    /// Removing a missing volume is not an error
    async fn remove_volume(&self, name: &str) -> Result<(), DriverError>;

    /// Write a tar of the volume's full contents to `dir/file_name`
    async fn archive_volume(&self, volume: &str, dir: &Path, file_name: &str) -> Result<(), DriverError>;

    /// Unpack a `.tar` or `.tar.gz` file into the (empty) volume
    async fn extract_into_volume(&self, archive: &Path, volume: &str) -> Result<(), DriverError>;

    /// Copy every byte of `source` into `target`
    async fn clone_volume(&self, source: &str, target: &str) -> Result<(), DriverError>;
}

/// Run a driver call under a hard deadline; the call is dropped on expiry
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, DriverError>
where
    F: std::future::Future<Output = Result<T, DriverError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| DriverError::Timeout(deadline))?
}
