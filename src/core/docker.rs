/// Docker and Docker Compose integration
///
/// `RuntimeDriver` implementation on top of the Docker API (bollard) and the
/// `docker compose` CLI. Subprocesses are spawned with `kill_on_drop` so an
/// abandoned deadline also ends the child.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig};
use bollard::network::PruneNetworksOptions;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

use crate::core::config::ControllerConfig;
use crate::core::runtime::{DriverError, RuntimeDriver, Unit};
use crate::utils::{COMPOSE_PROJECT_LABEL, UTILITY_CLEANUP_MARGIN, UTILITY_LABEL};

#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
    compose_dir: PathBuf,
    utility_image: String,
    daemon_service: String,
    volume_op: Duration,
}

/// Force-removes a utility container that is dropped before it was cleaned up
struct UtilityContainer {
    docker: Docker,
    id: String,
    armed: bool,
}

impl Drop for UtilityContainer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let options = Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                });
                if let Err(e) = docker.remove_container(&id, options).await {
                    tracing::warn!(container = %id, error = %e, "Failed to remove abandoned utility container");
                }
            });
        }
    }
}

impl DockerDriver {
    /// Connect to the local Docker daemon
    pub fn connect(config: &ControllerConfig) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()?;

        Ok(Self {
            docker,
            compose_dir: config.compose_dir.clone(),
            utility_image: config.utility_image.clone(),
            daemon_service: config.daemon_service.clone(),
            volume_op: config.timeouts.volume_op,
        })
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Execute docker compose command for the project
    async fn compose_command(&self, project: &str, args: &[&str]) -> Result<String, DriverError> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("--project-name")
            .arg(project)
            .args(args)
            .current_dir(&self.compose_dir);

        run_command(cmd, &format!("docker compose {}", args.join(" "))).await
    }

    /// Pull the utility image if the daemon does not have it yet
    async fn ensure_utility_image(&self) -> Result<(), DriverError> {
        match self.docker.inspect_image(&self.utility_image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, &[404]) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(image = %self.utility_image, "Pulling utility image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.utility_image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    /// Run a one-shot utility container and remove it afterwards.
    ///
    /// The container gets the volume-operation deadline minus a short margin;
    /// on expiry it is force-removed before `Timeout` is returned, so it
    /// cannot keep holding the volumes it mounts.
    async fn run_utility(
        &self,
        operation: &str,
        binds: Vec<String>,
        cmd: Vec<String>,
    ) -> Result<(), DriverError> {
        let expires = Instant::now() + utility_budget(self.volume_op);

        self.ensure_utility_image().await?;

        let mut labels = HashMap::new();
        labels.insert(UTILITY_LABEL.to_string(), operation.to_string());

        let config = Config {
            image: Some(self.utility_image.clone()),
            cmd: Some(cmd),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let mut guard = UtilityContainer {
            docker: self.docker.clone(),
            id: container.id.clone(),
            armed: true,
        };

        let exit = match tokio::time::timeout_at(expires, self.start_and_wait(&container.id)).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(container = %container.id, operation, "Utility container over its deadline, removing");
                Err(DriverError::Timeout(self.volume_op))
            }
        };
        let detail = match &exit {
            Ok(0) | Err(DriverError::Timeout(_)) => String::new(),
            _ => self.utility_logs(&container.id).await,
        };

        match self.remove_unit(&container.id).await {
            Ok(()) => guard.armed = false,
            Err(e) => tracing::warn!(container = %container.id, error = %e, "Failed to remove utility container"),
        }

        match exit? {
            0 => Ok(()),
            code => Err(DriverError::UtilityFailed {
                operation: operation.to_string(),
                code,
                detail,
            }),
        }
    }

    async fn start_and_wait(&self, id: &str) -> Result<i64, DriverError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut code = 0;
        while let Some(item) = wait.next().await {
            match item {
                Ok(response) => code = response.status_code,
                // Non-zero exits surface as an error carrying the code
                Err(BollardError::DockerContainerWaitError { code: c, .. }) => code = c,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(code)
    }

    async fn utility_logs(&self, id: &str) -> String {
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "20".to_string(),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(Ok(line)) = logs.next().await {
            output.push_str(&line.to_string());
        }
        output.trim().to_string()
    }

    /// Convert ContainerSummary to Unit
    fn container_summary_to_unit(summary: ContainerSummary) -> Unit {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let state = summary.state.as_deref().unwrap_or("unknown").into();

        Unit {
            id: summary.id.unwrap_or_default(),
            name,
            state,
        }
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    async fn stop_stack(&self, project: &str) -> Result<(), DriverError> {
        self.compose_command(project, &["down"]).await?;
        Ok(())
    }

    async fn start_stack(&self, project: &str) -> Result<(), DriverError> {
        self.compose_command(project, &["up", "-d"]).await?;
        Ok(())
    }

    async fn list_units(&self, project: &str, include_stopped: bool) -> Result<Vec<Unit>, DriverError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project)],
        );

        let options = Some(ListContainersOptions {
            all: include_stopped,
            filters,
            ..Default::default()
        });

        let units = self
            .docker
            .list_containers(options)
            .await?
            .into_iter()
            .map(Self::container_summary_to_unit)
            .filter(|u| include_stopped || u.state.is_running())
            .collect();

        Ok(units)
    }

    async fn kill_unit(&self, id: &str) -> Result<(), DriverError> {
        match self
            .docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            // 404: already removed, 409: not running
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_unit(&self, id: &str) -> Result<(), DriverError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });

        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            // 409: removal already in progress
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restart_daemon(&self) -> Result<(), DriverError> {
        if !self.is_privileged() {
            return Err(DriverError::PrivilegeRequired("Restarting the Docker daemon".to_string()));
        }

        let mut cmd = Command::new("systemctl");
        cmd.arg("restart").arg(&self.daemon_service);
        run_command(cmd, &format!("systemctl restart {}", self.daemon_service)).await?;
        Ok(())
    }

    async fn kill_unit_processes(&self, units: &[Unit]) -> Result<usize, DriverError> {
        if !self.is_privileged() {
            return Err(DriverError::PrivilegeRequired("Killing container processes".to_string()));
        }

        // The daemon may be wedged; inspect is best effort, the shim scan below is not
        let mut init_pids = HashSet::new();
        for unit in units {
            match self.docker.inspect_container(&unit.id, None).await {
                Ok(inspect) => {
                    if let Some(pid) = inspect.state.and_then(|s| s.pid).filter(|p| *p > 0) {
                        init_pids.insert(pid as u32);
                    }
                }
                Err(e) => tracing::debug!(unit = %unit.name, error = %e, "inspect failed, relying on process scan"),
            }
        }

        let ids: Vec<String> = units.iter().map(|u| u.id.clone()).filter(|id| !id.is_empty()).collect();
        let signalled = tokio::task::spawn_blocking(move || kill_matching_processes(&init_pids, &ids))
            .await
            .map_err(|e| DriverError::Other(format!("process scan panicked: {}", e)))?;

        Ok(signalled)
    }

    async fn prune_networks(&self, project: &str) -> Result<Vec<String>, DriverError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project)],
        );

        let response = self
            .docker
            .prune_networks(Some(PruneNetworksOptions { filters }))
            .await?;

        Ok(response.networks_deleted.unwrap_or_default())
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    async fn list_volumes(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        let mut filters = HashMap::new();
        if !prefix.is_empty() {
            // Substring match on the daemon side, exact prefix check below
            filters.insert("name".to_string(), vec![prefix.to_string()]);
        }

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await?;

        let mut names: Vec<String> = response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();

        Ok(names)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<(), DriverError> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DriverError> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn archive_volume(&self, volume: &str, dir: &Path, file_name: &str) -> Result<(), DriverError> {
        let binds = vec![
            format!("{}:/source:ro", volume),
            format!("{}:/backup", dir.display()),
        ];
        let cmd = vec![
            "tar".to_string(),
            "-cf".to_string(),
            format!("/backup/{}", file_name),
            "-C".to_string(),
            "/source".to_string(),
            ".".to_string(),
        ];
        self.run_utility("archive", binds, cmd).await
    }

    async fn extract_into_volume(&self, archive: &Path, volume: &str) -> Result<(), DriverError> {
        let dir = archive
            .parent()
            .ok_or_else(|| DriverError::Other(format!("{} has no parent directory", archive.display())))?;
        let file_name = archive
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| DriverError::Other(format!("{} has no file name", archive.display())))?;
        let flags = if file_name.ends_with(".gz") || file_name.ends_with(".tgz") {
            "-xzf"
        } else {
            "-xf"
        };

        let binds = vec![
            format!("{}:/target", volume),
            format!("{}:/backup:ro", dir.display()),
        ];
        let cmd = vec![
            "tar".to_string(),
            flags.to_string(),
            format!("/backup/{}", file_name),
            "-C".to_string(),
            "/target".to_string(),
        ];
        self.run_utility("extract", binds, cmd).await
    }

    async fn clone_volume(&self, source: &str, target: &str) -> Result<(), DriverError> {
        let binds = vec![format!("{}:/from:ro", source), format!("{}:/to", target)];
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cp -a /from/. /to/".to_string(),
        ];
        self.run_utility("clone", binds, cmd).await
    }
}

/// Time a utility container may run within the volume-operation deadline
fn utility_budget(volume_op: Duration) -> Duration {
    let margin = (volume_op / 10).min(UTILITY_CLEANUP_MARGIN);
    volume_op.saturating_sub(margin)
}

/// True when the daemon answered with one of `codes`
fn is_status(error: &BollardError, codes: &[u16]) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

async fn run_command(mut cmd: Command, shown: &str) -> Result<String, DriverError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(command = shown, "Spawning");
    let output = cmd.output().await?;

    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            command: shown.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// SIGKILL every process that is a unit's init process or whose command line
/// names a unit id (the runtime shim).
fn kill_matching_processes(init_pids: &HashSet<u32>, ids: &[String]) -> usize {
    use sysinfo::{Signal, System};

    let mut system = System::new();
    system.refresh_processes();
    let own_pid = std::process::id();

    let mut signalled = 0;
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if pid == own_pid {
            continue;
        }
        let backs_unit = init_pids.contains(&pid)
            || process
                .cmd()
                .iter()
                .any(|arg| ids.iter().any(|id| arg.contains(id.as_str())));
        if !backs_unit {
            continue;
        }
        match process.kill_with(Signal::Kill) {
            Some(true) => {
                tracing::warn!(pid, name = %process.name(), "Sent SIGKILL");
                signalled += 1;
            }
            _ => tracing::warn!(pid, name = %process.name(), "Failed to signal process"),
        }
    }
    signalled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::UnitState;

    #[test]
    fn test_summary_to_unit() {
        let summary = ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/r2r-postgres-1".to_string()]),
            state: Some("exited".to_string()),
            ..Default::default()
        };
        let unit = DockerDriver::container_summary_to_unit(summary);
        assert_eq!(unit.id, "abc123");
        assert_eq!(unit.name, "r2r-postgres-1");
        assert_eq!(unit.state, UnitState::Exited);
    }

    #[test]
    fn test_is_status() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_status(&not_found, &[404, 409]));
        assert!(!is_status(&not_found, &[409]));
    }

    #[test]
    fn test_utility_budget_leaves_room_for_cleanup() {
        assert_eq!(utility_budget(Duration::from_secs(3600)), Duration::from_secs(3595));
        assert_eq!(utility_budget(Duration::from_secs(10)), Duration::from_secs(9));
        assert!(utility_budget(Duration::from_millis(1)) <= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_docker_driver_creation() {
        // This test requires Docker to be running
        let config = crate::core::testing::test_config(Path::new("/tmp"));
        if let Ok(driver) = DockerDriver::connect(&config) {
            if driver.check_docker().await {
                assert!(driver.list_volumes("ragctl-test-nonexistent_").await.unwrap().is_empty());
            }
        }
    }
}
