/// Shutdown escalation
///
/// Drives the runtime through progressively harsher stop strategies until the
/// stack is down or every strategy has been tried:
///
/// 1. graceful stack-level stop
/// 2. gather the units still running
/// 3. SIGKILL each unit
/// 4. force-remove each unit
/// 5. restart the runtime daemon (privileged)
/// 6. SIGKILL the backing host processes (privileged, always terminal)
///
/// Each stage runs under its own hard deadline; an expired stage future is
/// dropped and the next stage begins.

use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::core::config::{ControllerConfig, Timeouts};
use crate::core::outcome::{Outcome, OutcomeKind, StageLog};
use crate::core::runtime::{DriverError, RuntimeDriver, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Graceful,
    Gather,
    Kill,
    ForceRemove,
    DaemonRestart,
    HostKill,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::Graceful => 1,
            Stage::Gather => 2,
            Stage::Kill => 3,
            Stage::ForceRemove => 4,
            Stage::DaemonRestart => 5,
            Stage::HostKill => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Graceful => "graceful",
            Stage::Gather => "gather",
            Stage::Kill => "kill",
            Stage::ForceRemove => "force-remove",
            Stage::DaemonRestart => "daemon-restart",
            Stage::HostKill => "host-kill",
        }
    }

    pub fn deadline(&self, timeouts: &Timeouts) -> Duration {
        match self {
            Stage::Graceful => timeouts.graceful,
            Stage::Gather => timeouts.gather,
            Stage::Kill => timeouts.kill,
            Stage::ForceRemove => timeouts.remove,
            Stage::DaemonRestart => timeouts.daemon_restart,
            Stage::HostKill => timeouts.host_kill,
        }
    }

    pub fn requires_privilege(&self) -> bool {
        matches!(self, Stage::DaemonRestart | Stage::HostKill)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number(), self.name())
    }
}

/// What a single stage attempt produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    /// The stage brought the stack down
    Stopped,
    /// Gather found nothing running
    NothingRunning,
    /// Gather found this many running units
    Gathered(usize),
    /// Host processes signalled
    HostKilled(usize),
    Failed(String),
    TimedOut,
    PrivilegeDenied,
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageResult::Stopped => write!(f, "stopped"),
            StageResult::NothingRunning => write!(f, "no running units"),
            StageResult::Gathered(n) => write!(f, "{} unit(s) still running", n),
            StageResult::HostKilled(n) => write!(f, "signalled {} host process(es)", n),
            StageResult::Failed(reason) => write!(f, "failed: {}", reason),
            StageResult::TimedOut => write!(f, "deadline expired"),
            StageResult::PrivilegeDenied => write!(f, "denied: requires root privileges"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(Stage),
    Finish(OutcomeKind),
}

/// The escalation state machine
pub fn transition(stage: Stage, result: &StageResult) -> Transition {
    use StageResult::*;
    use Transition::*;

    match (stage, result) {
        (_, PrivilegeDenied) => Finish(OutcomeKind::PrivilegeRequired),
        (Stage::HostKill, _) => Finish(OutcomeKind::EscalationExhausted),
        (Stage::Graceful, Stopped) => Finish(OutcomeKind::StoppedGracefully),
        (Stage::Graceful, _) => Next(Stage::Gather),
        (Stage::Gather, NothingRunning) => Finish(OutcomeKind::StoppedGracefully),
        (Stage::Gather, Gathered(_)) => Next(Stage::Kill),
        // Without a unit list kill and remove have nothing to act on
        (Stage::Gather, _) => Next(Stage::DaemonRestart),
        (Stage::Kill, Stopped) => Finish(OutcomeKind::StoppedByKill),
        (Stage::Kill, _) => Next(Stage::ForceRemove),
        (Stage::ForceRemove, Stopped) => Finish(OutcomeKind::StoppedByRemoval),
        (Stage::ForceRemove, _) => Next(Stage::DaemonRestart),
        (Stage::DaemonRestart, Stopped) => Finish(OutcomeKind::StoppedByDaemonRestart),
        (Stage::DaemonRestart, _) => Next(Stage::HostKill),
    }
}

pub struct ShutdownEscalator<'a> {
    config: &'a ControllerConfig,
    driver: &'a dyn RuntimeDriver,
}

impl<'a> ShutdownEscalator<'a> {
    pub fn new(config: &'a ControllerConfig, driver: &'a dyn RuntimeDriver) -> Self {
        Self { config, driver }
    }

    /// Stop the stack. `force` skips the graceful stage.
    pub async fn run(&self, force: bool) -> Outcome {
        let mut log = StageLog::new();
        let mut gathered: Vec<Unit> = Vec::new();
        let mut stage = if force { Stage::Gather } else { Stage::Graceful };

        tracing::info!(project = %self.config.project, force, "Stopping stack");

        loop {
            let deadline = stage.deadline(&self.config.timeouts);
            let started = Instant::now();

            let result = if stage.requires_privilege() && !self.driver.is_privileged() {
                StageResult::PrivilegeDenied
            } else {
                match timeout(deadline, self.execute(stage, &mut gathered)).await {
                    Ok(result) => result,
                    Err(_) => StageResult::TimedOut,
                }
            };

            log.record(stage.to_string(), Some(deadline), started.elapsed(), result.to_string());

            match transition(stage, &result) {
                Transition::Next(next) => stage = next,
                Transition::Finish(kind) => {
                    if kind.is_stopped() {
                        self.cleanup(&mut log).await;
                    }
                    let message = self.message(kind, stage);
                    return Outcome::new(kind, message, log);
                }
            }
        }
    }

    fn message(&self, kind: OutcomeKind, stage: Stage) -> String {
        let project = &self.config.project;
        match kind {
            OutcomeKind::EscalationExhausted => format!(
                "Every shutdown stage was tried for {}; host processes were signalled. \
                 Manual operator intervention may be required.",
                project
            ),
            OutcomeKind::PrivilegeRequired => format!(
                "Stage {} needs root privileges; rerun as root or stop {} by hand",
                stage, project
            ),
            _ => format!("Stack {} is down ({})", project, kind),
        }
    }

    async fn execute(&self, stage: Stage, gathered: &mut Vec<Unit>) -> StageResult {
        let project = self.config.project.as_str();

        match stage {
            Stage::Graceful => {
                if let Err(e) = self.driver.stop_stack(project).await {
                    return StageResult::Failed(e.to_string());
                }
                match self.driver.list_units(project, false).await {
                    Ok(units) if units.is_empty() => StageResult::Stopped,
                    Ok(units) => StageResult::Failed(format!("{} unit(s) still running", units.len())),
                    Err(e) => StageResult::Failed(e.to_string()),
                }
            }

            Stage::Gather => match self.driver.list_units(project, false).await {
                Ok(units) if units.is_empty() => StageResult::NothingRunning,
                Ok(units) => {
                    let count = units.len();
                    for unit in &units {
                        tracing::debug!(id = %unit.id, name = %unit.name, state = unit.state.as_str(), "Gathered unit");
                    }
                    *gathered = units;
                    StageResult::Gathered(count)
                }
                Err(e) => StageResult::Failed(e.to_string()),
            },

            Stage::Kill => {
                let mut errors = Vec::new();
                for unit in gathered.iter() {
                    if let Err(e) = self.driver.kill_unit(&unit.id).await {
                        errors.push(format!("{}: {}", unit.name, e));
                    }
                }
                if !errors.is_empty() {
                    return StageResult::Failed(errors.join("; "));
                }
                let ids: Vec<&str> = gathered.iter().map(|u| u.id.as_str()).collect();
                self.poll_until(false, |units| !units.iter().any(|u| ids.contains(&u.id.as_str())))
                    .await
            }

            Stage::ForceRemove => {
                let mut errors = Vec::new();
                for unit in gathered.iter() {
                    if let Err(e) = self.driver.remove_unit(&unit.id).await {
                        errors.push(format!("{}: {}", unit.name, e));
                    }
                }
                if !errors.is_empty() {
                    return StageResult::Failed(errors.join("; "));
                }
                let ids: Vec<&str> = gathered.iter().map(|u| u.id.as_str()).collect();
                self.poll_until(true, |units| !units.iter().any(|u| ids.contains(&u.id.as_str())))
                    .await
            }

            Stage::DaemonRestart => match self.driver.restart_daemon().await {
                Ok(()) => self.poll_until(false, |units| units.is_empty()).await,
                Err(DriverError::PrivilegeRequired(_)) => StageResult::PrivilegeDenied,
                Err(e) => StageResult::Failed(e.to_string()),
            },

            Stage::HostKill => {
                let targets = if gathered.is_empty() {
                    match self.driver.list_units(project, true).await {
                        Ok(units) => units,
                        Err(e) => return StageResult::Failed(format!("cannot list units to kill: {}", e)),
                    }
                } else {
                    gathered.clone()
                };
                match self.driver.kill_unit_processes(&targets).await {
                    Ok(count) => StageResult::HostKilled(count),
                    Err(DriverError::PrivilegeRequired(_)) => StageResult::PrivilegeDenied,
                    Err(e) => StageResult::Failed(e.to_string()),
                }
            }
        }
    }

    /// Poll the unit list until `done` holds. Only the stage deadline ends a poll.
    async fn poll_until<F>(&self, include_stopped: bool, done: F) -> StageResult
    where
        F: Fn(&[Unit]) -> bool,
    {
        loop {
            match self.driver.list_units(&self.config.project, include_stopped).await {
                Ok(units) if done(&units) => return StageResult::Stopped,
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Unit listing failed while polling"),
            }
            sleep(self.config.timeouts.poll_interval).await;
        }
    }

    /// Remove units left in created/exited/dead state and prune project networks
    async fn cleanup(&self, log: &mut StageLog) {
        let deadline = self.config.timeouts.cleanup;
        let started = Instant::now();

        let result = match timeout(deadline, self.remove_zombies()).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Zombie cleanup failed");
                format!("warning: {}", e)
            }
            Err(_) => {
                tracing::warn!("Zombie cleanup timed out");
                "warning: deadline expired".to_string()
            }
        };

        log.record("cleanup", Some(deadline), started.elapsed(), result);
    }

    async fn remove_zombies(&self) -> Result<String, DriverError> {
        let project = self.config.project.as_str();
        let zombies: Vec<Unit> = self
            .driver
            .list_units(project, true)
            .await?
            .into_iter()
            .filter(|u| u.state.is_zombie())
            .collect();

        let mut removed = 0;
        let mut warnings = Vec::new();
        for unit in &zombies {
            match self.driver.remove_unit(&unit.id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(unit = %unit.name, error = %e, "Failed to remove zombie unit");
                    warnings.push(format!("{}: {}", unit.name, e));
                }
            }
        }

        let networks = match self.driver.prune_networks(project).await {
            Ok(networks) => networks.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prune networks");
                warnings.push(format!("networks: {}", e));
                0
            }
        };

        let mut summary = format!(
            "removed {} zombie unit(s), pruned {} network(s)",
            removed, networks
        );
        if !warnings.is_empty() {
            summary.push_str(&format!("; warning: {}", warnings.join("; ")));
        }
        Ok(summary)
    }
}
