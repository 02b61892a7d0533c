/// Restore from an archive
///
/// Every live volume that gets replaced is first cloned into a safety copy.
/// When the restored stack does not come back healthy, the safety copies are
/// cloned back and the stack is brought up again on its previous data.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tokio::time::Instant;

use crate::core::archive::{locate_members, unpack, validate_archive, ArchiveError, VolumeMember};
use crate::core::config::ControllerConfig;
use crate::core::escalator::ShutdownEscalator;
use crate::core::health::HealthValidator;
use crate::core::lock::{LockError, StackLock};
use crate::core::outcome::{Outcome, OutcomeKind, StageLog};
use crate::core::rotation::{RotationDecider, Rotator};
use crate::core::runtime::{with_deadline, DriverError, RuntimeDriver};
use crate::core::stack;
use crate::utils::{
    is_safety_copy, safety_copy_name, volume_short_name, COMPOSE_PROJECT_LABEL,
    COMPOSE_VOLUME_LABEL, SAFETY_COPY_LABEL,
};

/// What the apply step did to one volume, recorded before the live volume is touched
#[derive(Debug, Clone, Default)]
struct Applied {
    volume: String,
    safety_copy: Option<String>,
    /// The live volume may have been removed; rollback must put the safety copy back
    replaced: bool,
    /// The volume did not exist before the restore
    created: bool,
}

pub struct Restorer<'a> {
    config: &'a ControllerConfig,
    driver: &'a dyn RuntimeDriver,
    health: &'a dyn HealthValidator,
    decider: Option<&'a dyn RotationDecider>,
}

impl<'a> Restorer<'a> {
    pub fn new(
        config: &'a ControllerConfig,
        driver: &'a dyn RuntimeDriver,
        health: &'a dyn HealthValidator,
    ) -> Self {
        Self {
            config,
            driver,
            health,
            decider: None,
        }
    }

    /// Rotate safety copies after a restore when a retention is configured
    pub fn with_rotation(mut self, decider: &'a dyn RotationDecider) -> Self {
        self.decider = Some(decider);
        self
    }

    pub async fn run(&self, archive: &Path) -> Outcome {
        let mut log = StageLog::new();

        let _lock = match StackLock::acquire(&self.config.lock_path()) {
            Ok(lock) => lock,
            Err(e @ LockError::Held { .. }) => return Outcome::new(OutcomeKind::LockHeld, e.to_string(), log),
            Err(e) => return Outcome::new(OutcomeKind::PreconditionInvalid, e.to_string(), log),
        };

        // Nothing live is touched until the archive is known to be readable
        let started = Instant::now();
        match validate_archive(archive) {
            Ok(members) => log.record(
                "validate",
                None,
                started.elapsed(),
                format!("{} entries", members.len()),
            ),
            Err(e) => {
                log.record("validate", None, started.elapsed(), format!("failed: {}", e));
                let kind = match e {
                    ArchiveError::NotFound(_) => OutcomeKind::ArchiveNotFound,
                    _ => OutcomeKind::ArchiveCorrupt,
                };
                return Outcome::new(kind, e.to_string(), log);
            }
        }

        let was_running = match stack::is_running(self.config, self.driver).await {
            Ok(running) => running,
            Err(e) => {
                return Outcome::new(
                    OutcomeKind::PreconditionInvalid,
                    format!("Cannot query the runtime: {}", e),
                    log,
                )
            }
        };

        if was_running {
            let shutdown = ShutdownEscalator::new(self.config, self.driver).run(false).await;
            log.absorb("shutdown", shutdown.stage_log);
            if !shutdown.kind.is_stopped() {
                return Outcome::new(shutdown.kind, shutdown.message, log);
            }
        }

        let outcome = self.restore_stopped(archive, was_running, log).await;

        match (outcome.kind, self.decider, self.config.backup_retention) {
            (OutcomeKind::Restored | OutcomeKind::RolledBack, Some(decider), Some(retention)) => {
                let rotation = Rotator::new(self.config, self.driver, decider)
                    .run(Some(retention))
                    .await;
                let mut outcome = outcome;
                outcome.stage_log.absorb("rotation", rotation.stage_log);
                if !rotation.kind.is_success() {
                    outcome.message = format!("{}; {}: {}", outcome.message, rotation.kind, rotation.message);
                }
                outcome
            }
            _ => outcome,
        }
    }

    /// Everything after the stack is down: unpack, apply, verify, roll back
    async fn restore_stopped(&self, archive: &Path, was_running: bool, mut log: StageLog) -> Outcome {
        let staging = self.config.staging_dir();
        let scratch = match fs::create_dir_all(&staging).and_then(|_| {
            tempfile::Builder::new()
                .prefix("restore-")
                .tempdir_in(&staging)
        }) {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .abort(
                        OutcomeKind::PreconditionInvalid,
                        format!("Cannot create scratch directory: {}", e),
                        was_running,
                        log,
                    )
                    .await
            }
        };

        let started = Instant::now();
        let located = unpack(archive, scratch.path())
            .and_then(|_| locate_members(scratch.path(), &self.config.project, archive));
        let members = match located {
            Ok((manifest, members)) => {
                let from = manifest
                    .map(|m| format!(" (project {} at {})", m.project, m.created_at))
                    .unwrap_or_default();
                log.record(
                    "extract",
                    None,
                    started.elapsed(),
                    format!("{} volume archive(s){}", members.len(), from),
                );
                members
            }
            Err(e) => {
                log.record("extract", None, started.elapsed(), format!("failed: {}", e));
                let kind = match e {
                    ArchiveError::ContentInvalid(_) | ArchiveError::Manifest(_) => {
                        OutcomeKind::ArchiveContentInvalid
                    }
                    _ => OutcomeKind::ArchiveCorrupt,
                };
                return self.abort(kind, e.to_string(), was_running, log).await;
            }
        };

        self.log_untouched(&members, &mut log).await;

        let mut applied = Vec::new();
        for member in &members {
            let started = Instant::now();
            match self.apply(member, &mut applied).await {
                Ok(note) => log.record(format!("apply {}", member.volume), None, started.elapsed(), note),
                Err(e) => {
                    log.record(
                        format!("apply {}", member.volume),
                        None,
                        started.elapsed(),
                        format!("failed: {}", e),
                    );
                    return self
                        .rollback(&applied, format!("Applying {} failed: {}", member.volume, e), log)
                        .await;
                }
            }
        }

        let safety_copies: Vec<String> = applied.iter().filter_map(|a| a.safety_copy.clone()).collect();

        let status = stack::resume(self.config, self.driver, self.health, &mut log).await;
        if status.is_healthy() {
            return Outcome::new(
                OutcomeKind::Restored,
                format!(
                    "Restored {} volume(s) from {}",
                    members.len(),
                    archive.display()
                ),
                log,
            )
            .with_artifacts(safety_copies);
        }

        self.rollback(&applied, format!("Restored stack is {}", status), log)
            .await
    }

    /// Stop before any volume was touched: bring the stack back if it ran
    async fn abort(&self, kind: OutcomeKind, message: String, was_running: bool, mut log: StageLog) -> Outcome {
        if was_running {
            let status = stack::resume(self.config, self.driver, self.health, &mut log).await;
            if !status.is_healthy() {
                return Outcome::new(kind, format!("{}; the stack is {} after resuming", message, status), log);
            }
        }
        Outcome::new(kind, message, log)
    }

    async fn log_untouched(&self, members: &[VolumeMember], log: &mut StageLog) {
        let prefix = format!("{}_", self.config.project);
        let live = match self.driver.list_volumes(&prefix).await {
            Ok(live) => live,
            Err(e) => {
                tracing::debug!(error = %e, "Could not list live volumes");
                return;
            }
        };

        let untouched: Vec<String> = live
            .into_iter()
            .filter(|v| !is_safety_copy(v) && !members.iter().any(|m| &m.volume == v))
            .collect();
        if !untouched.is_empty() {
            tracing::info!(volumes = ?untouched, "Live volumes absent from the archive are left as they are");
            log.record("untouched", None, std::time::Duration::ZERO, untouched.join(", "));
        }
    }

    /// Replace one volume with the member's contents
    async fn apply(&self, member: &VolumeMember, applied: &mut Vec<Applied>) -> Result<String, DriverError> {
        let volume = member.volume.as_str();
        let deadline = self.config.timeouts.volume_op;

        if !self.driver.volume_exists(volume).await? {
            applied.push(Applied {
                volume: volume.to_string(),
                created: true,
                ..Default::default()
            });
            self.driver.create_volume(volume, self.volume_labels(volume)).await?;
            with_deadline(deadline, self.driver.extract_into_volume(&member.path, volume)).await?;
            return Ok("created".to_string());
        }

        let copy = self.free_safety_copy_name(volume).await?;
        let mut labels = HashMap::new();
        labels.insert(SAFETY_COPY_LABEL.to_string(), volume.to_string());
        self.driver.create_volume(&copy, labels).await?;

        // An incomplete copy would pass for the newest safety copy during rotation
        if let Err(e) = with_deadline(deadline, self.driver.clone_volume(volume, &copy)).await {
            return match self.driver.remove_volume(&copy).await {
                Ok(()) => Err(e),
                Err(cleanup) => {
                    tracing::error!(volume = %copy, error = %cleanup, "Incomplete safety copy could not be removed");
                    Err(DriverError::Other(format!(
                        "{}; incomplete safety copy {} could not be removed: {}",
                        e, copy, cleanup
                    )))
                }
            };
        }

        applied.push(Applied {
            volume: volume.to_string(),
            safety_copy: Some(copy.clone()),
            replaced: true,
            created: false,
        });
        self.driver.remove_volume(volume).await?;
        self.driver.create_volume(volume, self.volume_labels(volume)).await?;
        with_deadline(deadline, self.driver.extract_into_volume(&member.path, volume)).await?;

        Ok(format!("replaced, previous contents in {}", copy))
    }

    /// `<volume>_backup_<unix>`, bumping the timestamp while the name is taken
    async fn free_safety_copy_name(&self, volume: &str) -> Result<String, DriverError> {
        let mut ts = Utc::now().timestamp();
        loop {
            let name = safety_copy_name(volume, ts);
            if !self.driver.volume_exists(&name).await? {
                return Ok(name);
            }
            ts += 1;
        }
    }

    fn volume_labels(&self, volume: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), self.config.project.clone());
        if let Some(short) = volume_short_name(&self.config.project, volume) {
            labels.insert(COMPOSE_VOLUME_LABEL.to_string(), short.to_string());
        }
        labels
    }

    /// Put the pre-restore volumes back and bring the stack up on them
    async fn rollback(&self, applied: &[Applied], reason: String, mut log: StageLog) -> Outcome {
        tracing::warn!(%reason, "Restore failed, rolling back");
        let safety_copies: Vec<String> = applied.iter().filter_map(|a| a.safety_copy.clone()).collect();

        let shutdown = ShutdownEscalator::new(self.config, self.driver).run(false).await;
        log.absorb("rollback shutdown", shutdown.stage_log);
        if !shutdown.kind.is_stopped() {
            return Outcome::new(
                OutcomeKind::RollbackFailed,
                format!("{}; rollback could not stop the stack ({})", reason, shutdown.kind),
                log,
            )
            .with_artifacts(safety_copies);
        }

        let mut errors = Vec::new();
        for entry in applied.iter().rev() {
            let started = Instant::now();
            let result = self.undo(entry).await;
            let note = match &result {
                Ok(note) => note.clone(),
                Err(e) => format!("failed: {}", e),
            };
            log.record(format!("rollback {}", entry.volume), None, started.elapsed(), note);
            if let Err(e) = result {
                errors.push(format!("{}: {}", entry.volume, e));
            }
        }

        if !errors.is_empty() {
            return Outcome::new(
                OutcomeKind::RollbackFailed,
                format!(
                    "{}; rollback failed for {}. Safety copies are kept: {}",
                    reason,
                    errors.join("; "),
                    safety_copies.join(", ")
                ),
                log,
            )
            .with_artifacts(safety_copies);
        }

        let status = stack::resume(self.config, self.driver, self.health, &mut log).await;
        let (kind, message) = if status.is_healthy() {
            (
                OutcomeKind::RolledBack,
                format!("{}; previous volumes were put back and the stack is healthy", reason),
            )
        } else {
            (
                OutcomeKind::RollbackFailed,
                format!(
                    "{}; the stack is {} after rollback. Safety copies are kept: {}",
                    reason,
                    status,
                    safety_copies.join(", ")
                ),
            )
        };
        Outcome::new(kind, message, log).with_artifacts(safety_copies)
    }

    async fn undo(&self, entry: &Applied) -> Result<String, DriverError> {
        let volume = entry.volume.as_str();

        if entry.created {
            self.driver.remove_volume(volume).await?;
            return Ok("removed (created by restore)".to_string());
        }

        match (&entry.safety_copy, entry.replaced) {
            (Some(copy), true) => {
                self.driver.remove_volume(volume).await?;
                self.driver.create_volume(volume, self.volume_labels(volume)).await?;
                with_deadline(
                    self.config.timeouts.volume_op,
                    self.driver.clone_volume(copy, volume),
                )
                .await?;
                Ok(format!("restored from {}", copy))
            }
            _ => Ok("untouched".to_string()),
        }
    }
}
