/// Snapshot creation
///
/// Quiesces a healthy stack, archives every project volume into one verified
/// bundle, then brings the stack back exactly as it was found.

use chrono::{Local, Utc};
use std::fs;
use std::path::Path;
use tokio::time::Instant;

use crate::core::archive::{build_bundle, ArchiveInfo, ManifestEntry, SnapshotManifest};
use crate::core::config::ControllerConfig;
use crate::core::escalator::ShutdownEscalator;
use crate::core::health::HealthValidator;
use crate::core::lock::{LockError, StackLock};
use crate::core::outcome::{Outcome, OutcomeKind, StageLog};
use crate::core::runtime::{with_deadline, RuntimeDriver};
use crate::core::stack;
use crate::utils::{archive_stem, format_bytes, is_safety_copy, is_valid_archive_name, volume_short_name};

pub struct Snapshotter<'a> {
    config: &'a ControllerConfig,
    driver: &'a dyn RuntimeDriver,
    health: &'a dyn HealthValidator,
}

impl<'a> Snapshotter<'a> {
    pub fn new(
        config: &'a ControllerConfig,
        driver: &'a dyn RuntimeDriver,
        health: &'a dyn HealthValidator,
    ) -> Self {
        Self { config, driver, health }
    }

    pub async fn run(&self, name: &str) -> Outcome {
        let mut log = StageLog::new();

        if !is_valid_archive_name(name) {
            return Outcome::new(
                OutcomeKind::PreconditionInvalid,
                format!("Invalid snapshot name {:?}; use letters, digits, '.', '_' or '-'", name),
                log,
            );
        }

        let _lock = match StackLock::acquire(&self.config.lock_path()) {
            Ok(lock) => lock,
            Err(e @ LockError::Held { .. }) => return Outcome::new(OutcomeKind::LockHeld, e.to_string(), log),
            Err(e) => return Outcome::new(OutcomeKind::PreconditionInvalid, e.to_string(), log),
        };

        // Only a healthy running stack may be snapshotted
        let started = Instant::now();
        let running = match stack::is_running(self.config, self.driver).await {
            Ok(running) => running,
            Err(e) => {
                return Outcome::new(
                    OutcomeKind::PreconditionInvalid,
                    format!("Cannot query the runtime: {}", e),
                    log,
                )
            }
        };

        let mut resume_owed = false;
        if running {
            let status = self.health.check().await;
            log.record("health", None, started.elapsed(), status.to_string());
            if !status.is_healthy() {
                return Outcome::new(
                    OutcomeKind::PreconditionInvalid,
                    format!("Stack {} is {}; refusing to snapshot", self.config.project, status),
                    log,
                );
            }

            let shutdown = ShutdownEscalator::new(self.config, self.driver).run(false).await;
            log.absorb("shutdown", shutdown.stage_log);
            if !shutdown.kind.is_stopped() {
                return Outcome::new(shutdown.kind, shutdown.message, log);
            }
            resume_owed = true;
        } else {
            log.record("health", None, started.elapsed(), "stack not running, skipped");
        }

        let captured = self.capture(name, &mut log).await;

        let resumed_healthy = if resume_owed {
            stack::resume(self.config, self.driver, self.health, &mut log)
                .await
                .is_healthy()
        } else {
            true
        };

        match captured {
            Ok(info) => {
                let artifact = info.path.display().to_string();
                let outcome = if resumed_healthy {
                    Outcome::new(
                        OutcomeKind::SnapshotCreated,
                        format!(
                            "Snapshot {} created ({}, {} volume(s))",
                            artifact,
                            format_bytes(info.size_bytes),
                            info.manifest.volumes.len()
                        ),
                        log,
                    )
                } else {
                    Outcome::new(
                        OutcomeKind::PostconditionInvalid,
                        format!(
                            "Snapshot {} is valid but the stack did not come back healthy",
                            artifact
                        ),
                        log,
                    )
                };
                outcome.with_artifacts(vec![artifact])
            }
            Err((kind, message)) => {
                let message = if resume_owed && !resumed_healthy {
                    format!("{}; the stack also did not come back healthy", message)
                } else {
                    message
                };
                Outcome::new(kind, message, log)
            }
        }
    }

    /// Archive every project volume into a bundle. Staging is always removed.
    async fn capture(&self, name: &str, log: &mut StageLog) -> Result<ArchiveInfo, (OutcomeKind, String)> {
        let prefix = format!("{}_", self.config.project);
        let volumes: Vec<String> = self
            .driver
            .list_volumes(&prefix)
            .await
            .map_err(|e| (OutcomeKind::PartialBackupFailure, format!("Cannot list volumes: {}", e)))?
            .into_iter()
            .filter(|v| !is_safety_copy(v))
            .collect();

        if volumes.is_empty() {
            return Err((
                OutcomeKind::NoVolumesFound,
                format!("No volumes prefixed {} found", prefix),
            ));
        }

        let stem = archive_stem(name, &Local::now());
        let staging = self.config.staging_dir().join(&stem);

        let result = self.stage_and_bundle(&stem, &staging, &volumes, log).await;

        if let Err(e) = fs::remove_dir_all(&staging) {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
        result
    }

    async fn stage_and_bundle(
        &self,
        stem: &str,
        staging: &Path,
        volumes: &[String],
        log: &mut StageLog,
    ) -> Result<ArchiveInfo, (OutcomeKind, String)> {
        let partial = |message: String| (OutcomeKind::PartialBackupFailure, message);

        fs::create_dir_all(staging)
            .map_err(|e| partial(format!("Cannot create {}: {}", staging.display(), e)))?;

        let deadline = self.config.timeouts.volume_op;
        let mut entries = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let file = format!("{}.tar", volume);
            let started = Instant::now();
            let result = with_deadline(deadline, self.driver.archive_volume(volume, staging, &file)).await;
            let size = fs::metadata(staging.join(&file)).map(|m| m.len());

            match (result, size) {
                (Ok(()), Ok(size_bytes)) => {
                    log.record(
                        format!("archive {}", volume),
                        Some(deadline),
                        started.elapsed(),
                        format_bytes(size_bytes),
                    );
                    entries.push(ManifestEntry {
                        volume: volume.clone(),
                        short_name: volume_short_name(&self.config.project, volume)
                            .unwrap_or(volume.as_str())
                            .to_string(),
                        file,
                        size_bytes,
                    });
                }
                (Err(e), _) => {
                    log.record(format!("archive {}", volume), Some(deadline), started.elapsed(), format!("failed: {}", e));
                    return Err(partial(format!("Archiving volume {} failed: {}", volume, e)));
                }
                (Ok(()), Err(e)) => {
                    log.record(format!("archive {}", volume), Some(deadline), started.elapsed(), format!("failed: {}", e));
                    return Err(partial(format!("Archive of volume {} is missing: {}", volume, e)));
                }
            }
        }

        let manifest = SnapshotManifest {
            project: self.config.project.clone(),
            created_at: Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            volumes: entries,
        };

        let started = Instant::now();
        match build_bundle(staging, &self.config.archive_dir(), stem, &manifest) {
            Ok(info) => {
                log.record("bundle", None, started.elapsed(), format!("verified {}", info.path.display()));
                Ok(info)
            }
            Err(e) => {
                log.record("bundle", None, started.elapsed(), format!("failed: {}", e));
                Err(partial(format!("Bundling failed: {}", e)))
            }
        }
    }
}
