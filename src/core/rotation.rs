/// Safety-copy rotation
///
/// Groups `<volume>_backup_<unix>` volumes by origin, keeps the newest N of
/// each group and deletes the rest once the decider approves.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use tokio::time::Instant;

use crate::core::config::ControllerConfig;
use crate::core::outcome::{Outcome, OutcomeKind, StageLog};
use crate::core::runtime::{DriverError, RuntimeDriver};
use crate::utils::{format_timestamp, parse_safety_copy};

/// Approves deleting the excess safety copies of one group
pub trait RotationDecider: Send + Sync {
    fn approve(&self, stem: &str, excess: &[String]) -> bool;
}

impl<F> RotationDecider for F
where
    F: Fn(&str, &[String]) -> bool + Send + Sync,
{
    fn approve(&self, stem: &str, excess: &[String]) -> bool {
        self(stem, excess)
    }
}

/// Non-interactive approval (`--yes`)
pub struct AutoApprove;

impl RotationDecider for AutoApprove {
    fn approve(&self, _stem: &str, _excess: &[String]) -> bool {
        true
    }
}

/// Ask on the terminal, defaulting to no
pub struct TerminalPrompt;

impl RotationDecider for TerminalPrompt {
    fn approve(&self, stem: &str, excess: &[String]) -> bool {
        println!("\nSafety copies of {} beyond the retention limit:", stem);
        for name in excess {
            let when = parse_safety_copy(name)
                .map(|(_, ts)| format_timestamp(ts))
                .unwrap_or_default();
            println!("  {}  {}", name, when);
        }
        print!("Delete these {} volume(s)? [y/N] ", excess.len());
        let _ = io::stdout().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub stem: String,
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub declined: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub groups: Vec<GroupReport>,
}

impl RotationReport {
    pub fn deleted(&self) -> usize {
        self.groups.iter().map(|g| g.deleted.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.groups.iter().map(|g| g.failed.len()).sum()
    }
}

impl fmt::Display for RotationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let declined: usize = self.groups.iter().map(|g| g.declined.len()).sum();
        write!(
            f,
            "{} group(s), {} deleted, {} failed, {} declined",
            self.groups.len(),
            self.deleted(),
            self.failed(),
            declined
        )
    }
}

pub struct Rotator<'a> {
    config: &'a ControllerConfig,
    driver: &'a dyn RuntimeDriver,
    decider: &'a dyn RotationDecider,
}

impl<'a> Rotator<'a> {
    pub fn new(
        config: &'a ControllerConfig,
        driver: &'a dyn RuntimeDriver,
        decider: &'a dyn RotationDecider,
    ) -> Self {
        Self { config, driver, decider }
    }

    /// Rotate with the given retention; `None` keeps everything
    pub async fn run(&self, retention: Option<usize>) -> Outcome {
        let mut log = StageLog::new();

        let retention = match retention {
            None => {
                return Outcome::new(
                    OutcomeKind::RotationComplete,
                    "No retention configured; every safety copy is kept",
                    log,
                )
            }
            Some(0) => {
                return Outcome::new(OutcomeKind::ConfigInvalid, "Retention must be at least 1", log)
            }
            Some(n) => n,
        };

        let started = Instant::now();
        match self.rotate(retention).await {
            Ok(report) => {
                log.record("rotation", None, started.elapsed(), report.to_string());
                let deleted = report.groups.iter().flat_map(|g| g.deleted.clone()).collect();
                let kind = if report.failed() > 0 {
                    OutcomeKind::RotationFailed
                } else {
                    OutcomeKind::RotationComplete
                };
                let mut message = format!("Rotation finished: {}", report);
                for (name, error) in report.groups.iter().flat_map(|g| &g.failed) {
                    message.push_str(&format!("\n  {}: {}", name, error));
                }
                Outcome::new(kind, message, log).with_artifacts(deleted)
            }
            Err(e) => {
                log.record("rotation", None, started.elapsed(), format!("failed: {}", e));
                Outcome::new(
                    OutcomeKind::RotationFailed,
                    format!("Cannot list safety copies: {}", e),
                    log,
                )
            }
        }
    }

    pub async fn rotate(&self, retention: usize) -> Result<RotationReport, DriverError> {
        let volumes = self
            .driver
            .list_volumes(&format!("{}_", self.config.project))
            .await?;

        let mut groups: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
        for name in volumes {
            if let Some((stem, ts)) = parse_safety_copy(&name) {
                groups.entry(stem).or_default().push((ts, name));
            }
        }

        let mut report = RotationReport::default();
        for (stem, mut copies) in groups {
            copies.sort_by(|a, b| b.0.cmp(&a.0));
            let names: Vec<String> = copies.into_iter().map(|(_, name)| name).collect();

            let mut group = GroupReport {
                stem: stem.clone(),
                ..Default::default()
            };

            if names.len() <= retention {
                tracing::info!(%stem, count = names.len(), retention, "Backup group within retention, untouched");
                group.kept = names;
                report.groups.push(group);
                continue;
            }

            let (keep, excess) = names.split_at(retention);
            group.kept = keep.to_vec();

            if !self.decider.approve(&stem, excess) {
                tracing::info!(%stem, count = excess.len(), "Deletion declined");
                group.declined = excess.to_vec();
                report.groups.push(group);
                continue;
            }

            for name in excess {
                match self.driver.remove_volume(name).await {
                    Ok(()) => {
                        tracing::info!(volume = %name, "Deleted safety copy");
                        group.deleted.push(name.clone());
                    }
                    Err(e) => {
                        tracing::warn!(volume = %name, error = %e, "Failed to delete safety copy");
                        group.failed.push((name.clone(), e.to_string()));
                    }
                }
            }
            report.groups.push(group);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{test_config, FakeRuntime};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_with_copies() -> FakeRuntime {
        let fake = FakeRuntime::stopped(&["engine"]);
        fake.add_volume("rag_db", &[]);
        for ts in [1700000100, 1700000300, 1700000200] {
            fake.add_volume(&format!("rag_db_backup_{}", ts), &[]);
        }
        fake.add_volume("rag_minio_backup_1700000000", &[]);
        fake
    }

    #[tokio::test]
    async fn test_excess_is_deleted_oldest_first() {
        let config = test_config(Path::new("/tmp"));
        let fake = fake_with_copies();

        let report = Rotator::new(&config, &fake, &AutoApprove).rotate(1).await.unwrap();

        assert_eq!(report.groups.len(), 2);
        let db = &report.groups[0];
        assert_eq!(db.stem, "rag_db");
        assert_eq!(db.kept, vec!["rag_db_backup_1700000300"]);
        assert_eq!(db.deleted, vec!["rag_db_backup_1700000200", "rag_db_backup_1700000100"]);
        assert_eq!(report.groups[1].kept, vec!["rag_minio_backup_1700000000"]);
        assert!(fake.volume("rag_db").is_some());
        assert!(fake.volume("rag_db_backup_1700000100").is_none());
    }

    #[tokio::test]
    async fn test_declined_groups_are_untouched() {
        let config = test_config(Path::new("/tmp"));
        let fake = fake_with_copies();
        let asked = AtomicUsize::new(0);
        let decider = |stem: &str, excess: &[String]| {
            asked.fetch_add(1, Ordering::SeqCst);
            assert_eq!(stem, "rag_db");
            assert_eq!(excess.len(), 1);
            false
        };

        let report = Rotator::new(&config, &fake, &decider).rotate(2).await.unwrap();

        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(report.groups[0].declined, vec!["rag_db_backup_1700000100"]);
        assert_eq!(report.deleted(), 0);
        assert_eq!(fake.count("remove_volume"), 0);
    }

    #[tokio::test]
    async fn test_retention_settings() {
        let config = test_config(Path::new("/tmp"));
        let fake = fake_with_copies();
        let rotator = Rotator::new(&config, &fake, &AutoApprove);

        let outcome = rotator.run(None).await;
        assert_eq!(outcome.kind, OutcomeKind::RotationComplete);
        assert_eq!(fake.count("list_volumes"), 0);

        assert_eq!(rotator.run(Some(0)).await.kind, OutcomeKind::ConfigInvalid);

        let outcome = rotator.run(Some(2)).await;
        assert_eq!(outcome.kind, OutcomeKind::RotationComplete);
        assert_eq!(outcome.artifacts, vec!["rag_db_backup_1700000100"]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let config = test_config(Path::new("/tmp"));
        let fake = fake_with_copies();
        fake.knobs().fail_list_volumes = true;

        let outcome = Rotator::new(&config, &fake, &AutoApprove).run(Some(1)).await;

        assert_eq!(outcome.kind, OutcomeKind::RotationFailed);
        assert_ne!(outcome.exit_code(), 0);
        assert!(outcome.message.contains("daemon not responding"));
        assert_eq!(fake.count("remove_volume"), 0);
        assert_eq!(fake.volume_names().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_deletion_is_reported_per_volume() {
        let config = test_config(Path::new("/tmp"));
        let fake = fake_with_copies();
        fake.knobs().fail_remove_volume_for = Some("rag_db_backup_1700000200".to_string());

        let rotator = Rotator::new(&config, &fake, &AutoApprove);
        let report = rotator.rotate(1).await.unwrap();

        let db = &report.groups[0];
        assert_eq!(db.deleted, vec!["rag_db_backup_1700000100"]);
        assert_eq!(db.failed.len(), 1);
        assert_eq!(db.failed[0].0, "rag_db_backup_1700000200");
        assert!(fake.volume("rag_db_backup_1700000200").is_some());
        assert!(fake.volume("rag_db_backup_1700000100").is_none());

        let outcome = rotator.run(Some(1)).await;
        assert_eq!(outcome.kind, OutcomeKind::RotationFailed);
        assert_eq!(outcome.exit_code(), 17);
        assert!(outcome.message.contains("rag_db_backup_1700000200"));
        assert!(outcome.artifacts.is_empty());
    }
}
