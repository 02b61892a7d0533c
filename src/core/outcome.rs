/// Operation outcomes and the stage timeline
///
/// Every component returns exactly one `Outcome`. The kind maps directly to
/// the process exit code; the stage log carries the human-readable timeline.

use std::fmt;
use std::time::Duration;

use crate::utils::format_elapsed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    StoppedGracefully,
    StoppedByKill,
    StoppedByRemoval,
    StoppedByDaemonRestart,
    SnapshotCreated,
    Restored,
    RotationComplete,
    ConfigInvalid,
    LockHeld,
    PreconditionInvalid,
    ArchiveNotFound,
    ArchiveCorrupt,
    ArchiveContentInvalid,
    NoVolumesFound,
    PartialBackupFailure,
    PostconditionInvalid,
    RotationFailed,
    RolledBack,
    RollbackFailed,
    EscalationExhausted,
    PrivilegeRequired,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::StoppedGracefully => "stopped-gracefully",
            OutcomeKind::StoppedByKill => "stopped-by-kill",
            OutcomeKind::StoppedByRemoval => "stopped-by-removal",
            OutcomeKind::StoppedByDaemonRestart => "stopped-by-daemon-restart",
            OutcomeKind::SnapshotCreated => "snapshot-created",
            OutcomeKind::Restored => "restored",
            OutcomeKind::RotationComplete => "rotation-complete",
            OutcomeKind::ConfigInvalid => "config-invalid",
            OutcomeKind::LockHeld => "lock-held",
            OutcomeKind::PreconditionInvalid => "precondition-invalid",
            OutcomeKind::ArchiveNotFound => "archive-not-found",
            OutcomeKind::ArchiveCorrupt => "archive-corrupt",
            OutcomeKind::ArchiveContentInvalid => "archive-content-invalid",
            OutcomeKind::NoVolumesFound => "no-volumes-found",
            OutcomeKind::PartialBackupFailure => "partial-backup-failure",
            OutcomeKind::PostconditionInvalid => "postcondition-invalid",
            OutcomeKind::RotationFailed => "rotation-failed",
            OutcomeKind::RolledBack => "rolled-back",
            OutcomeKind::RollbackFailed => "rollback-failed",
            OutcomeKind::EscalationExhausted => "escalation-exhausted",
            OutcomeKind::PrivilegeRequired => "privilege-required",
        }
    }

    /// Process exit code. 1 and 2 are left to internal and usage errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            OutcomeKind::StoppedGracefully
            | OutcomeKind::StoppedByKill
            | OutcomeKind::StoppedByRemoval
            | OutcomeKind::StoppedByDaemonRestart
            | OutcomeKind::SnapshotCreated
            | OutcomeKind::Restored
            | OutcomeKind::RotationComplete => 0,
            OutcomeKind::ConfigInvalid => 3,
            OutcomeKind::LockHeld => 4,
            OutcomeKind::PreconditionInvalid => 10,
            OutcomeKind::ArchiveNotFound => 11,
            OutcomeKind::ArchiveCorrupt => 12,
            OutcomeKind::ArchiveContentInvalid => 13,
            OutcomeKind::NoVolumesFound => 14,
            OutcomeKind::PartialBackupFailure => 15,
            OutcomeKind::PostconditionInvalid => 16,
            OutcomeKind::RotationFailed => 17,
            OutcomeKind::RolledBack => 20,
            OutcomeKind::RollbackFailed => 21,
            OutcomeKind::EscalationExhausted => 30,
            OutcomeKind::PrivilegeRequired => 31,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// True for the escalator's terminal states that leave the stack stopped
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            OutcomeKind::StoppedGracefully
                | OutcomeKind::StoppedByKill
                | OutcomeKind::StoppedByRemoval
                | OutcomeKind::StoppedByDaemonRestart
        )
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: String,
    pub deadline: Option<Duration>,
    pub elapsed: Duration,
    pub result: String,
}

impl fmt::Display for StageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deadline {
            Some(deadline) => write!(
                f,
                "{} [{} / deadline {}]: {}",
                self.stage,
                format_elapsed(self.elapsed),
                format_elapsed(deadline),
                self.result
            ),
            None => write!(f, "{} [{}]: {}", self.stage, format_elapsed(self.elapsed), self.result),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageLog {
    records: Vec<StageRecord>,
}

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and emit it on the log stream
    pub fn record(
        &mut self,
        stage: impl Into<String>,
        deadline: Option<Duration>,
        elapsed: Duration,
        result: impl Into<String>,
    ) {
        let record = StageRecord {
            stage: stage.into(),
            deadline,
            elapsed,
            result: result.into(),
        };
        tracing::info!(
            stage = %record.stage,
            elapsed_ms = record.elapsed.as_millis() as u64,
            deadline_ms = record.deadline.map(|d| d.as_millis() as u64),
            "{}",
            record.result
        );
        self.records.push(record);
    }

    /// Fold a nested component's timeline in, prefixing its stage names
    pub fn absorb(&mut self, prefix: &str, other: StageLog) {
        self.records.extend(other.records.into_iter().map(|mut r| {
            r.stage = format!("{} > {}", prefix, r.stage);
            r
        }));
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub message: String,
    pub stage_log: StageLog,
    /// Files or volumes the operation produced (archive path, safety copies)
    pub artifacts: Vec<String>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, message: impl Into<String>, stage_log: StageLog) -> Self {
        Self {
            kind,
            message: message.into(),
            stage_log,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_for_failures() {
        let failures = [
            OutcomeKind::ConfigInvalid,
            OutcomeKind::LockHeld,
            OutcomeKind::PreconditionInvalid,
            OutcomeKind::ArchiveNotFound,
            OutcomeKind::ArchiveCorrupt,
            OutcomeKind::ArchiveContentInvalid,
            OutcomeKind::NoVolumesFound,
            OutcomeKind::PartialBackupFailure,
            OutcomeKind::PostconditionInvalid,
            OutcomeKind::RotationFailed,
            OutcomeKind::RolledBack,
            OutcomeKind::RollbackFailed,
            OutcomeKind::EscalationExhausted,
            OutcomeKind::PrivilegeRequired,
        ];
        let mut codes: Vec<u8> = failures.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), failures.len());
        assert!(codes.iter().all(|&c| c > 2));
    }

    #[test]
    fn test_stopped_states() {
        assert!(OutcomeKind::StoppedByKill.is_stopped());
        assert!(OutcomeKind::StoppedByKill.is_success());
        assert!(!OutcomeKind::EscalationExhausted.is_stopped());
        assert!(!OutcomeKind::RolledBack.is_success());
        assert_eq!(OutcomeKind::RollbackFailed.to_string(), "rollback-failed");
    }

    #[test]
    fn test_stage_log_absorb() {
        let mut inner = StageLog::new();
        inner.record("1 graceful", Some(Duration::from_secs(15)), Duration::from_millis(40), "ok");

        let mut outer = StageLog::new();
        outer.record("health", None, Duration::ZERO, "healthy");
        outer.absorb("shutdown", inner);

        assert_eq!(outer.len(), 2);
        assert_eq!(outer.records()[1].stage, "shutdown > 1 graceful");
        assert_eq!(
            outer.records()[1].to_string(),
            "shutdown > 1 graceful [40ms / deadline 15.0s]: ok"
        );
    }
}
