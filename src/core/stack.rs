//! Stack-level steps shared by snapshot and restore

use tokio::time::Instant;

use crate::core::config::ControllerConfig;
use crate::core::health::{wait_for_health, HealthStatus, HealthValidator};
use crate::core::outcome::StageLog;
use crate::core::runtime::{with_deadline, DriverError, RuntimeDriver};

/// Whether any unit of the project is running
pub async fn is_running(config: &ControllerConfig, driver: &dyn RuntimeDriver) -> Result<bool, DriverError> {
    let units = with_deadline(
        config.timeouts.gather,
        driver.list_units(&config.project, false),
    )
    .await?;
    Ok(!units.is_empty())
}

/// Bring the stack up and wait for it to report healthy.
///
/// A failed bring-up counts as unreachable.
pub async fn resume(
    config: &ControllerConfig,
    driver: &dyn RuntimeDriver,
    health: &dyn HealthValidator,
    log: &mut StageLog,
) -> HealthStatus {
    let deadline = config.timeouts.bringup;
    let started = Instant::now();
    if let Err(e) = with_deadline(deadline, driver.start_stack(&config.project)).await {
        tracing::error!(error = %e, "Stack bring-up failed");
        log.record("bring-up", Some(deadline), started.elapsed(), format!("failed: {}", e));
        return HealthStatus::Unreachable;
    }
    log.record("bring-up", Some(deadline), started.elapsed(), "started");

    let started = Instant::now();
    let status = wait_for_health(health, config.health.wait, config.health.interval).await;
    log.record("health", Some(config.health.wait), started.elapsed(), status.to_string());
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::health::MockHealthValidator;
    use crate::core::testing::{test_config, Behavior, FakeRuntime};
    use std::path::Path;

    #[tokio::test]
    async fn test_failed_bringup_skips_health_check() {
        let config = test_config(Path::new("/tmp"));
        let fake = FakeRuntime::stopped(&["engine"]);
        fake.knobs().start_stack = Behavior::Fail;
        let mut health = MockHealthValidator::new();
        health.expect_check().times(0);

        let mut log = StageLog::new();
        let status = resume(&config, &fake, &health, &mut log).await;

        assert_eq!(status, HealthStatus::Unreachable);
        assert_eq!(log.len(), 1);
        assert!(!is_running(&config, &fake).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_reports_health() {
        let config = test_config(Path::new("/tmp"));
        let fake = FakeRuntime::stopped(&["engine"]);
        let mut health = MockHealthValidator::new();
        health.expect_check().times(1).returning(|| HealthStatus::Healthy);

        let mut log = StageLog::new();
        assert_eq!(resume(&config, &fake, &health, &mut log).await, HealthStatus::Healthy);
        assert!(is_running(&config, &fake).await.unwrap());
    }
}
