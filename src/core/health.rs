/// Health checking for the retrieval stack
///
/// The engine exposes a health endpoint returning a fixed JSON body when it
/// is serving. The controller only ever sees the tri-state result.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config::HealthSettings;
use crate::utils::HEALTHY_BODY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unreachable => "unreachable",
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthValidator: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

pub struct HttpHealthValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthValidator {
    pub fn new(settings: &HealthSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("ragctl/{}", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: settings.url.clone(),
        })
    }
}

#[async_trait]
impl HealthValidator for HttpHealthValidator {
    async fn check(&self) -> HealthStatus {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Health endpoint unreachable");
                return HealthStatus::Unreachable;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Health endpoint returned an error status");
            return HealthStatus::Unhealthy;
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) if is_healthy_body(&body) => HealthStatus::Healthy,
            Ok(body) => {
                tracing::debug!(%body, "Unexpected health body");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                tracing::debug!(error = %e, "Health body is not JSON");
                HealthStatus::Unhealthy
            }
        }
    }
}

fn is_healthy_body(body: &serde_json::Value) -> bool {
    serde_json::from_str::<serde_json::Value>(HEALTHY_BODY)
        .map(|expected| &expected == body)
        .unwrap_or(false)
}

/// Poll until healthy or until `wait` runs out; returns the last status seen.
///
/// A zero `wait` performs exactly one check.
pub async fn wait_for_health(
    validator: &dyn HealthValidator,
    wait: Duration,
    interval: Duration,
) -> HealthStatus {
    let started = Instant::now();
    loop {
        let status = validator.check().await;
        if status.is_healthy() || started.elapsed() + interval > wait {
            return status;
        }
        tracing::debug!(%status, "Stack not healthy yet, polling again");
        tokio::time::sleep(interval).await;
    }
}
