pub mod archive;
pub mod config;
pub mod docker;
pub mod escalator;
pub mod health;
pub mod lock;
pub mod outcome;
pub mod restore;
pub mod rotation;
pub mod runtime;
pub mod snapshot;
pub mod stack;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, ControllerConfig};
pub use docker::DockerDriver;
pub use escalator::ShutdownEscalator;
pub use health::{HealthStatus, HealthValidator, HttpHealthValidator};
pub use outcome::{Outcome, OutcomeKind, StageLog};
pub use restore::Restorer;
pub use rotation::{AutoApprove, RotationDecider, Rotator, TerminalPrompt};
pub use runtime::{DriverError, RuntimeDriver, Unit};
pub use snapshot::Snapshotter;
