//! # Service Orchestration
//!
//! Lifecycle management for a fixed set of interdependent services.
//!
//! Each service is a [`ServiceLifecycle`] wrapping a [`ServiceDriver`] that
//! knows how to initialize, upgrade, launch and probe it. The
//! [`Orchestrator`] starts them in order, waiting for each to become ready
//! before the next, and stops them in reverse.
//!
//! ## Example
//!
//! ```rust,no_run
//! use service_orchestration::{Orchestrator, ServiceDriver, ServiceLifecycle};
//! use std::sync::Arc;
//!
//! # async fn example(drivers: Vec<Arc<dyn ServiceDriver>>) -> service_orchestration::Result<()> {
//! let services = drivers
//!     .into_iter()
//!     .map(|driver| ServiceLifecycle::new(driver, "/srv/backup"))
//!     .collect();
//! let mut orchestrator = Orchestrator::new(services)?;
//! orchestrator.start_all().await?;
//! // ... run until signalled ...
//! orchestrator.stop_all().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod error;
pub mod health;
pub mod lifecycle;
pub mod marker;
pub mod orchestrator;
pub mod pidfile;
pub mod probes;
pub mod respawn;
pub mod state;
pub mod supervisor;

pub use error::{Error, Result};
pub use health::{Readiness, ReadinessPoller, ReadinessProbe, Sleeper, TimerSleeper};
pub use lifecycle::{
    DEFAULT_STOP_GRACE, Launched, ReadinessCheck, ServiceDriver, ServiceLifecycle, stop_process,
};
pub use marker::{MarkerStatus, MigrationRule, VersionMarker, upgrade_with_backup};
pub use orchestrator::Orchestrator;
pub use pidfile::{PidFileOutcome, PidKiller, SignalKiller, cleanup_stale_pid_file};
pub use probes::{HealthStatusProbe, VersionProbe};
pub use respawn::{RespawningHandle, Spawn};
pub use state::{ServiceState, StateChange};
pub use supervisor::{Liveness, TaskStatus, TaskSupervisor};
