//! Service lifecycle states
//!
//! ```text
//! Unstarted ─► Initializing ─► Starting ─► Polling ─► Ready
//!     └──────────────────────────┘             │
//!              Initializing|Starting|Polling ──┴─► Error
//! any ─► Stopping ─► Stopped ─► (Initializing|Starting)
//! ```
//!
//! `Error` absorbs every forward transition; the only way out is
//! `Stopping`, which cleanup must always be able to reach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    /// Nothing has happened yet
    Unstarted,
    /// Running one-shot initialization or upgrade
    Initializing,
    /// Long-running process is being launched
    Starting,
    /// Waiting for the readiness probe
    Polling,
    /// Usable by dependents
    Ready,
    /// Shutdown in progress
    Stopping,
    /// Shut down
    Stopped,
    /// A step failed
    Error,
}

impl ServiceState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (self, next) {
            (_, Stopping) => self != Stopping && self != Stopped,
            (Unstarted | Stopped, Initializing | Starting) => true,
            (Initializing, Starting) => true,
            (Starting, Polling) => true,
            (Polling, Ready) => true,
            (Initializing | Starting | Polling, Error) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// Whether the service has a process that may need stopping
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceState::Initializing
                | ServiceState::Starting
                | ServiceState::Polling
                | ServiceState::Ready
                | ServiceState::Error
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unstarted => "unstarted",
            ServiceState::Initializing => "initializing",
            ServiceState::Starting => "starting",
            ServiceState::Polling => "polling",
            ServiceState::Ready => "ready",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A recorded state change, published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// Service name
    pub service: String,
    /// Previous state
    pub from: ServiceState,
    /// New state
    pub to: ServiceState,
    /// When the change happened
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ServiceState::*;
    use super::*;

    #[test]
    fn test_forward_path() {
        assert!(Unstarted.can_transition_to(Initializing));
        assert!(Unstarted.can_transition_to(Starting));
        assert!(Initializing.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Polling));
        assert!(Polling.can_transition_to(Ready));
        assert!(Stopped.can_transition_to(Starting));
    }

    #[test]
    fn test_no_shortcuts_to_ready() {
        assert!(!Unstarted.can_transition_to(Ready));
        assert!(!Starting.can_transition_to(Ready));
        assert!(!Initializing.can_transition_to(Polling));
    }

    #[test]
    fn test_error_is_absorbing_except_for_stop() {
        for state in [Initializing, Starting, Polling] {
            assert!(state.can_transition_to(Error));
        }
        assert!(!Ready.can_transition_to(Error));
        assert!(!Unstarted.can_transition_to(Error));

        for next in [Unstarted, Initializing, Starting, Polling, Ready, Stopped] {
            assert!(!Error.can_transition_to(next), "error -> {next}");
        }
        assert!(Error.can_transition_to(Stopping));
    }

    #[test]
    fn test_stopping_reachable_from_active_states() {
        for state in [Unstarted, Initializing, Starting, Polling, Ready, Error] {
            assert!(state.can_transition_to(Stopping), "{state} -> stopping");
        }
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }
}
