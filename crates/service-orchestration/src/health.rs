//! Readiness polling for services.
//!
//! A [`ReadinessPoller`] repeatedly invokes a [`ReadinessProbe`] on a fixed
//! interval until it reports [`Readiness::Ready`]. Without an attempt bound
//! it polls forever; startup order guarantees the dependency is merely still
//! booting, so there is no sensible deadline.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a single readiness probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Readiness {
    /// Service is usable
    Ready,
    /// Service answered but is not usable yet
    NotReady(String),
    /// The probe could not reach the service
    TransportError(String),
    /// The service gave an answer that retrying will not change
    Failed(String),
}

/// Something that can tell whether a service is ready
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Run the probe once
    async fn probe(&self) -> Readiness;
}

/// Suspends the caller for a duration
///
/// Every poll loop in the supervisor sleeps through this trait so tests can
/// observe the schedule without waiting for it.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration`
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `smol::Timer`
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSleeper;

#[async_trait]
impl Sleeper for TimerSleeper {
    async fn sleep(&self, duration: Duration) {
        smol::Timer::after(duration).await;
    }
}

/// Retry-until-ready primitive
#[derive(Clone)]
pub struct ReadinessPoller {
    interval: Duration,
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ReadinessPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessPoller")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .finish()
    }
}

impl ReadinessPoller {
    /// Poll forever at the given interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            initial_delay: None,
            sleeper: Arc::new(TimerSleeper),
        }
    }

    /// Give up with [`Error::Timeout`] after this many attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Wait once before the first attempt
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Replace the sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Interval between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Attempt bound, if any
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Sleeper used between attempts
    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.sleeper.clone()
    }

    /// Probe until ready; sleeps `interval` between attempts, never after the last
    pub async fn poll_until_ready(&self, service: &str, probe: &dyn ReadinessProbe) -> Result<()> {
        if let Some(delay) = self.initial_delay {
            self.sleeper.sleep(delay).await;
        }

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match probe.probe().await {
                Readiness::Ready => {
                    info!("{} is up", service);
                    return Ok(());
                }
                Readiness::NotReady(reason) => {
                    info!("{} is not up: {}", service, reason);
                }
                Readiness::TransportError(err) => {
                    info!("{} is not up: {}", service, err);
                }
                Readiness::Failed(reason) => {
                    return Err(Error::ProbeFailed(reason));
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(Error::Timeout { attempts });
            }

            debug!("{}: attempt {} failed, retrying in {:?}", service, attempts, self.interval);
            self.sleeper.sleep(self.interval).await;
        }
    }
}

/// Fakes for exercising poll loops without real time or real services
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every requested sleep and returns immediately
    #[derive(Debug, Default)]
    pub struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        /// Create an empty recorder
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// All sleeps so far, in order
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(duration);
            // Let other tasks run, as a real timer would
            smol::future::yield_now().await;
        }
    }

    /// Replays a fixed sequence of results, then repeats the last one
    #[derive(Debug)]
    pub struct ScriptedProbe {
        script: Mutex<VecDeque<Readiness>>,
        last: Mutex<Readiness>,
        calls: Mutex<u32>,
    }

    impl ScriptedProbe {
        /// Probe returning `results` in order
        pub fn new(results: impl IntoIterator<Item = Readiness>) -> Self {
            Self {
                script: Mutex::new(results.into_iter().collect()),
                last: Mutex::new(Readiness::NotReady("script exhausted".to_string())),
                calls: Mutex::new(0),
            }
        }

        /// Probe that is ready on the first call
        pub fn ready() -> Self {
            Self::new([Readiness::Ready])
        }

        /// Number of times the probe ran
        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl ReadinessProbe for ScriptedProbe {
        async fn probe(&self) -> Readiness {
            *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            let next = self
                .script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(next) = next {
                *last = next;
            }
            last.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSleeper, ScriptedProbe};
    use super::*;

    fn not_ready(n: usize) -> Vec<Readiness> {
        (0..n)
            .map(|i| Readiness::NotReady(format!("booting {}", i)))
            .collect()
    }

    #[smol_potat::test]
    async fn test_nine_not_ready_then_ready_sleeps_nine_intervals() {
        let sleeper = RecordingSleeper::new();
        let mut script = not_ready(9);
        script.push(Readiness::Ready);
        let probe = ScriptedProbe::new(script);

        let poller = ReadinessPoller::new(Duration::from_secs(2)).with_sleeper(sleeper.clone());
        poller.poll_until_ready("gerrit", &probe).await.unwrap();

        assert_eq!(probe.calls(), 10);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(2); 9]);
    }

    #[smol_potat::test]
    async fn test_bounded_poll_times_out() {
        let sleeper = RecordingSleeper::new();
        let probe = ScriptedProbe::new([Readiness::TransportError("connection refused".into())]);

        let poller = ReadinessPoller::new(Duration::from_secs(2))
            .with_max_attempts(5)
            .with_sleeper(sleeper.clone());
        let err = poller.poll_until_ready("redmine", &probe).await.unwrap_err();

        assert!(matches!(err, Error::Timeout { attempts: 5 }));
        assert_eq!(probe.calls(), 5);
        assert_eq!(sleeper.sleeps().len(), 4);
    }

    #[smol_potat::test]
    async fn test_failed_probe_stops_polling_at_once() {
        let sleeper = RecordingSleeper::new();
        let probe = ScriptedProbe::new([
            Readiness::TransportError("connection refused".into()),
            Readiness::Failed("HTTP 422".into()),
            Readiness::Ready,
        ]);

        let poller = ReadinessPoller::new(Duration::from_secs(2))
            .with_max_attempts(5)
            .with_sleeper(sleeper.clone());
        let err = poller.poll_until_ready("redmine", &probe).await.unwrap_err();

        assert!(matches!(err, Error::ProbeFailed(ref reason) if reason == "HTTP 422"));
        assert_eq!(probe.calls(), 2);
        assert_eq!(sleeper.sleeps().len(), 1);
    }

    #[smol_potat::test]
    async fn test_initial_delay_precedes_first_attempt() {
        let sleeper = RecordingSleeper::new();
        let probe = ScriptedProbe::ready();

        let poller = ReadinessPoller::new(Duration::from_secs(2))
            .with_initial_delay(Duration::from_secs(5))
            .with_sleeper(sleeper.clone());
        poller.poll_until_ready("redmine", &probe).await.unwrap();

        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_readiness_serialization() {
        let states = [
            Readiness::Ready,
            Readiness::NotReady("3.9.4".to_string()),
            Readiness::TransportError("refused".to_string()),
            Readiness::Failed("HTTP 500".to_string()),
        ];
        for state in states {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(state, serde_json::from_str(&json).unwrap());
        }
    }
}
