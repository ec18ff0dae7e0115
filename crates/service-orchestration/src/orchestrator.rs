//! Ordered startup and reverse-order shutdown
//!
//! The [`Orchestrator`] holds every [`ServiceLifecycle`] in a fixed total
//! order consistent with their dependencies. Services are started one at a
//! time and each must be ready before the next begins. If any of them fails,
//! everything already started is stopped in reverse before the failure is
//! returned.

use crate::lifecycle::ServiceLifecycle;
use crate::state::ServiceState;
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::{error, info, warn};

/// Starts services in order and stops them in reverse
pub struct Orchestrator {
    services: Vec<ServiceLifecycle>,
    /// Indices in the order services began starting
    started: Vec<usize>,
}

impl Orchestrator {
    /// Orchestrate `services` in the given order
    ///
    /// Names must be unique and every declared predecessor must appear
    /// earlier in the list.
    pub fn new(services: Vec<ServiceLifecycle>) -> Result<Self> {
        let mut seen = HashSet::new();
        for service in &services {
            for dependency in service.depends_on() {
                if !seen.contains(dependency.as_str()) {
                    return Err(Error::Config(format!(
                        "{} depends on {}, which is not started before it",
                        service.name(),
                        dependency
                    )));
                }
            }
            if !seen.insert(service.name().to_string()) {
                return Err(Error::Config(format!(
                    "service {} is listed twice",
                    service.name()
                )));
            }
        }
        Ok(Self {
            services,
            started: Vec::new(),
        })
    }

    /// Start every service in order, rolling back on the first failure
    pub async fn start_all(&mut self) -> Result<()> {
        for index in 0..self.services.len() {
            if let Err(e) = self.start_one(index).await {
                let name = self.services[index].name().to_string();
                error!("Failed to start {}: {}", name, e);
                if let Err(stop_error) = self.stop_all().await {
                    warn!("Rollback after {} failed was incomplete: {}", name, stop_error);
                }
                return Err(Error::startup_failed(name, e));
            }
        }
        info!("All services are ready");
        Ok(())
    }

    async fn start_one(&mut self, index: usize) -> Result<()> {
        for dependency in self.services[index].depends_on() {
            let state = self.state_of(&dependency);
            if state != Some(ServiceState::Ready) {
                return Err(Error::Config(format!(
                    "{} cannot start while {} is {}",
                    self.services[index].name(),
                    dependency,
                    state.map_or_else(|| "unknown".to_string(), |s| s.to_string())
                )));
            }
        }

        let service = &mut self.services[index];
        info!("Starting {}...", service.name());
        // Recorded first: a start that is dropped midway must still be stopped
        self.started.push(index);
        if let Err(e) = service.start().await {
            self.started.pop();
            return Err(e);
        }

        let service = &mut self.services[index];
        if let Err(e) = service.await_ready().await {
            // The service has already released its own process
            self.started.pop();
            return Err(e);
        }
        info!("{} is ready", service.name());
        Ok(())
    }

    /// Stop started services in reverse start order
    ///
    /// Every service is attempted even if an earlier stop fails; the first
    /// failure is returned.
    pub async fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(index) = self.started.pop() {
            let service = &mut self.services[index];
            info!("Stopping {}...", service.name());
            if let Err(e) = service.stop().await {
                warn!("Failed to stop {}: {}", service.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every service and its current state, in start order
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    /// State of the named service
    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.state())
    }

    /// Mutable access to the named service
    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceLifecycle> {
        self.services.iter_mut().find(|s| s.name() == name)
    }
}
