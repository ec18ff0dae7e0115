//! # Portal
//!
//! Supervisor for the nsbox developer platform.
//!
//! The portal starts Keycloak, Redmine, Gerrit, Buildbot and httpd in
//! dependency order, each ready before the next begins, and stops them in
//! reverse on SIGINT or SIGTERM. While the platform runs, two background
//! tasks keep it wired together:
//!
//! - the [`project_watcher`] regenerates the Buildbot configuration and
//!   restarts the master whenever the Gerrit project list changes;
//! - the [`change_events`] processor follows `gerrit stream-events` and
//!   posts a note to every Redmine issue a change refers to with `Bug-Id:`.

#![warn(missing_docs)]

pub mod buildbot;
pub mod change_events;
pub mod config;
pub mod error;
pub mod gerrit;
pub mod logging;
pub mod platform;
pub mod project_watcher;
pub mod redmine;
pub mod services;
pub mod signals;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use platform::Platform;
