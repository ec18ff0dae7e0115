//! Runtime-agnostic process execution for managed services
//!
//! This crate provides the process layer used by the portal supervisor:
//! building commands, spawning them locally (optionally wrapped in a
//! container runtime or SSH invocation), relaying their output line by line
//! with a per-service prefix, and signalling them.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod launcher;
pub mod process;
pub mod relay;
pub mod target;

pub use backends::local::{LocalLauncher, LocalProcessHandle};
pub use backends::ssh::SshConfig;
pub use command::Command;
pub use error::{Error, Result};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus, ProcessHandle, Signal};
pub use relay::{LogSource, OutputRelay, RelaySink};
pub use target::{Container, ContainerRuntime};
