//! Backend implementations for different execution contexts
//!
//! `local` spawns processes on this host. `ssh` rewrites a command so that
//! it runs on a remote host through the system `ssh` client; the resulting
//! command is then launched locally like any other.

pub mod local;
pub mod ssh;

pub use local::{LocalLauncher, LocalProcessHandle};
pub use ssh::SshConfig;
