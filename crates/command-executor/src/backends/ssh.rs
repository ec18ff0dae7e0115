//! SSH remote execution using the system `ssh` client

use std::path::PathBuf;

use crate::command::Command;

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// Additional `-o` options, passed in order
    options: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            options: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Add an `-o key=value` option
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// The configured host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The configured port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The configured user, if any
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The `ssh` invocation without a remote command
    ///
    /// Useful on its own for connectivity checks, where the server answers a
    /// bare session with a greeting.
    pub fn session(&self) -> Command {
        let mut ssh = Command::new("ssh");
        ssh.arg("-T");
        for option in &self.options {
            ssh.arg("-o").arg(option);
        }
        if let Some(identity) = &self.identity_file {
            ssh.arg("-i").arg(identity);
        }
        if let Some(user) = &self.user {
            ssh.arg("-l").arg(user);
        }
        if let Some(port) = self.port {
            ssh.arg("-p").arg(port.to_string());
        }
        ssh.arg(&self.host);
        ssh
    }

    /// Wrap a command so it runs on the remote host
    pub fn wrap(&self, command: &Command) -> Command {
        let mut ssh = self.session();
        ssh.arg(format_remote_command(command));
        ssh
    }
}

/// Format a command for remote execution via SSH
fn format_remote_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        cmd.get_args()
            .iter()
            .map(|arg| shell_escape(&arg.to_string_lossy())),
    );
    parts.join(" ")
}

/// Escape a string for safe inclusion in a remote shell command
fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}#~".contains(c)) {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}
