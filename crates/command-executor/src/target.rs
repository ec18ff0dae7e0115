//! Container targets
//!
//! A [`Container`] describes WHAT to run (image, name, mounts, network);
//! the [`ContainerRuntime`] turns it into a concrete command line which any
//! [`Launcher`](crate::Launcher) can then execute.

use crate::command::Command;
use std::collections::BTreeMap;
use std::path::Path;

/// A container invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    name: String,
    image: String,
    userns: Option<String>,
    volumes: Vec<String>,
    ports: Vec<String>,
    host_network: bool,
    add_hosts: Vec<String>,
    env: BTreeMap<String, String>,
}

impl Container {
    /// Create a named container for the given image
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            userns: None,
            volumes: Vec::new(),
            ports: Vec::new(),
            host_network: false,
            add_hosts: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Set the user namespace mode (e.g. `keep-id:uid=1000,gid=1000`)
    pub fn with_userns(mut self, mode: impl Into<String>) -> Self {
        self.userns = Some(mode.into());
        self
    }

    /// Bind-mount a host path into the container
    pub fn with_volume(mut self, host: impl AsRef<Path>, container: &str) -> Self {
        self.volumes
            .push(format!("{}:{}", host.as_ref().display(), container));
        self
    }

    /// Bind-mount a host path with mount options (e.g. `O` for overlay)
    pub fn with_volume_options(
        mut self,
        host: impl AsRef<Path>,
        container: &str,
        options: &str,
    ) -> Self {
        self.volumes.push(format!(
            "{}:{}:{}",
            host.as_ref().display(),
            container,
            options
        ));
        self
    }

    /// Publish a port (`host_addr:host_port:container_port/proto`)
    pub fn with_port(mut self, publish: impl Into<String>) -> Self {
        self.ports.push(publish.into());
        self
    }

    /// Share the host network namespace
    pub fn with_host_network(mut self) -> Self {
        self.host_network = true;
        self
    }

    /// Add a static host entry inside the container
    pub fn with_add_host(mut self, host: &str, ip: &str) -> Self {
        self.add_hosts.push(format!("{}:{}", host, ip));
        self
    }

    /// Set an environment variable inside the container
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Container name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container image
    pub fn image(&self) -> &str {
        &self.image
    }
}

/// The container runtime binary used to run, exec into and kill containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::podman()
    }
}

impl ContainerRuntime {
    /// The podman runtime
    pub fn podman() -> Self {
        Self::new("podman")
    }

    /// A runtime with a custom binary (anything podman-compatible)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `run --rm --name <name> --replace ... <image> <args>`
    ///
    /// `--replace` makes a leftover container with the same name from a
    /// crashed run go away instead of failing the start.
    pub fn run_command<I, S>(&self, container: &Container, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["run", "--rm", "--name", container.name.as_str(), "--replace"]);
        if let Some(userns) = &container.userns {
            cmd.arg(format!("--userns={}", userns));
        }
        for (key, value) in &container.env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        for volume in &container.volumes {
            cmd.arg("-v").arg(volume);
        }
        for port in &container.ports {
            cmd.arg("-p").arg(port);
        }
        if container.host_network {
            cmd.arg("--network=host");
        }
        for host in &container.add_hosts {
            cmd.arg("--add-host").arg(host);
        }
        cmd.arg(&container.image);
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        cmd
    }

    /// `exec <name> <args>` inside a running container
    pub fn exec_command<I, S>(&self, name: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec").arg(name);
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        cmd
    }

    /// `kill <name>`, forced termination by container name
    pub fn kill_command(&self, name: &str) -> Command {
        Command::builder(&self.binary).arg("kill").arg(name).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_layout() {
        let container = Container::new("keycloak", "naive.systems/box/keycloak:dev")
            .with_userns("keep-id:uid=1000,gid=1000")
            .with_volume("/work/certs", "/certs")
            .with_port("0.0.0.0:9000:9000/tcp")
            .with_add_host("nsbox.local", "127.0.0.1");
        let cmd = ContainerRuntime::podman()
            .run_command(&container, ["/home/keycloak/run", "--hostname", "nsbox.local"]);

        assert_eq!(
            cmd.to_string(),
            "podman run --rm --name keycloak --replace --userns=keep-id:uid=1000,gid=1000 \
             -v /work/certs:/certs -p 0.0.0.0:9000:9000/tcp --add-host nsbox.local:127.0.0.1 \
             naive.systems/box/keycloak:dev /home/keycloak/run --hostname nsbox.local"
        );
    }

    #[test]
    fn test_host_network_and_volume_options() {
        let container = Container::new("httpd", "img")
            .with_volume_options("/w/httpd/metadata", "/meta", "O")
            .with_host_network();
        let cmd = ContainerRuntime::podman().run_command(&container, Vec::<String>::new());
        assert_eq!(
            cmd.to_string(),
            "podman run --rm --name httpd --replace -v /w/httpd/metadata:/meta:O --network=host img"
        );
    }

    #[test]
    fn test_exec_and_kill() {
        let runtime = ContainerRuntime::podman();
        assert_eq!(
            runtime.exec_command("keycloak", ["/home/keycloak/init"]).to_string(),
            "podman exec keycloak /home/keycloak/init"
        );
        assert_eq!(runtime.kill_command("gerrit").to_string(), "podman kill gerrit");
    }
}
