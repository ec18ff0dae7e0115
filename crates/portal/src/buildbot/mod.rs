//! Buildbot master and workers
//!
//! Buildbot daemonizes itself (`buildbot start master` returns once the
//! master is up), so everything here is a short-lived CLI invocation run
//! from the Buildbot state directory. Master and workers leave a
//! `twistd.pid` behind when they crash; [`Buildbot::pid_files`] lists them
//! for cleanup before each start.

pub mod config;

pub use config::{ConfigGenerator, MasterSettings, Worker, parse_workers};

use crate::gerrit::Project;
use crate::{Error, Result};
use command_executor::relay::colors;
use command_executor::{Command, Launcher, OutputRelay};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Controls one Buildbot installation through its CLI
pub struct Buildbot {
    workdir: PathBuf,
    bin: PathBuf,
    worker_bin: PathBuf,
    generator: ConfigGenerator,
    workers: Vec<Worker>,
    launcher: Arc<dyn Launcher>,
}

impl Buildbot {
    /// Installation rooted at `workdir`, using the sandbox binaries
    pub fn new(
        workdir: impl Into<PathBuf>,
        settings: MasterSettings,
        workers: Vec<Worker>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let workdir = workdir.into();
        let bin_dir = workdir.join("sandbox").join("bin");
        Self {
            bin: bin_dir.join("buildbot"),
            worker_bin: bin_dir.join("buildbot-worker"),
            generator: ConfigGenerator::new(settings, workers.clone()),
            workdir,
            workers,
            launcher,
        }
    }

    /// State directory
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Private key of the `buildbot` Gerrit account
    pub fn identity_file(&self) -> &Path {
        &self.generator.settings().identity_file
    }

    /// Path of the generated master configuration
    pub fn master_config_path(&self) -> PathBuf {
        self.workdir.join("master").join("master.cfg")
    }

    /// Trimmed public half of the identity key pair
    pub fn public_key(&self) -> Result<String> {
        let path = public_key_path(self.identity_file());
        let key = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("reading {}: {}", path.display(), e)))?;
        Ok(key.trim().to_string())
    }

    fn command(&self, program: &Path) -> Command {
        Command::builder(program).current_dir(&self.workdir).build()
    }

    /// Run to completion and log the combined output under `display`
    async fn run_logged(&self, command: Command, shown: String) -> Result<String> {
        let result = self.launcher.output(command).await?;
        info!("{}\n{}", shown, result.output);
        if !result.success() {
            return Err(command_executor::Error::ProcessExited {
                command: shown,
                code: result.status.code,
                output: result.output,
            }
            .into());
        }
        Ok(result.output)
    }

    async fn run(&self, command: Command) -> Result<String> {
        let display = command.to_string();
        self.run_logged(command, display).await
    }

    /// Create the Python sandbox and the master directory
    ///
    /// With `wheels` set, packages are installed from that directory only.
    pub async fn init_sandbox(&self, wheels: Option<&Path>) -> Result<()> {
        let relay = || OutputRelay::new("B", colors::BLUE);
        let venv = Command::builder("python3")
            .args(["-m", "venv", "sandbox"])
            .current_dir(&self.workdir)
            .build();
        self.launcher.run(venv, relay()).await?;

        let pip = self.workdir.join("sandbox").join("bin").join("pip");
        let mut upgrade = self.command(&pip);
        upgrade.args(["install", "--upgrade", "pip"]);
        self.launcher.run(upgrade, relay()).await?;

        let mut install = self.command(&pip);
        install.arg("install");
        if let Some(wheels) = wheels {
            install
                .arg("--no-index")
                .arg(format!("--find-links={}", wheels.display()));
        }
        install.args(["wheel", "buildbot[bundle]", "buildbot-www-react", "txrequests"]);
        self.launcher.run(install, relay()).await?;

        let mut create = self.command(&self.bin);
        create.args(["create-master", "master"]);
        self.launcher.run(create, relay()).await?;
        Ok(())
    }

    /// Replace the identity key pair with a fresh ed25519 one
    pub async fn generate_ssh_key(&self) -> Result<()> {
        let private = self.identity_file().to_path_buf();
        if let Some(dir) = private.parent() {
            create_private_dir(dir)?;
        }
        for path in [private.clone(), public_key_path(&private)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let keygen = Command::builder("ssh-keygen")
            .args(["-t", "ed25519", "-f"])
            .arg(&private)
            .args(["-N", "", "-q"])
            .build();
        self.launcher
            .run(keygen, OutputRelay::new("B", colors::BLUE))
            .await?;
        Ok(())
    }

    /// Output of `buildbot --version`
    pub async fn version(&self) -> Result<String> {
        let mut cmd = self.command(&self.bin);
        cmd.arg("--version");
        self.run(cmd).await
    }

    /// Binaries and key files a start needs
    pub fn check_installation(&self) -> Result<()> {
        let identity = self.identity_file();
        for path in [
            self.bin.clone(),
            self.worker_bin.clone(),
            identity.to_path_buf(),
            public_key_path(identity),
        ] {
            if !path.exists() {
                return Err(Error::config(format!("{} does not exist", path.display())));
            }
        }
        Ok(())
    }

    /// Fail if a worker's directory exists but is not a directory
    pub fn check_worker_dirs(&self) -> Result<()> {
        for worker in &self.workers {
            let dir = self.workdir.join(&worker.name);
            match std::fs::metadata(&dir) {
                Ok(metadata) if !metadata.is_dir() => {
                    return Err(Error::config(format!(
                        "--buildbot-workers: '{}' is not a directory",
                        dir.display()
                    )));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove every worker directory
    pub fn purge_workers(&self) -> Result<()> {
        for worker in &self.workers {
            let dir = self.workdir.join(&worker.name);
            info!("rm -rf {}", dir.display());
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// `buildbot-worker create-worker` for every worker
    pub async fn create_workers(&self) -> Result<()> {
        let master = self.generator.settings().master_address();
        for worker in &self.workers {
            let mut cmd = self.command(&self.worker_bin);
            cmd.args([
                "create-worker",
                worker.name.as_str(),
                master.as_str(),
                worker.name.as_str(),
                worker.password.as_str(),
            ]);
            let display = format!(
                "{} create-worker {} {} {} <passwd>",
                self.worker_bin.display(),
                worker.name,
                master,
                worker.name
            );
            self.run_logged(cmd, display).await?;
        }
        Ok(())
    }

    /// Write `master.cfg` for `projects`
    ///
    /// The file is written next to its final location and renamed into
    /// place, so a reader never sees partial content.
    pub fn write_config(&self, projects: &[Project]) -> Result<()> {
        let text = self.generator.generate(projects);
        let path = self.master_config_path();
        let dir = path
            .parent()
            .ok_or_else(|| Error::config(format!("{} has no parent", path.display())))?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(text.as_bytes())?;
        file.persist(&path).map_err(|e| Error::Io(e.error))?;
        set_mode(&path, 0o600)?;
        debug!("wrote {} ({} projects)", path.display(), projects.len());
        Ok(())
    }

    /// `buildbot checkconfig master`
    pub async fn check_config(&self) -> Result<()> {
        let mut cmd = self.command(&self.bin);
        cmd.args(["checkconfig", "master"]);
        self.run(cmd).await?;
        Ok(())
    }

    /// Regenerate the configuration and validate it
    pub async fn rewrite_config(&self, projects: &[Project]) -> Result<()> {
        self.write_config(projects)?;
        self.check_config().await
    }

    /// `twistd.pid` of the master and of every worker
    pub fn pid_files(&self) -> Vec<PathBuf> {
        std::iter::once("master")
            .chain(self.workers.iter().map(|w| w.name.as_str()))
            .map(|node| self.workdir.join(node).join("twistd.pid"))
            .collect()
    }

    /// `buildbot start master`
    pub async fn start_master(&self) -> Result<()> {
        let mut cmd = self.command(&self.bin);
        cmd.args(["start", "master"]);
        self.run(cmd).await?;
        Ok(())
    }

    /// Start every worker; on failure stop the ones already started, newest first
    pub async fn start_workers(&self) -> Result<()> {
        for (i, worker) in self.workers.iter().enumerate() {
            let mut cmd = self.command(&self.worker_bin);
            cmd.args(["start", worker.name.as_str()]);
            if let Err(e) = self.run(cmd).await {
                for started in self.workers[..i].iter().rev() {
                    if let Err(e) = self.stop_worker(&started.name).await {
                        warn!("{}", e);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Full start: recreate workers, write the configuration for
    /// `projects`, then bring up the master and the workers
    pub async fn start(&self, projects: &[Project]) -> Result<()> {
        self.check_worker_dirs()?;
        self.purge_workers()?;
        self.check_installation()?;
        self.version().await?;
        self.create_workers().await?;
        self.rewrite_config(projects).await?;
        self.start_master().await?;
        if let Err(e) = self.start_workers().await {
            if let Err(stop) = self.stop_master().await {
                warn!("{}", stop);
            }
            return Err(e);
        }
        Ok(())
    }

    /// `buildbot restart master`
    pub async fn restart(&self) -> Result<()> {
        let mut cmd = self.command(&self.bin);
        cmd.args(["restart", "master"]);
        self.run(cmd).await?;
        Ok(())
    }

    async fn stop_master(&self) -> Result<()> {
        let mut cmd = self.command(&self.bin);
        cmd.args(["stop", "master"]);
        self.run(cmd).await?;
        Ok(())
    }

    async fn stop_worker(&self, name: &str) -> Result<()> {
        let mut cmd = self.command(&self.worker_bin);
        cmd.args(["stop", name]);
        self.run(cmd).await?;
        Ok(())
    }

    /// Stop the master, then every worker; the first error wins
    pub async fn stop(&self) -> Result<()> {
        let mut result = self.stop_master().await;
        for worker in &self.workers {
            if let Err(e) = self.stop_worker(&worker.name).await {
                if result.is_ok() {
                    result = Err(e);
                } else {
                    warn!("{}", e);
                }
            }
        }
        result
    }
}

fn public_key_path(private: &Path) -> PathBuf {
    let mut path = private.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Create `dir` (and parents) readable only by the owner
pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    set_mode(dir, 0o700)
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
