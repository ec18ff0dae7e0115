//! Startup configuration
//!
//! Options come from the command line and, optionally, a YAML file. A value
//! given on the command line always wins; the file fills in the rest; the
//! built-in defaults fill in whatever is still missing. [`PortalConfig`] is
//! the validated result.

use crate::buildbot::config::{Worker, parse_workers};
use crate::{Error, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Image tag used for local development builds
pub const DEV_RELEASE_TAG: &str = "dev";

/// Command line of the `portal` binary
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "portal")]
#[command(about = "Runs and supervises the nsbox developer platform")]
#[command(version)]
pub struct Cli {
    /// Absolute path to the working directory
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Absolute path where state directories are backed up before upgrades
    /// (default: <workdir>/backup)
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Public hostname of the platform (default: nsbox.local)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Address behind the httpd reverse proxy (default: 127.0.0.1)
    #[arg(long)]
    pub bind: Option<String>,

    /// Release tag; anything but "dev" selects the published images
    #[arg(long)]
    pub release_tag: Option<String>,

    /// Keycloak image
    #[arg(long)]
    pub keycloak_image: Option<String>,

    /// Redmine image
    #[arg(long)]
    pub redmine_image: Option<String>,

    /// Gerrit image
    #[arg(long)]
    pub gerrit_image: Option<String>,

    /// httpd image
    #[arg(long)]
    pub httpd_image: Option<String>,

    /// Gerrit SSH listen address (default: 0.0.0.0:29418)
    #[arg(long)]
    pub gerrit_ssh_addr: Option<String>,

    /// Keycloak HTTPS publish address (default: 0.0.0.0:9992)
    #[arg(long)]
    pub keycloak_https_addr: Option<String>,

    /// Keycloak management publish address (default: 0.0.0.0:9000)
    #[arg(long)]
    pub keycloak_management_addr: Option<String>,

    /// Comma-separated worker names and passwords, e.g. `w1,pass1,w2,pass2`
    #[arg(long)]
    pub buildbot_workers: Option<String>,

    /// Directory of wheels to install Buildbot from instead of the package index
    #[arg(long)]
    pub buildbot_wheels: Option<PathBuf>,

    /// Seconds a service gets to exit after SIGTERM before it is killed
    #[arg(long)]
    pub stop_grace_secs: Option<u64>,

    /// YAML file supplying any option not given on the command line
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Disable colored log output
    #[arg(long)]
    pub no_color: bool,
}

/// Options read from the YAML configuration file
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// See [`Cli::workdir`]
    pub workdir: Option<PathBuf>,
    /// See [`Cli::backup_dir`]
    pub backup_dir: Option<PathBuf>,
    /// See [`Cli::hostname`]
    pub hostname: Option<String>,
    /// See [`Cli::bind`]
    pub bind: Option<String>,
    /// See [`Cli::release_tag`]
    pub release_tag: Option<String>,
    /// See [`Cli::keycloak_image`]
    pub keycloak_image: Option<String>,
    /// See [`Cli::redmine_image`]
    pub redmine_image: Option<String>,
    /// See [`Cli::gerrit_image`]
    pub gerrit_image: Option<String>,
    /// See [`Cli::httpd_image`]
    pub httpd_image: Option<String>,
    /// See [`Cli::gerrit_ssh_addr`]
    pub gerrit_ssh_addr: Option<String>,
    /// See [`Cli::keycloak_https_addr`]
    pub keycloak_https_addr: Option<String>,
    /// See [`Cli::keycloak_management_addr`]
    pub keycloak_management_addr: Option<String>,
    /// See [`Cli::buildbot_workers`]
    pub buildbot_workers: Option<String>,
    /// See [`Cli::buildbot_wheels`]
    pub buildbot_wheels: Option<PathBuf>,
    /// See [`Cli::stop_grace_secs`]
    pub stop_grace_secs: Option<u64>,
}

impl FileConfig {
    /// Parse a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }
}

/// The managed container images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    /// Keycloak image
    pub keycloak: String,
    /// Redmine image
    pub redmine: String,
    /// Gerrit image
    pub gerrit: String,
    /// httpd image
    pub httpd: String,
}

/// Default image for `service`: the local dev build, or the published image
/// for a release tag
pub fn default_image(service: &str, release_tag: &str) -> String {
    if release_tag == DEV_RELEASE_TAG {
        format!("naive.systems/box/{}:dev", service)
    } else {
        format!("ghcr.io/naivesystems/box/{}:{}", service, release_tag)
    }
}

/// Validated startup configuration
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Root working directory; every service keeps its state below it
    pub workdir: PathBuf,
    /// Where state directories are copied before an upgrade
    pub backup_dir: PathBuf,
    /// Public hostname
    pub hostname: String,
    /// Address services bind to behind the reverse proxy
    pub bind: String,
    /// Release tag
    pub release_tag: String,
    /// Container images
    pub images: Images,
    /// Gerrit SSH listen address
    pub gerrit_ssh_addr: String,
    /// Keycloak HTTPS publish address
    pub keycloak_https_addr: String,
    /// Keycloak management publish address
    pub keycloak_management_addr: String,
    /// Buildbot workers
    pub workers: Vec<Worker>,
    /// Optional local wheel directory for the Buildbot sandbox
    pub buildbot_wheels: Option<PathBuf>,
    /// Grace period between SIGTERM and forced termination
    pub stop_grace: Duration,
}

fn require_absolute(flag: &str, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::config(format!(
            "--{} {} is not an absolute path",
            flag,
            path.display()
        )));
    }
    Ok(())
}

impl PortalConfig {
    /// Merge the command line over `file`, apply defaults and validate
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let workdir = cli
            .workdir
            .clone()
            .or(file.workdir)
            .ok_or_else(|| Error::config("--workdir must be specified"))?;
        require_absolute("workdir", &workdir)?;
        if !workdir.is_dir() {
            return Err(Error::config(format!(
                "--workdir {} does not exist",
                workdir.display()
            )));
        }

        let backup_dir = cli
            .backup_dir
            .clone()
            .or(file.backup_dir)
            .unwrap_or_else(|| workdir.join("backup"));
        require_absolute("backup-dir", &backup_dir)?;
        std::fs::create_dir_all(&backup_dir)
            .map_err(|e| Error::config(format!("create {}: {}", backup_dir.display(), e)))?;

        let hostname = cli
            .hostname
            .clone()
            .or(file.hostname)
            .unwrap_or_else(|| "nsbox.local".to_string());
        if hostname.trim().is_empty() {
            return Err(Error::config("--hostname must be specified"));
        }

        let release_tag = cli
            .release_tag
            .clone()
            .or(file.release_tag)
            .unwrap_or_else(|| DEV_RELEASE_TAG.to_string());
        let image = |cli: &Option<String>, file: Option<String>, service: &str| {
            cli.clone()
                .or(file)
                .unwrap_or_else(|| default_image(service, &release_tag))
        };
        let images = Images {
            keycloak: image(&cli.keycloak_image, file.keycloak_image, "keycloak"),
            redmine: image(&cli.redmine_image, file.redmine_image, "redmine"),
            gerrit: image(&cli.gerrit_image, file.gerrit_image, "gerrit"),
            httpd: image(&cli.httpd_image, file.httpd_image, "httpd"),
        };

        let workers_list = cli
            .buildbot_workers
            .clone()
            .or(file.buildbot_workers)
            .unwrap_or_else(|| "worker,password".to_string());
        let workers = parse_workers(&workers_list)?;

        let buildbot_wheels = cli.buildbot_wheels.clone().or(file.buildbot_wheels);
        if let Some(wheels) = &buildbot_wheels {
            require_absolute("buildbot-wheels", wheels)?;
        }

        Ok(Self {
            workdir,
            backup_dir,
            hostname,
            bind: cli
                .bind
                .clone()
                .or(file.bind)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            release_tag,
            images,
            gerrit_ssh_addr: cli
                .gerrit_ssh_addr
                .clone()
                .or(file.gerrit_ssh_addr)
                .unwrap_or_else(|| "0.0.0.0:29418".to_string()),
            keycloak_https_addr: cli
                .keycloak_https_addr
                .clone()
                .or(file.keycloak_https_addr)
                .unwrap_or_else(|| "0.0.0.0:9992".to_string()),
            keycloak_management_addr: cli
                .keycloak_management_addr
                .clone()
                .or(file.keycloak_management_addr)
                .unwrap_or_else(|| "0.0.0.0:9000".to_string()),
            workers,
            buildbot_wheels,
            stop_grace: Duration::from_secs(
                cli.stop_grace_secs.or(file.stop_grace_secs).unwrap_or(10),
            ),
        })
    }

    /// Read the YAML file named on the command line, if any, then resolve
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// State directory of `service`
    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.workdir.join(service)
    }

    /// Directory holding the platform's TLS key pair
    pub fn certs_dir(&self) -> PathBuf {
        self.workdir.join("certs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_for(dir: &TempDir) -> Cli {
        Cli {
            workdir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = PortalConfig::resolve(&cli_for(&dir), FileConfig::default()).unwrap();

        assert_eq!(config.hostname, "nsbox.local");
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.backup_dir, dir.path().join("backup"));
        assert!(config.backup_dir.is_dir());
        assert_eq!(config.images.gerrit, "naive.systems/box/gerrit:dev");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].name, "worker");
        assert_eq!(config.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_release_tag_selects_published_images() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            release_tag: Some("v1.2.0".to_string()),
            httpd_image: Some("localhost/httpd:custom".to_string()),
            ..cli_for(&dir)
        };
        let config = PortalConfig::resolve(&cli, FileConfig::default()).unwrap();
        assert_eq!(config.images.keycloak, "ghcr.io/naivesystems/box/keycloak:v1.2.0");
        assert_eq!(config.images.httpd, "localhost/httpd:custom");
    }

    #[test]
    fn test_command_line_overrides_file() {
        let dir = TempDir::new().unwrap();
        let file = FileConfig::from_yaml(
            "workdir: /does/not/matter\nhostname: box.example.com\nbind: 10.0.0.5\n",
        )
        .unwrap();
        let cli = Cli {
            hostname: Some("cli.example.com".to_string()),
            ..cli_for(&dir)
        };
        let config = PortalConfig::resolve(&cli, file).unwrap();
        assert_eq!(config.hostname, "cli.example.com");
        assert_eq!(config.bind, "10.0.0.5");
        assert_eq!(config.workdir, dir.path());
    }

    #[test]
    fn test_missing_workdir() {
        let err = PortalConfig::resolve(&Cli::default(), FileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("--workdir")));
    }

    #[test]
    fn test_relative_and_nonexistent_workdir() {
        let cli = Cli {
            workdir: Some(PathBuf::from("relative/dir")),
            ..Default::default()
        };
        assert!(matches!(
            PortalConfig::resolve(&cli, FileConfig::default()),
            Err(Error::Configuration(_))
        ));

        let cli = Cli {
            workdir: Some(PathBuf::from("/definitely/not/here/nsbox")),
            ..Default::default()
        };
        let err = PortalConfig::resolve(&cli, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_relative_backup_dir() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            backup_dir: Some(PathBuf::from("backup")),
            ..cli_for(&dir)
        };
        assert!(matches!(
            PortalConfig::resolve(&cli, FileConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_hostname() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            hostname: Some(String::new()),
            ..cli_for(&dir)
        };
        assert!(matches!(
            PortalConfig::resolve(&cli, FileConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_worker_list() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            buildbot_workers: Some("w1,p1,w2".to_string()),
            ..cli_for(&dir)
        };
        assert!(matches!(
            PortalConfig::resolve(&cli, FileConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(matches!(
            FileConfig::from_yaml("workdirr: /srv/nsbox\n"),
            Err(Error::Yaml(_))
        ));
    }
}
