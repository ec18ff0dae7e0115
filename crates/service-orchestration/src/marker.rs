//! Version markers and backup-protected upgrades
//!
//! Every service keeps a marker file in its state directory recording which
//! version last completed initialization. A missing marker means the
//! directory still needs initializing; a marker matching a known
//! needs-migration value means it must be upgraded first.

use crate::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How a stored version is recognized as needing migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationRule {
    /// Marker content starts with this value
    Prefix(String),
    /// Marker content contains this value
    Contains(String),
}

impl MigrationRule {
    fn matches(&self, content: &str) -> bool {
        match self {
            MigrationRule::Prefix(prefix) => content.starts_with(prefix.as_str()),
            MigrationRule::Contains(needle) => content.contains(needle.as_str()),
        }
    }
}

/// What the marker says about a state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// No marker; the service must be initialized
    Missing,
    /// Marker present, nothing to do
    Current(String),
    /// Marker present and the stored version must be upgraded
    NeedsMigration(String),
}

/// A version marker file inside a service's state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    state_dir: PathBuf,
    relative: PathBuf,
    migration: Option<MigrationRule>,
}

impl VersionMarker {
    /// `version.txt` directly inside `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::at(state_dir, "version.txt")
    }

    /// A marker at a custom path relative to `state_dir`
    pub fn at(state_dir: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            relative: relative.into(),
            migration: None,
        }
    }

    /// Recognize stored versions that need an upgrade
    pub fn with_migration(mut self, rule: MigrationRule) -> Self {
        self.migration = Some(rule);
        self
    }

    /// The service's state directory
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Full path of the marker file
    pub fn path(&self) -> PathBuf {
        self.state_dir.join(&self.relative)
    }

    /// Read the marker and classify it
    pub fn status(&self) -> Result<MarkerStatus> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MarkerStatus::Missing);
            }
            Err(e) => {
                return Err(Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("read {}: {}", path.display(), e),
                )));
            }
        };
        match &self.migration {
            Some(rule) if rule.matches(&content) => Ok(MarkerStatus::NeedsMigration(content)),
            _ => Ok(MarkerStatus::Current(content)),
        }
    }

    /// Record that initialization completed
    pub fn write(&self, content: &str) -> Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Recursively copy `src` to `dst`, preserving symlinks
pub fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            std::fs::copy(&link, &target).map(|_| ())?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Run `upgrade` against `live_dir`, protected by a copy in `backup_root`
///
/// The previous backup for this directory is replaced. If the upgrade fails,
/// the live directory is replaced wholesale by the backup before the error
/// is returned, so it is never left partially upgraded.
pub async fn upgrade_with_backup<F, Fut>(
    service: &str,
    live_dir: &Path,
    backup_root: &Path,
    upgrade: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let name = live_dir
        .file_name()
        .ok_or_else(|| Error::Config(format!("{} has no directory name", live_dir.display())))?;
    let backup_dir = backup_root.join(name);

    let (live, backup) = (live_dir.to_path_buf(), backup_dir.clone());
    let root = backup_root.to_path_buf();
    smol::unblock(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&root)?;
        remove_if_exists(&backup)?;
        copy_dir(&live, &backup)
    })
    .await
    .map_err(|e| Error::Upgrade {
        service: service.to_string(),
        reason: format!("backup to {}: {}", backup_dir.display(), e),
    })?;

    info!("Upgrading {}...", service);
    match upgrade().await {
        Ok(()) => {
            info!("{} has been successfully upgraded.", service);
            Ok(())
        }
        Err(err) => {
            warn!("{} upgrade failed, restoring {}", service, backup_dir.display());
            let (live, backup) = (live_dir.to_path_buf(), backup_dir.clone());
            smol::unblock(move || -> std::io::Result<()> {
                remove_if_exists(&live)?;
                copy_dir(&backup, &live)
            })
            .await
            .map_err(|e| Error::Upgrade {
                service: service.to_string(),
                reason: format!("{}; restore from {} also failed: {}", err, backup_dir.display(), e),
            })?;
            Err(Error::Upgrade {
                service: service.to_string(),
                reason: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_status() {
        let dir = TempDir::new().unwrap();
        let marker = VersionMarker::new(dir.path())
            .with_migration(MigrationRule::Prefix("3.8.2".to_string()));
        assert_eq!(marker.status().unwrap(), MarkerStatus::Missing);

        marker.write("3.8.2-1\n").unwrap();
        assert!(matches!(marker.status().unwrap(), MarkerStatus::NeedsMigration(_)));

        marker.write("3.9.5\n").unwrap();
        assert_eq!(
            marker.status().unwrap(),
            MarkerStatus::Current("3.9.5\n".to_string())
        );
    }

    #[test]
    fn test_nested_marker_with_contains_rule() {
        let dir = TempDir::new().unwrap();
        let marker = VersionMarker::at(dir.path(), "data/version.txt")
            .with_migration(MigrationRule::Contains("Keycloak - Version 23.0.1".to_string()));
        marker.write("Keycloak - Version 23.0.1\nbuilt").unwrap();
        assert!(dir.path().join("data/version.txt").exists());
        assert!(matches!(marker.status().unwrap(), MarkerStatus::NeedsMigration(_)));
    }

    #[test]
    fn test_unreadable_marker_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        // A directory where the marker file should be cannot be read as text
        std::fs::create_dir_all(dir.path().join("version.txt")).unwrap();
        let err = VersionMarker::new(dir.path()).status().unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
        assert!(err.to_string().contains("version.txt"));
    }

    #[smol_potat::test]
    async fn test_upgrade_success_keeps_backup() {
        let root = TempDir::new().unwrap();
        let live = root.path().join("gerrit");
        let backup_root = root.path().join("backup");
        std::fs::create_dir_all(live.join("db")).unwrap();
        std::fs::write(live.join("db/state"), "old").unwrap();

        let upgraded = live.clone();
        upgrade_with_backup("gerrit", &live, &backup_root, || async move {
            std::fs::write(upgraded.join("db/state"), "new")?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(live.join("db/state")).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(backup_root.join("gerrit/db/state")).unwrap(),
            "old"
        );
    }

    #[smol_potat::test]
    async fn test_upgrade_failure_restores_live_dir() {
        let root = TempDir::new().unwrap();
        let live = root.path().join("redmine");
        let backup_root = root.path().join("backup");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("version.txt"), "5.0.6+nsbox.2023110601").unwrap();
        // A stale backup from an earlier run must not leak into the restore
        std::fs::create_dir_all(backup_root.join("redmine")).unwrap();
        std::fs::write(backup_root.join("redmine/stale"), "x").unwrap();

        let touched = live.clone();
        let err = upgrade_with_backup("redmine", &live, &backup_root, || async move {
            std::fs::write(touched.join("version.txt"), "half-migrated")?;
            std::fs::write(touched.join("partial"), "junk")?;
            Err(Error::Config("migration crashed".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Upgrade { .. }));
        assert_eq!(
            std::fs::read_to_string(live.join("version.txt")).unwrap(),
            "5.0.6+nsbox.2023110601"
        );
        assert!(!live.join("partial").exists());
        assert!(!live.join("stale").exists());
    }
}
