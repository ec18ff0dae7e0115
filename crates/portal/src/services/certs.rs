//! Self-signed TLS key pair shared by Keycloak and httpd

use super::{ServiceContext, create_private_dirs};
use crate::Result;
use command_executor::relay::colors;
use command_executor::{Command, OutputRelay};
use std::path::Path;
use tracing::info;

/// Private key file name
pub const KEY_FILE: &str = "nsbox.key";

/// Certificate file name
pub const CERT_FILE: &str = "nsbox.crt";

/// The `openssl` invocation generating a ten-year certificate for `hostname`
pub fn openssl_command(key: &Path, cert: &Path, hostname: &str) -> Command {
    Command::builder("openssl")
        .args(["req", "-x509", "-newkey", "rsa:4096", "-keyout"])
        .arg(key)
        .arg("-noenc")
        .arg("-out")
        .arg(cert)
        .args(["-days", "3650", "-subj"])
        .arg(format!("/CN={}", hostname))
        .arg("-addext")
        .arg(format!("subjectAltName=DNS:{}", hostname))
        .build()
}

/// Generate the key pair unless both files already exist
///
/// Returns whether a new pair was generated.
pub async fn ensure_key_pair(ctx: &ServiceContext) -> Result<bool> {
    let dir = ctx.config.certs_dir();
    create_private_dirs([&dir])?;
    let key = dir.join(KEY_FILE);
    let cert = dir.join(CERT_FILE);
    if key.exists() && cert.exists() {
        info!(
            "Both {} and {} exist. Skip key generation.",
            key.display(),
            cert.display()
        );
        return Ok(false);
    }
    let command = openssl_command(&key, &cert, &ctx.config.hostname);
    ctx.run_local(command, OutputRelay::new("C", colors::BLUE))
        .await?;
    info!("Generated {} and {}", key.display(), cert.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::context;
    use crate::testing::ScriptedLauncher;
    use tempfile::TempDir;

    #[smol_potat::test]
    async fn test_generates_when_missing() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::new();
        let ctx = context(&dir, &launcher);
        assert!(ensure_key_pair(&ctx).await.unwrap());
        let commands = launcher.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("openssl req -x509 -newkey rsa:4096 -keyout "));
        assert!(commands[0].ends_with(
            "-days 3650 -subj /CN=nsbox.local -addext subjectAltName=DNS:nsbox.local"
        ));
    }

    #[smol_potat::test]
    async fn test_skips_existing_pair() {
        let dir = TempDir::new().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join(KEY_FILE), "key").unwrap();
        std::fs::write(certs.join(CERT_FILE), "cert").unwrap();
        let launcher = ScriptedLauncher::new();
        let ctx = context(&dir, &launcher);
        assert!(!ensure_key_pair(&ctx).await.unwrap());
        assert!(launcher.commands().is_empty());
    }
}
