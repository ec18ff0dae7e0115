//! Reverse proxy with OpenID Connect login
//!
//! Every start regenerates the mod_auth_openidc configuration with a fresh
//! crypto passphrase and re-fetches the provider metadata from Keycloak.
//! The container is relaunched whenever it exits on its own.

use super::{ServiceContext, create_private_dirs};
use crate::buildbot::set_mode;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::relay::colors;
use command_executor::{Container, OutputRelay, ProcessHandle};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use service_orchestration::{Launched, RespawningHandle, ServiceDriver, Spawn, VersionMarker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Container and service name
pub const NAME: &str = "httpd";

/// Marker content written on first boot
pub const VERSION: &str = "Apache/2.4.57 (Fedora Linux)";

/// Length of the generated OIDC crypto passphrase
pub const PASSPHRASE_LEN: usize = 80;

/// Discovery document of the `nsbox` realm, fetched locally
pub const OPENID_CONFIGURATION_URL: &str =
    "https://127.0.0.1:9992/realms/nsbox/.well-known/openid-configuration";

const METADATA_MOUNT: &str = "/var/cache/httpd/mod_auth_openidc/metadata";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// `x0auth_openidc.conf` for the `httpd` OIDC client
pub fn oidc_conf(passphrase: &str, client_secret: &str, hostname: &str) -> String {
    format!(
        r#"
OIDCRedirectURI /OIDCRedirectURI
OIDCCryptoPassphrase "{passphrase}"
OIDCMetadataDir {METADATA_MOUNT}
OIDCScope "openid"
OIDCClientID "httpd"
OIDCClientSecret "{client_secret}"
OIDCCookieDomain {hostname}
OIDCStateMaxNumberOfCookies 100 true
OIDCSessionInactivityTimeout 72000
OIDCSessionMaxDuration 72000
OIDCSessionType server-cache:persistent
OIDCCacheType file
OIDCCacheDir /var/cache/httpd/mod_auth_openidc/cache
OIDCCacheFileCleanInterval 72000
OIDCDiscoverURL "https://{hostname}:8443/discover.html"
OIDCDefaultURL "https://{hostname}:8443/index.html"
OIDCRemoteUserClaim "preferred_username"
"#
    )
}

/// Client metadata file content
pub fn client_metadata(client_secret: &str) -> String {
    format!(
        "{{\n  \"client_id\": \"httpd\",\n  \"client_secret\": \"{}\",\n  \"response_type\": \"code\"\n}}\n",
        client_secret
    )
}

/// Random `[a-zA-Z0-9]` string of `len` characters
pub fn generate_passphrase(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Deserialize)]
struct ClientSecret {
    secret: String,
}

/// The `secret` field of Keycloak's `client_secret.json`
pub fn parse_client_secret(json: &str) -> Result<String> {
    let parsed: ClientSecret = serde_json::from_str(json)?;
    Ok(parsed.secret)
}

/// Metadata file name mod_auth_openidc derives from the issuer
pub fn metadata_file(hostname: &str, extension: &str) -> String {
    format!("{}%3A9992%2Frealms%2Fnsbox.{}", hostname, extension)
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content)?;
    set_mode(path, 0o600)
}

async fn fetch_openid_configuration() -> Result<Vec<u8>> {
    smol::unblock(|| {
        let response = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(FETCH_TIMEOUT)
            .build()?
            .get(OPENID_CONFIGURATION_URL)
            .send()?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Http {
                status: status.as_u16(),
                body: "fetching the OpenID configuration".to_string(),
            });
        }
        Ok(response.bytes()?.to_vec())
    })
    .await
}

/// Relaunches the httpd container
pub struct HttpdSpawner {
    ctx: Arc<ServiceContext>,
    container: Container,
}

#[async_trait]
impl Spawn for HttpdSpawner {
    async fn spawn(&self) -> command_executor::Result<Box<dyn ProcessHandle>> {
        let hostname = self.ctx.config.hostname.as_str();
        let command = self.ctx.runtime.run_command(
            &self.container,
            ["/usr/local/bin/run_httpd", "--hostname", hostname],
        );
        info!("Executing {}", command);
        self.ctx
            .launcher
            .launch(command, OutputRelay::new("H", colors::MAGENTA))
            .await
    }
}

/// Drives the httpd container
pub struct HttpdDriver {
    ctx: Arc<ServiceContext>,
}

impl HttpdDriver {
    /// Driver over `ctx`
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn dir(&self) -> PathBuf {
        self.ctx.service_dir(NAME)
    }

    fn subdirs(&self) -> [PathBuf; 3] {
        let dir = self.dir();
        [dir.join("conf.d"), dir.join("logs"), dir.join("metadata")]
    }

    /// Container with certificates, logs, config and an overlay of the metadata
    pub fn container(&self) -> Container {
        let dir = self.dir();
        Container::new(NAME, &self.ctx.config.images.httpd)
            .with_volume(self.ctx.config.certs_dir(), "/certs")
            .with_volume(dir.join("logs"), "/etc/httpd/logs")
            .with_volume(dir.join("conf.d"), "/mnt/conf.d")
            .with_volume_options(dir.join("metadata"), METADATA_MOUNT, "O")
            .with_host_network()
    }

    fn client_secret(&self) -> Result<String> {
        let path = self
            .ctx
            .service_dir(super::keycloak::NAME)
            .join("client_secret.json");
        let json = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("reading {}: {}", path.display(), e)))?;
        parse_client_secret(&json)
    }

    /// Write the OIDC configuration and the client metadata
    pub fn write_oidc_files(&self) -> Result<()> {
        let hostname = &self.ctx.config.hostname;
        let secret = self.client_secret()?;
        let dir = self.dir();

        let conf = oidc_conf(&generate_passphrase(PASSPHRASE_LEN), &secret, hostname);
        write_private(&dir.join("conf.d").join("x0auth_openidc.conf"), conf.as_bytes())?;

        let client = dir.join("metadata").join(metadata_file(hostname, "client"));
        write_private(&client, client_metadata(&secret).as_bytes())?;
        debug!("wrote OIDC configuration for {}", hostname);
        Ok(())
    }

    async fn write_provider_metadata(&self) -> Result<()> {
        let document = fetch_openid_configuration().await?;
        let path = self
            .dir()
            .join("metadata")
            .join(metadata_file(&self.ctx.config.hostname, "provider"));
        write_private(&path, &document)
    }

    fn spawner(&self) -> Arc<dyn Spawn> {
        Arc::new(HttpdSpawner {
            ctx: self.ctx.clone(),
            container: self.container(),
        })
    }
}

#[async_trait]
impl ServiceDriver for HttpdDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn depends_on(&self) -> Vec<String> {
        vec![super::buildbot::NAME.to_string()]
    }

    fn marker(&self) -> VersionMarker {
        VersionMarker::new(self.dir())
    }

    async fn prepare(&self) -> service_orchestration::Result<()> {
        create_private_dirs([self.dir()])?;
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }

    async fn initialize(&self) -> service_orchestration::Result<()> {
        create_private_dirs(self.subdirs())?;
        write_private(&self.marker().path(), VERSION.as_bytes())?;
        Ok(())
    }

    async fn launch(&self) -> service_orchestration::Result<Launched> {
        create_private_dirs(self.subdirs())?;
        self.write_oidc_files()?;
        self.write_provider_metadata().await?;
        let handle = RespawningHandle::start(NAME, self.spawner()).await?;
        Ok(Launched::Process(Box::new(handle)))
    }

    async fn force_stop(&self) -> service_orchestration::Result<()> {
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::context;
    use crate::testing::ScriptedLauncher;
    use command_executor::ContainerRuntime;
    use tempfile::TempDir;

    #[test]
    fn test_oidc_conf() {
        let conf = oidc_conf("p4ss", "s3cret", "box.example");
        assert!(conf.starts_with("\nOIDCRedirectURI /OIDCRedirectURI\n"));
        assert!(conf.contains("OIDCCryptoPassphrase \"p4ss\"\n"));
        assert!(conf.contains("OIDCClientSecret \"s3cret\"\n"));
        assert!(conf.contains("OIDCCookieDomain box.example\n"));
        assert!(conf.contains("OIDCDiscoverURL \"https://box.example:8443/discover.html\"\n"));
        assert!(conf.contains("OIDCDefaultURL \"https://box.example:8443/index.html\"\n"));
        assert!(conf.ends_with("OIDCRemoteUserClaim \"preferred_username\"\n"));
    }

    #[test]
    fn test_client_metadata() {
        let json: serde_json::Value = serde_json::from_str(&client_metadata("s3cret")).unwrap();
        assert_eq!(json["client_id"], "httpd");
        assert_eq!(json["client_secret"], "s3cret");
        assert_eq!(json["response_type"], "code");
    }

    #[test]
    fn test_passphrase_charset() {
        let passphrase = generate_passphrase(PASSPHRASE_LEN);
        assert_eq!(passphrase.len(), 80);
        assert!(passphrase.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(passphrase, generate_passphrase(PASSPHRASE_LEN));
    }

    #[test]
    fn test_parse_client_secret() {
        assert_eq!(
            parse_client_secret(r#"{"id": "1b2c", "secret": "abc"}"#).unwrap(),
            "abc"
        );
        assert!(matches!(parse_client_secret("{}"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_metadata_file_names() {
        assert_eq!(
            metadata_file("nsbox.local", "provider"),
            "nsbox.local%3A9992%2Frealms%2Fnsbox.provider"
        );
    }

    #[test]
    fn test_container_layout() {
        let dir = TempDir::new().unwrap();
        let driver = HttpdDriver::new(context(&dir, &ScriptedLauncher::new()));
        let w = dir.path().display().to_string();
        let command = ContainerRuntime::podman()
            .run_command(&driver.container(), ["/usr/local/bin/run_httpd", "--hostname", "nsbox.local"]);
        assert_eq!(
            command.to_string(),
            format!(
                "podman run --rm --name httpd --replace -v {w}/certs:/certs \
                 -v {w}/httpd/logs:/etc/httpd/logs -v {w}/httpd/conf.d:/mnt/conf.d \
                 -v {w}/httpd/metadata:/var/cache/httpd/mod_auth_openidc/metadata:O \
                 --network=host naive.systems/box/httpd:dev \
                 /usr/local/bin/run_httpd --hostname nsbox.local"
            )
        );
    }

    #[smol_potat::test]
    async fn test_initialize_and_oidc_files() {
        let dir = TempDir::new().unwrap();
        let driver = HttpdDriver::new(context(&dir, &ScriptedLauncher::new()));
        driver.prepare().await.unwrap();
        driver.initialize().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("httpd").join("version.txt")).unwrap(),
            VERSION
        );

        assert!(matches!(driver.write_oidc_files(), Err(Error::Configuration(_))));

        std::fs::create_dir_all(dir.path().join("keycloak")).unwrap();
        std::fs::write(
            dir.path().join("keycloak").join("client_secret.json"),
            r#"{"id":"x","secret":"abc"}"#,
        )
        .unwrap();
        driver.write_oidc_files().unwrap();
        let conf = std::fs::read_to_string(
            dir.path().join("httpd").join("conf.d").join("x0auth_openidc.conf"),
        )
        .unwrap();
        assert!(conf.contains("OIDCClientSecret \"abc\""));
        let client = dir
            .path()
            .join("httpd")
            .join("metadata")
            .join("nsbox.local%3A9992%2Frealms%2Fnsbox.client");
        assert!(std::fs::read_to_string(client).unwrap().contains("\"client_secret\": \"abc\""));
    }
}
