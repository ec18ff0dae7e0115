//! Redmine REST client
//!
//! Every call re-reads the admin API key from the file Redmine's init step
//! writes, so a key rotated by Redmine is picked up without a restart.

use crate::{Error, Result};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the Redmine REST API, authenticated as admin
#[derive(Debug, Clone)]
pub struct RedmineClient {
    base_url: String,
    api_key_file: PathBuf,
}

impl RedmineClient {
    /// Client for `base_url`, reading the API key from `api_key_file`
    pub fn new(base_url: impl Into<String>, api_key_file: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key_file: api_key_file.into(),
        }
    }

    /// Trimmed content of the API key file
    pub fn api_key(&self) -> Result<String> {
        let key = std::fs::read_to_string(&self.api_key_file)?;
        Ok(key.trim().to_string())
    }

    async fn put_json(&self, endpoint: &str, payload: serde_json::Value) -> Result<u16> {
        let key = self.api_key()?;
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        smol::unblock(move || {
            debug!("PUT {}", url);
            let response = reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?
                .request(Method::PUT, &url)
                .header(CONTENT_TYPE, "application/json")
                .header("X-Redmine-API-Key", key)
                .body(serde_json::to_vec(&payload)?)
                .send()?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(Error::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(status.as_u16())
        })
        .await
    }

    /// Append a note to issue `ticket`
    pub async fn update_issue_note(&self, ticket: &str, note: &str) -> Result<()> {
        self.put_json(
            &format!("issues/{}.json", ticket),
            json!({ "issue": { "notes": note } }),
        )
        .await?;
        Ok(())
    }

    /// Set the admin account's email to `admin@<hostname>`
    ///
    /// Redmine answers `204 No Content` on success; any other status is an error.
    pub async fn update_admin_email(&self, hostname: &str) -> Result<()> {
        let status = self
            .put_json(
                "my/account.json",
                json!({ "user": { "mail": format!("admin@{}", hostname) } }),
            )
            .await?;
        if status != 204 {
            return Err(Error::Http {
                status,
                body: "expected 204 No Content".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_api_key_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let key_file = dir.path().join("admin_api_key.txt");
        std::fs::write(&key_file, "  abcdef0123\n").unwrap();
        let client = RedmineClient::new("http://127.0.0.1:3000/", &key_file);
        assert_eq!(client.api_key().unwrap(), "abcdef0123");
    }

    #[smol_potat::test]
    async fn test_missing_key_fails_before_any_request() {
        let dir = TempDir::new().unwrap();
        let client = RedmineClient::new("http://127.0.0.1:1", dir.path().join("missing.txt"));
        assert!(matches!(
            client.update_issue_note("42", "note").await,
            Err(Error::Io(_))
        ));
    }
}
