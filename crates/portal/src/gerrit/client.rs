//! Gerrit REST client
//!
//! Authenticates through the impersonation headers the reverse proxy would
//! normally set, obtains a generated HTTP password and then talks to the
//! authenticated `/a/` REST API with basic auth. Gerrit prefixes every JSON
//! response with `)]}'` to defeat XSSI; responses without it are rejected.

use crate::{Error, Result};
use reqwest::blocking::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const XSSI_PREFIX: &str = ")]}'\n";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 1000;

/// Projects Gerrit always has and that are never built
const BUILTIN_PROJECTS: [&str; 2] = ["All-Projects", "All-Users"];

/// A Gerrit project
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    /// URL-encoded project name
    pub id: String,
    /// Project name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl Project {
    /// Project with the given fields
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A Gerrit group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Group {
    /// Group UUID
    pub id: String,
    /// Group name
    pub name: String,
}

/// Strip the XSSI guard from a JSON response
pub fn strip_xssi(body: &str) -> Result<&str> {
    body.strip_prefix(XSSI_PREFIX)
        .ok_or_else(|| Error::Decode("unexpected response format from Gerrit".to_string()))
}

/// At most [`MAX_ERROR_BODY`] bytes of `body`, for error messages
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Decode the `projects/` map, dropping built-in projects
///
/// The map is keyed by name and the values carry no name of their own.
pub fn parse_projects(json: &str) -> Result<Vec<Project>> {
    let map: BTreeMap<String, Project> = serde_json::from_str(json)?;
    Ok(map
        .into_iter()
        .filter(|(name, _)| !BUILTIN_PROJECTS.contains(&name.as_str()))
        .map(|(name, mut project)| {
            project.name = name;
            project
        })
        .collect())
}

/// Decode the password returned by `PUT /accounts/self/password.http`
pub fn parse_generated_password(body: &str) -> Result<String> {
    let password = strip_xssi(body)?.trim().trim_matches('"');
    if password.is_empty() {
        return Err(Error::Decode(
            "failed to generate or retrieve HTTP password".to_string(),
        ));
    }
    Ok(password.to_string())
}

fn xsrf_token(cookie_header: &str) -> Option<String> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "XSRF_TOKEN")
        .map(|(_, value)| value.to_string())
}

fn http_client(jar: Option<Arc<Jar>>) -> Result<Client> {
    let mut builder = Client::builder()
        .redirect(Policy::none())
        .timeout(REQUEST_TIMEOUT);
    if let Some(jar) = jar {
        builder = builder.cookie_provider(jar);
    }
    Ok(builder.build()?)
}

/// Client for one Gerrit instance, acting as one impersonated user
#[derive(Debug, Clone)]
pub struct GerritClient {
    base_url: String,
    remote_user: String,
    display_name: String,
    email: String,
    http_password: Arc<Mutex<Option<String>>>,
}

impl GerritClient {
    /// Client for `base_url` impersonating `remote_user`
    pub fn new(
        base_url: impl Into<String>,
        remote_user: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            remote_user: remote_user.into(),
            display_name: display_name.into(),
            email: email.into(),
            http_password: Arc::new(Mutex::new(None)),
        }
    }

    /// Base URL, without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/a/<segments>`, every segment percent-encoded on its own
    pub fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("bad Gerrit URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("bad Gerrit URL {}", self.base_url)))?
            .pop_if_empty()
            .push("a")
            .extend(segments);
        Ok(url)
    }

    fn password(&self) -> Option<String> {
        self.http_password
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Log in and obtain a fresh HTTP password
    pub async fn login(&self) -> Result<()> {
        let client = self.clone();
        let password = smol::unblock(move || client.login_blocking()).await?;
        *self
            .http_password
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(password);
        Ok(())
    }

    fn login_blocking(&self) -> Result<String> {
        let jar = Arc::new(Jar::default());
        let http = http_client(Some(jar.clone()))?;

        let response = http
            .get(format!("{}/login/", self.base_url))
            .header("REMOTE_USER", &self.remote_user)
            .header("OIDC_CLAIM_name", &self.display_name)
            .header("OIDC_CLAIM_email", &self.email)
            .send()?;
        if response.status() != StatusCode::FOUND {
            return Err(Error::Http {
                status: response.status().as_u16(),
                body: "unexpected status during initial login".to_string(),
            });
        }

        let settings = Url::parse(&format!("{}/settings/", self.base_url))
            .map_err(|e| Error::config(format!("bad Gerrit URL {}: {}", self.base_url, e)))?;
        http.get(settings.clone()).send()?;
        let token = jar
            .cookies(&settings)
            .and_then(|header| header.to_str().ok().and_then(xsrf_token))
            .ok_or_else(|| {
                Error::Decode("failed to retrieve XSRF token from cookies".to_string())
            })?;

        let response = http
            .put(format!("{}/accounts/self/password.http", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header("x-gerrit-auth", token)
            .body(r#"{"generate":true}"#)
            .send()?;
        parse_generated_password(&response.text()?)
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        content_type: &'static str,
        body: Vec<u8>,
    ) -> Result<String> {
        let password = self
            .password()
            .ok_or_else(|| Error::Transport("not logged in to Gerrit".to_string()))?;
        let url = self.api_url(segments)?;
        let user = self.remote_user.clone();
        smol::unblock(move || {
            debug!("{} {}", method, url);
            let response = http_client(None)?
                .request(method, url)
                .header(CONTENT_TYPE, content_type)
                .basic_auth(user, Some(password))
                .body(body)
                .send()?;
            let status = response.status();
            let text = response.text()?;
            if !status.is_success() {
                return Err(Error::Http {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                });
            }
            Ok(strip_xssi(&text)?.to_string())
        })
        .await
    }

    /// Authenticated request with a JSON body
    pub async fn json_request<T: Serialize>(
        &self,
        method: Method,
        segments: &[&str],
        payload: &T,
    ) -> Result<String> {
        let body = serde_json::to_vec(payload)?;
        self.request(method, segments, "application/json", body).await
    }

    /// Authenticated request with a plain-text body
    pub async fn plain_request(&self, method: Method, segments: &[&str], body: &str) -> Result<String> {
        self.request(method, segments, "text/plain", body.as_bytes().to_vec())
            .await
    }

    /// All user projects
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let body = self.plain_request(Method::GET, &["projects", ""], "").await?;
        parse_projects(&body)
    }

    /// Look up a group by name or id
    pub async fn get_group(&self, group: &str) -> Result<Group> {
        let body = self.plain_request(Method::GET, &["groups", group], "").await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Add `account` to `group`; a no-op if already a member
    pub async fn add_member_to_group(&self, group: &str, account: &str) -> Result<()> {
        self.plain_request(Method::PUT, &["groups", group, "members", account], "")
            .await?;
        Ok(())
    }

    /// Register an SSH public key for `account`
    pub async fn add_ssh_key(&self, account: &str, key: &str) -> Result<()> {
        self.plain_request(Method::POST, &["accounts", account, "sshkeys"], key)
            .await?;
        Ok(())
    }

    /// Create (or overwrite) the `Verified` label on All-Projects
    pub async fn create_verified_label(&self) -> Result<()> {
        let payload = json!({
            "commit_message": "Create Verified Label",
            "values": {
                "-1": "Fails",
                " 0": "No score",
                "+1": "Verified",
            },
            "function": "MaxWithBlock",
            "copy_condition": "changekind:NO_CHANGE",
        });
        self.json_request(
            Method::PUT,
            &["projects", "All-Projects", "labels", "Verified"],
            &payload,
        )
        .await?;
        Ok(())
    }

    /// Let `group_id` read everything and vote Verified on `project`; hide it
    /// from anonymous users
    pub async fn grant_ci_permissions(&self, project: &str, group_id: &str) -> Result<()> {
        let payload = ci_access_payload(group_id);
        self.json_request(Method::POST, &["projects", project, "access"], &payload)
            .await?;
        Ok(())
    }

    /// Make sure an account exists by logging in as it once
    ///
    /// The login page creates the account on first use. Only transport
    /// failures are errors.
    pub async fn ensure_account(&self, username: &str, display_name: &str, email: &str) -> Result<()> {
        info!("Ensuring Gerrit account '{}'", username);
        let url = format!("{}/login/", self.base_url);
        let (username, display_name, email) =
            (username.to_string(), display_name.to_string(), email.to_string());
        let status = smol::unblock(move || -> Result<StatusCode> {
            let response = http_client(None)?
                .get(url)
                .header("REMOTE_USER", &username)
                .header("OIDC_CLAIM_name", display_name)
                .header("OIDC_CLAIM_email", email)
                .send()?;
            Ok(response.status())
        })
        .await?;
        info!("Gerrit login page answered {}", status);
        Ok(())
    }
}

/// Access-rights payload granting CI permissions to `group_id`
pub fn ci_access_payload(group_id: &str) -> serde_json::Value {
    json!({
        "add": {
            "refs/*": {
                "permissions": {
                    "read": {
                        "rules": { group_id: { "action": "ALLOW" } }
                    }
                }
            },
            "refs/heads/*": {
                "permissions": {
                    "label-Verified": {
                        "label": "Verified",
                        "rules": { group_id: { "action": "ALLOW", "min": -1, "max": 1 } }
                    },
                    "read": {
                        "rules": { "global:Anonymous-Users": { "action": "DENY" } }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_projects_drops_builtins_and_names_from_keys() {
        let body = r#"{
            "All-Projects": {"id": "All-Projects", "state": "ACTIVE"},
            "All-Users": {"id": "All-Users"},
            "tools/lint": {"id": "tools%2Flint", "description": "Linters"},
            "app": {"id": "app"}
        }"#;
        let projects = parse_projects(body).unwrap();
        assert_eq!(
            projects,
            vec![
                Project::new("app", "app", ""),
                Project::new("tools%2Flint", "tools/lint", "Linters"),
            ]
        );
    }

    #[test]
    fn test_xssi_prefix_is_required() {
        assert_eq!(strip_xssi(")]}'\n{\"a\":1}").unwrap(), "{\"a\":1}");
        assert!(matches!(strip_xssi("{\"a\":1}"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_generated_password() {
        assert_eq!(
            parse_generated_password(")]}'\n\"s3cr3t\"\n").unwrap(),
            "s3cr3t"
        );
        assert!(parse_generated_password(")]}'\n\"\"").is_err());
        assert!(parse_generated_password("\"s3cr3t\"").is_err());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "é".repeat(800);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_ERROR_BODY + 3);
    }

    #[test]
    fn test_xsrf_token_from_cookie_header() {
        assert_eq!(
            xsrf_token("GerritAccount=abc; XSRF_TOKEN=tok123"),
            Some("tok123".to_string())
        );
        assert_eq!(xsrf_token("GerritAccount=abc"), None);
    }

    #[test]
    fn test_api_url_encodes_each_segment() {
        let client = GerritClient::new("http://127.0.0.1:8081/", "admin", "Administrator", "admin@x");
        let url = |segments: &[&str]| client.api_url(segments).unwrap().to_string();
        assert_eq!(
            url(&["groups", "Service Users", "members", "buildbot"]),
            "http://127.0.0.1:8081/a/groups/Service%20Users/members/buildbot"
        );
        assert_eq!(url(&["projects", "team/app", "access"]), "http://127.0.0.1:8081/a/projects/team%2Fapp/access");
        assert_eq!(url(&["projects", ""]), "http://127.0.0.1:8081/a/projects/");
    }

    #[test]
    fn test_api_url_keeps_a_base_path() {
        let client = GerritClient::new("https://nsbox.local:8443/gerrit", "admin", "Administrator", "admin@x");
        assert_eq!(
            client.api_url(&["accounts", "buildbot", "sshkeys"]).unwrap().as_str(),
            "https://nsbox.local:8443/gerrit/a/accounts/buildbot/sshkeys"
        );
    }

    #[test]
    fn test_ci_access_payload_uses_group_id() {
        let payload = ci_access_payload("abc123");
        let verified = &payload["add"]["refs/heads/*"]["permissions"]["label-Verified"];
        assert_eq!(verified["rules"]["abc123"]["min"].as_i64(), Some(-1));
        assert_eq!(verified["rules"]["abc123"]["max"].as_i64(), Some(1));
        assert_eq!(
            payload["add"]["refs/*"]["permissions"]["read"]["rules"]["abc123"]["action"].as_str(),
            Some("ALLOW")
        );
    }

    #[smol_potat::test]
    async fn test_request_requires_login() {
        let client = GerritClient::new("http://127.0.0.1:1", "admin", "Administrator", "admin@x");
        assert!(matches!(
            client.list_projects().await,
            Err(Error::Transport(_))
        ));
    }
}
