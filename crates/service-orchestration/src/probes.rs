//! Concrete HTTP readiness probes
//!
//! HTTP goes through `reqwest::blocking` on smol's blocking thread pool, so
//! the probes never stall the executor.

use crate::health::{Readiness, ReadinessProbe};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch `url` and return its body; non-2xx is reported as not ready
async fn fetch(url: String, accept_invalid_certs: bool) -> std::result::Result<String, Readiness> {
    smol::unblock(move || {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Readiness::TransportError(e.to_string()))?;
        let response = client
            .get(&url)
            .send()
            .map_err(|e| Readiness::TransportError(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Readiness::TransportError(e.to_string()))?;
        if !status.is_success() {
            return Err(Readiness::NotReady(format!("HTTP {}", status)));
        }
        Ok(body)
    })
    .await
}

/// Extract the version from a version endpoint body: the last line, quotes stripped
pub fn parse_version_body(body: &str) -> String {
    body.trim_end_matches('\n')
        .lines()
        .last()
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
}

/// Extract the `status` field from a JSON health body
pub fn parse_health_status(body: &str) -> Result<String> {
    serde_json::from_str::<HealthBody>(body)
        .map(|h| h.status)
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Ready when the version endpoint reports exactly the expected version
#[derive(Debug, Clone)]
pub struct VersionProbe {
    url: String,
    expected: String,
}

impl VersionProbe {
    /// Probe `url` for `expected`
    pub fn new(url: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for VersionProbe {
    async fn probe(&self) -> Readiness {
        match fetch(self.url.clone(), false).await {
            Ok(body) => {
                let version = parse_version_body(&body);
                if version == self.expected {
                    Readiness::Ready
                } else {
                    Readiness::NotReady(version)
                }
            }
            Err(readiness) => readiness,
        }
    }
}

/// Ready when a JSON health endpoint reports `"status": "UP"`
#[derive(Debug, Clone)]
pub struct HealthStatusProbe {
    url: String,
    accept_invalid_certs: bool,
}

impl HealthStatusProbe {
    /// Probe `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            accept_invalid_certs: false,
        }
    }

    /// Accept self-signed certificates
    pub fn accept_invalid_certs(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }
}

#[async_trait]
impl ReadinessProbe for HealthStatusProbe {
    async fn probe(&self) -> Readiness {
        match fetch(self.url.clone(), self.accept_invalid_certs).await {
            Ok(body) => match parse_health_status(&body) {
                Ok(status) if status == "UP" => Readiness::Ready,
                Ok(status) => Readiness::NotReady(status),
                Err(e) => Readiness::NotReady(e.to_string()),
            },
            Err(readiness) => readiness,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_body_takes_last_line() {
        assert_eq!(parse_version_body(")]}'\n\"3.9.5\"\n"), "3.9.5");
        assert_eq!(parse_version_body("\"3.9.4\""), "3.9.4");
        assert_eq!(parse_version_body(""), "");
    }

    #[test]
    fn test_parse_health_status() {
        let body = r#"{"status": "UP", "checks": []}"#;
        assert_eq!(parse_health_status(body).unwrap(), "UP");
        assert_eq!(parse_health_status(r#"{"status":"DOWN"}"#).unwrap(), "DOWN");
        assert!(matches!(
            parse_health_status("<html>"),
            Err(Error::Decode(_))
        ));
    }

    #[smol_potat::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let probe = VersionProbe::new("http://127.0.0.1:9/config/server/version", "3.9.5");
        assert!(matches!(probe.probe().await, Readiness::TransportError(_)));
    }
}
