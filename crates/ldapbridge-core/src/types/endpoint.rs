//! Directory endpoint types
//!
//! An endpoint is one directory server URL together with the transport
//! security applied before any bind. Health is tracked separately by the
//! endpoint registry; [`EndpointStatus`] is its reporting form.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Default port for plain LDAP and StartTLS
pub const LDAP_PORT: u16 = 389;

/// Default port for implicit TLS
pub const LDAPS_PORT: u16 = 636;

/// Transport security applied to a directory connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No transport security
    Plain,
    /// Plain connection upgraded with the StartTLS extended operation
    StartTls,
    /// TLS from the first byte (`ldaps://`)
    Tls,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Plain => "plain",
            TlsMode::StartTls => "starttls",
            TlsMode::Tls => "tls",
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, TlsMode::Plain)
    }
}

/// Trust material references (PEM files)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustMaterial {
    /// CA bundle replacing the system trust roots
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate presented for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
}

impl TrustMaterial {
    pub fn is_empty(&self) -> bool {
        self.ca_cert_path.is_none()
            && self.client_cert_path.is_none()
            && self.client_key_path.is_none()
    }

    /// Whether a client identity is configured
    pub fn has_client_identity(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

/// A configured directory server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryEndpoint {
    /// Normalized URL, e.g. `ldap://ldap.example.com:389`
    pub url: String,
    pub tls_mode: TlsMode,
    #[serde(default)]
    pub trust: TrustMaterial,
}

impl DirectoryEndpoint {
    /// Parse an endpoint URL. `ldaps://` always means implicit TLS; for
    /// `ldap://` the `use_starttls` flag selects StartTLS.
    pub fn parse(raw: &str, use_starttls: bool, trust: TrustMaterial) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidEndpoint {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;

        let (tls_mode, default_port) = match url.scheme() {
            "ldap" if use_starttls => (TlsMode::StartTls, LDAP_PORT),
            "ldap" => (TlsMode::Plain, LDAP_PORT),
            "ldaps" => (TlsMode::Tls, LDAPS_PORT),
            _ => return Err(invalid("scheme must be ldap:// or ldaps://")),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        if !url.path().is_empty() && url.path() != "/" {
            return Err(invalid("path components are not supported"));
        }

        let port = url.port().unwrap_or(default_port);

        Ok(Self {
            url: format!("{}://{}:{}", url.scheme(), host, port),
            tls_mode,
            trust,
        })
    }

    pub fn address(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Endpoint liveness as seen by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHealth {
    Healthy,
    Unhealthy,
}

impl EndpointHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointHealth::Healthy => "healthy",
            EndpointHealth::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, EndpointHealth::Healthy)
    }
}

/// Reported health of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub url: String,
    pub tls_mode: TlsMode,
    pub health: EndpointHealth,
    /// Consecutive transport failures since the last success
    pub consecutive_failures: u32,
    /// Time of the last health transition
    pub last_change: Option<DateTime<Utc>>,
}

/// Status of the whole endpoint registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryStatus {
    pub endpoints: Vec<EndpointStatus>,
}

impl DirectoryStatus {
    /// Healthy iff at least one endpoint is healthy
    pub fn is_healthy(&self) -> bool {
        self.endpoints.iter().any(|e| e.health.is_healthy())
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.health.is_healthy())
            .count()
    }

    /// Render as an INFO-style section:
    ///
    /// ```text
    /// # ldap
    /// ldap_status:healthy
    /// ldap_server_0:url=ldap://a:389,tls=plain,health=healthy,failures=0
    /// ```
    pub fn to_info_section(&self) -> String {
        let mut out = String::from("# ldap\n");
        out.push_str(&format!(
            "ldap_status:{}\n",
            if self.is_healthy() { "healthy" } else { "down" }
        ));
        out.push_str(&format!(
            "ldap_servers:total={},healthy={}\n",
            self.endpoints.len(),
            self.healthy_count()
        ));
        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            out.push_str(&format!(
                "ldap_server_{}:url={},tls={},health={},failures={}\n",
                idx,
                endpoint.url,
                endpoint.tls_mode.as_str(),
                endpoint.health.as_str(),
                endpoint.consecutive_failures
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_starttls() {
        let ep = DirectoryEndpoint::parse("ldap://ldap", false, TrustMaterial::default()).unwrap();
        assert_eq!(ep.url, "ldap://ldap:389");
        assert_eq!(ep.tls_mode, TlsMode::Plain);

        let ep = DirectoryEndpoint::parse("ldap://ldap:1389", true, TrustMaterial::default())
            .unwrap();
        assert_eq!(ep.url, "ldap://ldap:1389");
        assert_eq!(ep.tls_mode, TlsMode::StartTls);
    }

    #[test]
    fn test_parse_ldaps_ignores_starttls_flag() {
        let ep = DirectoryEndpoint::parse("ldaps://dc.example.com", true, TrustMaterial::default())
            .unwrap();
        assert_eq!(ep.url, "ldaps://dc.example.com:636");
        assert_eq!(ep.tls_mode, TlsMode::Tls);
        assert!(ep.tls_mode.is_secure());
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(DirectoryEndpoint::parse("http://ldap", false, TrustMaterial::default()).is_err());
        assert!(DirectoryEndpoint::parse("ldap://", false, TrustMaterial::default()).is_err());
        assert!(DirectoryEndpoint::parse("not a url", false, TrustMaterial::default()).is_err());
        assert!(
            DirectoryEndpoint::parse("ldap://host/dc=x", false, TrustMaterial::default()).is_err()
        );
    }

    #[test]
    fn test_info_section() {
        let status = DirectoryStatus {
            endpoints: vec![
                EndpointStatus {
                    url: "ldap://a:389".into(),
                    tls_mode: TlsMode::Plain,
                    health: EndpointHealth::Unhealthy,
                    consecutive_failures: 2,
                    last_change: None,
                },
                EndpointStatus {
                    url: "ldap://b:389".into(),
                    tls_mode: TlsMode::StartTls,
                    health: EndpointHealth::Healthy,
                    consecutive_failures: 0,
                    last_change: None,
                },
            ],
        };

        assert!(status.is_healthy());
        let info = status.to_info_section();
        assert!(info.contains("ldap_status:healthy"));
        assert!(info.contains("ldap_servers:total=2,healthy=1"));
        assert!(info.contains("ldap_server_0:url=ldap://a:389,tls=plain,health=unhealthy,failures=2"));
    }

    #[test]
    fn test_empty_status_is_down() {
        let status = DirectoryStatus::default();
        assert!(!status.is_healthy());
        assert!(status.to_info_section().contains("ldap_status:down"));
    }
}
