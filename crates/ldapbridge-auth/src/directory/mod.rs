//! Directory access
//!
//! [`DirectoryClient`] performs single round trips against one endpoint and
//! reports closed outcomes. Failover, health and strategy live above it.

mod ldap;

pub use ldap::LdapDirectoryClient;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ldapbridge_core::types::{BindOutcome, DirectoryEndpoint, SearchOutcome};

/// DN and password used to bind before a search
#[derive(Clone, PartialEq, Eq)]
pub struct BindCredentials {
    pub dn: String,
    pub password: String,
}

impl BindCredentials {
    pub fn new(dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            password: password.into(),
        }
    }

    /// Anonymous bind
    pub fn is_anonymous(&self) -> bool {
        self.dn.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for BindCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindCredentials")
            .field("dn", &self.dn)
            .field("password", &"********")
            .finish()
    }
}

/// Subtree search parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    /// Fully escaped filter
    pub filter: String,
    pub attributes: Vec<String>,
}

/// One round trip against one endpoint. Every call is bounded by `timeout`;
/// exceeding it is reported as `Unreachable`.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Simple bind as `dn`
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        dn: &str,
        password: &str,
        timeout: Duration,
    ) -> BindOutcome;

    /// Bind as `bind_as`, then run a subtree search
    async fn search(
        &self,
        endpoint: &DirectoryEndpoint,
        bind_as: &BindCredentials,
        request: &SearchRequest,
        timeout: Duration,
    ) -> SearchOutcome;

    /// Connect with transport security applied, then disconnect
    async fn probe(&self, endpoint: &DirectoryEndpoint, timeout: Duration) -> bool;
}

/// Escape a value for use inside a search filter
pub fn escape_filter_value(value: &str) -> String {
    ldap3::ldap_escape(value).into_owned()
}

/// Escape a value for use as an RDN value
pub fn escape_dn_value(value: &str) -> String {
    ldap3::dn_escape(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_escaping() {
        assert_eq!(escape_filter_value("alice"), "alice");
        assert_eq!(
            escape_filter_value("a*)(uid=*").to_ascii_lowercase(),
            "a\\2a\\29\\28uid=\\2a"
        );
    }

    #[test]
    fn test_dn_escaping() {
        assert_eq!(escape_dn_value("alice"), "alice");
        assert_eq!(
            escape_dn_value("doe, john").to_ascii_lowercase(),
            "doe\\2c john"
        );
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let creds = BindCredentials::new("cn=svc,dc=x", "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));
        assert!(!creds.is_anonymous());
        assert!(BindCredentials::new("", "").is_anonymous());
    }
}
