//! Directory call outcomes and authentication decisions
//!
//! Every directory round trip returns a closed enum so the engine's branching
//! is checked exhaustively. Raw transport errors stop at these types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::PermissionSpec;

/// Outcome of a simple bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Ok,
    /// The directory answered and refused the DN/password pair
    InvalidCredentials,
    /// Transport failure or timeout
    Unreachable(String),
}

/// An entry returned by a directory search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub dn: String,
    #[serde(default)]
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.attributes.insert(name.into(), values);
        self
    }

    /// Values of an attribute, matched case-insensitively
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }
}

/// Outcome of a bound search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// At least one entry matched
    Found(Vec<DirectoryEntry>),
    /// No entry matched, or the base does not exist
    NotFound,
    /// Transport failure or timeout
    Unreachable(String),
    /// The account used for the search was refused
    InvalidServiceCredentials,
    /// Any other protocol-level error (bad filter, insufficient access...)
    Failed { code: u32, message: String },
}

/// Where an accepted grant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    /// Verified against the directory on this attempt
    Directory,
    /// Directory unreachable; verified against the fallback cache
    Fallback,
    /// Exempt or directory auth disabled; verified against the local row
    LocalTable,
}

impl GrantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantSource::Directory => "directory",
            GrantSource::Fallback => "fallback",
            GrantSource::LocalTable => "local",
        }
    }
}

/// Permission grant returned on acceptance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub principal: String,
    pub permissions: PermissionSpec,
    pub source: GrantSource,
}

/// Internal reason for a denial. Operators see it in logs and metrics; the
/// client only ever sees [`DenyReason::client_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    EmptyPassword,
    /// Exempt or local path: no such row
    UnknownLocalPrincipal,
    /// Exempt or local path: stored credential did not match
    LocalCredentialMismatch,
    /// Directory confirmed a wrong credential
    Rejected,
    /// Directory affirmatively reported no such identity
    AbsentFromDirectory,
    /// All endpoints unreachable and fallback disabled
    DirectoryUnavailable,
    /// All endpoints unreachable and the fallback cache did not match
    FallbackMiss,
    ConfigurationError,
    Internal,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::EmptyPassword => "empty_password",
            DenyReason::UnknownLocalPrincipal => "unknown_local_principal",
            DenyReason::LocalCredentialMismatch => "local_credential_mismatch",
            DenyReason::Rejected => "rejected",
            DenyReason::AbsentFromDirectory => "absent_from_directory",
            DenyReason::DirectoryUnavailable => "directory_unavailable",
            DenyReason::FallbackMiss => "fallback_miss",
            DenyReason::ConfigurationError => "configuration_error",
            DenyReason::Internal => "internal",
        }
    }

    /// Opaque diagnostic for the authenticating client. Identical for every
    /// reason so that denials cannot be used to enumerate identities.
    pub fn client_message(&self) -> &'static str {
        "WRONGPASS invalid username-password pair or user is disabled."
    }
}

/// Final answer of one authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted(Grant),
    Denied(DenyReason),
}

impl AuthDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthDecision::Accepted(_))
    }

    pub fn grant(&self) -> Option<&Grant> {
        match self {
            AuthDecision::Accepted(grant) => Some(grant),
            AuthDecision::Denied(_) => None,
        }
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            AuthDecision::Accepted(_) => None,
            AuthDecision::Denied(reason) => Some(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_attribute_lookup_is_case_insensitive() {
        let entry = DirectoryEntry::new("cn=alice,dc=x")
            .with_attribute("entryDN", vec!["cn=alice,dc=x".to_string()]);
        assert_eq!(entry.first_value("entrydn"), Some("cn=alice,dc=x"));
        assert!(entry.values("mail").is_empty());
    }

    #[test]
    fn test_client_message_is_uniform() {
        let reasons = [
            DenyReason::Rejected,
            DenyReason::AbsentFromDirectory,
            DenyReason::DirectoryUnavailable,
            DenyReason::FallbackMiss,
        ];
        for reason in reasons {
            assert_eq!(reason.client_message(), DenyReason::Rejected.client_message());
        }
    }

    #[test]
    fn test_decision_accessors() {
        let accepted = AuthDecision::Accepted(Grant {
            principal: "alice".into(),
            permissions: PermissionSpec::new(),
            source: GrantSource::Directory,
        });
        assert!(accepted.is_accepted());
        assert_eq!(accepted.grant().map(|g| g.source), Some(GrantSource::Directory));

        let denied = AuthDecision::Denied(DenyReason::Rejected);
        assert!(!denied.is_accepted());
        assert_eq!(denied.deny_reason(), Some(DenyReason::Rejected));
    }
}
