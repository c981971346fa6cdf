//! Principal types
//!
//! A principal is one row of the host store's permission table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the host store verifies a principal's password on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "hash")]
pub enum CredentialDescriptor {
    /// Any password is accepted
    NoPassword,
    /// Argon2 hash of a verified password
    VerifiedHash(String),
    /// No local credential; only the bridge can authenticate the principal
    Unset,
}

impl CredentialDescriptor {
    pub fn verify(&self, password: &str) -> bool {
        match self {
            CredentialDescriptor::NoPassword => true,
            CredentialDescriptor::VerifiedHash(hash) => {
                ldapbridge_crypto::verify_password(password, hash)
            }
            CredentialDescriptor::Unset => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialDescriptor::NoPassword => "nopass",
            CredentialDescriptor::VerifiedHash(_) => "hash",
            CredentialDescriptor::Unset => "none",
        }
    }
}

/// Who owns a permission-table row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Created and maintained from directory lookups
    DirectoryManaged,
    /// Managed locally; the bridge never mutates or deletes it
    LocallyExempt,
}

/// Permission rules in host-store syntax, consumed verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSpec {
    rules: Vec<String>,
}

impl PermissionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a whitespace-separated fragment. Tokens are not interpreted.
    pub fn push_fragment(&mut self, fragment: &str) {
        self.rules
            .extend(fragment.split_whitespace().map(str::to_string));
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `rules` appear as a contiguous run
    pub fn contains_sequence(&self, rules: &[&str]) -> bool {
        if rules.is_empty() {
            return true;
        }
        self.rules
            .windows(rules.len())
            .any(|w| w.iter().zip(rules).all(|(a, b)| a == b))
    }
}

impl fmt::Display for PermissionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rules.join(" "))
    }
}

/// A row in the host store's permission table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    /// on/off flag
    pub enabled: bool,
    pub credential: CredentialDescriptor,
    pub permissions: PermissionSpec,
    pub provenance: Provenance,
}

impl Principal {
    /// A row written by the bridge after a directory acceptance
    pub fn directory_managed(
        name: impl Into<String>,
        credential: CredentialDescriptor,
        permissions: PermissionSpec,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            credential,
            permissions,
            provenance: Provenance::DirectoryManaged,
        }
    }

    /// A locally managed row that bypasses the directory
    pub fn local(
        name: impl Into<String>,
        credential: CredentialDescriptor,
        permissions: PermissionSpec,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            credential,
            permissions,
            provenance: Provenance::LocallyExempt,
        }
    }

    pub fn is_exempt(&self) -> bool {
        self.provenance == Provenance::LocallyExempt
    }

    /// Verify against the row's own stored credential
    pub fn check_password(&self, password: &str) -> bool {
        self.enabled && self.credential.verify(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_descriptor_verify() {
        let hash = ldapbridge_crypto::hash_password("localpass").unwrap();
        assert!(CredentialDescriptor::VerifiedHash(hash.clone()).verify("localpass"));
        assert!(!CredentialDescriptor::VerifiedHash(hash).verify("wrong"));
        assert!(CredentialDescriptor::NoPassword.verify("anything"));
        assert!(!CredentialDescriptor::Unset.verify("anything"));
    }

    #[test]
    fn test_disabled_principal_never_checks() {
        let mut p = Principal::local(
            "exporter",
            CredentialDescriptor::NoPassword,
            PermissionSpec::from_rules(["+@all"]),
        );
        assert!(p.check_password("x"));
        p.enabled = false;
        assert!(!p.check_password("x"));
    }

    #[test]
    fn test_permission_spec_fragments() {
        let mut spec = PermissionSpec::new();
        spec.push_fragment("+@read ~keys:*");
        spec.push_fragment("  +@write   ~cache:* ");
        assert_eq!(spec.rules().len(), 4);
        assert!(spec.contains_sequence(&["+@read", "~keys:*"]));
        assert!(spec.contains_sequence(&["+@write", "~cache:*"]));
        assert!(!spec.contains_sequence(&["+@read", "~cache:*"]));
        assert_eq!(spec.to_string(), "+@read ~keys:* +@write ~cache:*");
    }
}
