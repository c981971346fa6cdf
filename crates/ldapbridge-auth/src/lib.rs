//! Directory-backed authentication for ldapbridge
//!
//! Resolves credentials against LDAP endpoints with failover, maps group
//! membership to permission rules, and keeps the host permission table and
//! the fallback cache consistent with what the directory reports.

pub mod directory;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod groups;
pub mod health;
pub mod locks;
pub mod metrics;
pub mod resolver;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use directory::{BindCredentials, DirectoryClient, LdapDirectoryClient, SearchRequest};
pub use engine::AuthEngine;
pub use error::{AuthError, AuthResult};
pub use fallback::{FallbackCache, FallbackLookup};
pub use groups::{GroupRuleResolver, GroupRules};
pub use health::{EndpointRegistry, FailureDetector};
pub use locks::PrincipalLocks;
pub use resolver::{AcceptedIdentity, CredentialResolver, Resolution};
pub use table::{MemoryPermissionTable, PermissionTable};
