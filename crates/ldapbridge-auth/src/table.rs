//! Host permission table
//!
//! The host store owns the table; the bridge only upserts directory-managed
//! rows, deletes them, and reads a row's local credential.

use std::collections::HashMap;

use ldapbridge_core::types::{CredentialDescriptor, PermissionSpec, Principal};
use parking_lot::RwLock;

use crate::error::{AuthError, AuthResult};

/// Synchronous, atomic-per-call access to the host's permission table
pub trait PermissionTable: Send + Sync {
    /// Create or replace `principal` as a directory-managed row
    fn upsert(
        &self,
        principal: &str,
        credential: CredentialDescriptor,
        permissions: &PermissionSpec,
    ) -> AuthResult<()>;

    /// Delete `principal`; returns whether a row existed
    fn delete(&self, principal: &str) -> AuthResult<bool>;

    /// Read the row for `principal`, if any
    fn read_local_credential(&self, principal: &str) -> AuthResult<Option<Principal>>;
}

/// In-process permission table
#[derive(Debug, Default)]
pub struct MemoryPermissionTable {
    rows: RwLock<HashMap<String, Principal>>,
}

impl MemoryPermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is (used to seed locally managed principals)
    pub fn insert(&self, principal: Principal) {
        self.rows.write().insert(principal.name.clone(), principal);
    }

    pub fn get(&self, principal: &str) -> Option<Principal> {
        self.rows.read().get(principal).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rows.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PermissionTable for MemoryPermissionTable {
    fn upsert(
        &self,
        principal: &str,
        credential: CredentialDescriptor,
        permissions: &PermissionSpec,
    ) -> AuthResult<()> {
        let mut rows = self.rows.write();
        if rows.get(principal).map(Principal::is_exempt).unwrap_or(false) {
            return Err(AuthError::PermissionTable(format!(
                "refusing to overwrite locally managed principal {}",
                principal
            )));
        }
        rows.insert(
            principal.to_string(),
            Principal::directory_managed(principal, credential, permissions.clone()),
        );
        Ok(())
    }

    fn delete(&self, principal: &str) -> AuthResult<bool> {
        Ok(self.rows.write().remove(principal).is_some())
    }

    fn read_local_credential(&self, principal: &str) -> AuthResult<Option<Principal>> {
        Ok(self.get(principal))
    }
}
