//! Fallback credential cache
//!
//! Holds the salted hash of the last password the directory accepted for
//! each principal. Consulted only when every endpoint is unreachable.
//! Entries are written only from a directory acceptance, so the type takes
//! an [`AcceptedIdentity`] as proof.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{AuthError, AuthResult};
use crate::resolver::AcceptedIdentity;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    /// Argon2 PHC string, see `ldapbridge_crypto::hash_password`
    hash: String,
    dn: String,
    verified_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// Result of checking a password against the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackLookup {
    Hit,
    Mismatch,
    Miss,
}

pub struct FallbackCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
}

impl Default for FallbackCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl FallbackCache {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a cache persisted at `path`, loading existing entries
    pub async fn open(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: CacheFile = serde_json::from_slice(&bytes)?;
                if file.version != CACHE_FORMAT_VERSION {
                    return Err(AuthError::Persistence(format!(
                        "unsupported cache format version {}",
                        file.version
                    )));
                }
                info!(path = %path.display(), entries = file.entries.len(), "Loaded fallback cache");
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    /// Overwrite the entry with the newly verified password
    pub async fn store_verified(
        &self,
        identity: &AcceptedIdentity,
        principal: &str,
        password: &str,
    ) -> AuthResult<()> {
        let hash = ldapbridge_crypto::hash_password(password)
            .map_err(|e| AuthError::PasswordHash(e.to_string()))?;

        let mut entries = self.entries.write().await;
        entries.insert(
            principal.to_string(),
            CacheEntry {
                hash,
                dn: identity.dn().to_string(),
                verified_at: Utc::now(),
            },
        );
        debug!(principal, "Fallback cache entry refreshed");
        self.persist(&entries).await
    }

    /// Remove the entry, if any. Returns whether one existed.
    pub async fn erase(&self, principal: &str) -> AuthResult<bool> {
        let mut entries = self.entries.write().await;
        if entries.remove(principal).is_none() {
            return Ok(false);
        }
        debug!(principal, "Fallback cache entry erased");
        self.persist(&entries).await?;
        Ok(true)
    }

    pub async fn verify(&self, principal: &str, password: &str) -> FallbackLookup {
        match self.entries.read().await.get(principal) {
            Some(entry) if ldapbridge_crypto::verify_password(password, &entry.hash) => {
                FallbackLookup::Hit
            }
            Some(_) => FallbackLookup::Mismatch,
            None => FallbackLookup::Miss,
        }
    }

    pub async fn contains(&self, principal: &str) -> bool {
        self.entries.read().await.contains_key(principal)
    }

    /// Time of the last directory verification
    pub async fn verified_at(&self, principal: &str) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(principal).map(|e| e.verified_at)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the whole cache to a temporary file and rename it into place.
    /// Called with the write lock held so writers never interleave.
    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> AuthResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            warn!(path = %tmp.display(), error = %e, "Failed to write fallback cache");
            return Err(AuthError::Persistence(e.to_string()));
        }
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| AuthError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapbridge_core::types::{DirectoryEndpoint, TrustMaterial};

    fn identity(dn: &str) -> AcceptedIdentity {
        let endpoint = DirectoryEndpoint::parse("ldap://ldap1", false, TrustMaterial::default()).unwrap();
        AcceptedIdentity::new(dn.to_string(), endpoint)
    }

    #[tokio::test]
    async fn test_last_verified_wins() {
        let cache = FallbackCache::in_memory();
        let alice = identity("cn=alice,dc=x");

        assert_eq!(cache.verify("alice", "old").await, FallbackLookup::Miss);

        cache.store_verified(&alice, "alice", "old").await.unwrap();
        assert_eq!(cache.verify("alice", "old").await, FallbackLookup::Hit);

        cache.store_verified(&alice, "alice", "new").await.unwrap();
        assert_eq!(cache.verify("alice", "new").await, FallbackLookup::Hit);
        assert_eq!(cache.verify("alice", "old").await, FallbackLookup::Mismatch);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_erase() {
        let cache = FallbackCache::in_memory();
        cache
            .store_verified(&identity("cn=bob,dc=x"), "bob", "pw")
            .await
            .unwrap();

        assert!(cache.erase("bob").await.unwrap());
        assert!(!cache.erase("bob").await.unwrap());
        assert_eq!(cache.verify("bob", "pw").await, FallbackLookup::Miss);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");

        {
            let cache = FallbackCache::open(&path).await.unwrap();
            cache
                .store_verified(&identity("cn=alice,dc=x"), "alice", "s3cret")
                .await
                .unwrap();
            cache
                .store_verified(&identity("cn=bob,dc=x"), "bob", "hunter2")
                .await
                .unwrap();
            cache.erase("bob").await.unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("s3cret"));
        assert!(raw.contains(ldapbridge_crypto::PASSWORD_SCHEME));

        let cache = FallbackCache::open(&path).await.unwrap();
        assert_eq!(cache.verify("alice", "s3cret").await, FallbackLookup::Hit);
        assert_eq!(cache.verify("bob", "hunter2").await, FallbackLookup::Miss);
        assert!(cache.verified_at("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        std::fs::write(&path, r#"{"version": 99, "entries": {}}"#).unwrap();

        assert!(matches!(
            FallbackCache::open(&path).await,
            Err(AuthError::Persistence(_))
        ));
    }
}
