//! Authentication engine
//!
//! Decides accept/deny for one attempt and applies the side effects on the
//! permission table and the fallback cache:
//!
//! - exempt principals (and everything, when directory auth is disabled) are
//!   checked against their own row and never reach the directory
//! - a directory acceptance refreshes the row's rules and the cache entry
//! - a rejection clears the cache entry but keeps the row
//! - an absence deletes the row and the cache entry
//! - unreachability denies, or consults the cache when fallback is enabled

use std::sync::Arc;
use std::time::Instant;

use ldapbridge_core::types::{
    AuthDecision, CredentialDescriptor, DenyReason, DirectoryEndpoint, DirectoryStatus, Grant,
    GrantSource,
};
use ldapbridge_core::{AuthConfig, ConfigStore};
use tracing::{debug, error, info, warn};

use crate::directory::DirectoryClient;
use crate::error::AuthResult;
use crate::fallback::{FallbackCache, FallbackLookup};
use crate::groups::{GroupRuleResolver, GroupRules};
use crate::health::{probe_unhealthy, EndpointRegistry, FailureDetector};
use crate::locks::PrincipalLocks;
use crate::metrics;
use crate::resolver::{AcceptedIdentity, CredentialResolver, Resolution};
use crate::table::PermissionTable;

/// Cloneable handle to the engine
#[derive(Clone)]
pub struct AuthEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<ConfigStore>,
    client: Arc<dyn DirectoryClient>,
    registry: Arc<EndpointRegistry>,
    resolver: CredentialResolver,
    groups: GroupRuleResolver,
    table: Arc<dyn PermissionTable>,
    cache: Arc<FallbackCache>,
    locks: PrincipalLocks,
}

impl AuthEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        client: Arc<dyn DirectoryClient>,
        table: Arc<dyn PermissionTable>,
        cache: Arc<FallbackCache>,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::new());
        registry.reconcile(&config.snapshot());

        Self {
            inner: Arc::new(EngineInner {
                resolver: CredentialResolver::new(Arc::clone(&client), Arc::clone(&registry)),
                groups: GroupRuleResolver::new(Arc::clone(&client)),
                config,
                client,
                registry,
                table,
                cache,
                locks: PrincipalLocks::new(),
            }),
        }
    }

    /// Run one attempt to completion.
    ///
    /// The attempt runs on its own task: if the caller stops waiting, the
    /// attempt still finishes and its health, table and cache updates land;
    /// only the decision is discarded.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthDecision {
        let inner = Arc::clone(&self.inner);
        let username = username.to_string();
        let password = password.to_string();

        match tokio::spawn(async move { inner.attempt(&username, &password).await }).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(error = %e, "Authentication task failed");
                AuthDecision::Denied(DenyReason::Internal)
            }
        }
    }

    /// Per-endpoint and aggregate directory health
    pub fn status(&self) -> DirectoryStatus {
        self.inner.registry.reconcile(&self.inner.config.snapshot());
        self.inner.registry.status()
    }

    /// Endpoint the next attempt starts with, if any is healthy
    pub fn active_endpoint(&self) -> AuthResult<DirectoryEndpoint> {
        self.inner.registry.reconcile(&self.inner.config.snapshot());
        self.inner.registry.select_endpoint()
    }

    /// Probe unhealthy endpoints once; returns how many recovered
    pub async fn probe_unhealthy(&self) -> usize {
        let config = self.inner.config.snapshot();
        self.inner.registry.reconcile(&config);
        probe_unhealthy(&self.inner.registry, self.inner.client.as_ref(), config.timeout).await
    }

    /// Probe every endpoint now and record the results
    pub async fn refresh_health(&self) -> DirectoryStatus {
        let config = self.inner.config.snapshot();
        let registry = &self.inner.registry;
        registry.reconcile(&config);

        for endpoint in registry.endpoints() {
            let ok = self.inner.client.probe(&endpoint, config.timeout).await;
            registry.record_outcome(&endpoint, ok);
        }
        registry.status()
    }

    /// Start re-probing unhealthy endpoints in the background
    pub fn spawn_failure_detector(&self) -> FailureDetector {
        FailureDetector::spawn(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.client),
            Arc::clone(&self.inner.config),
        )
    }

    pub fn registry(&self) -> Arc<EndpointRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn config(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.inner.config)
    }

    pub fn cache(&self) -> Arc<FallbackCache> {
        Arc::clone(&self.inner.cache)
    }
}

impl EngineInner {
    async fn attempt(&self, username: &str, password: &str) -> AuthDecision {
        let started = Instant::now();
        let decision = self.decide(username, password).await;

        match &decision {
            AuthDecision::Accepted(grant) => {
                info!(username, source = grant.source.as_str(), "Authentication accepted")
            }
            AuthDecision::Denied(reason) => {
                warn!(username, reason = reason.as_str(), "Authentication denied")
            }
        }
        metrics::record_decision(&decision, started.elapsed().as_secs_f64());
        decision
    }

    async fn decide(&self, username: &str, password: &str) -> AuthDecision {
        // One snapshot for the whole attempt
        let config = self.config.snapshot();
        let _guard = self.locks.lock(username).await;

        if !config.enabled {
            debug!(username, "Directory authentication disabled, using local table");
            return self.verify_local(username, password);
        }
        if config.is_exempt(username) {
            debug!(username, "Principal matches exemption pattern");
            return self.verify_local(username, password);
        }
        match self.table.read_local_credential(username) {
            Ok(Some(row)) if row.is_exempt() => {
                debug!(username, "Principal is locally managed");
                return self.verify_local(username, password);
            }
            Ok(_) => {}
            Err(e) => {
                error!(username, error = %e, "Failed to read permission table");
                return AuthDecision::Denied(DenyReason::Internal);
            }
        }

        // An empty simple bind is an anonymous bind on most directories
        if password.is_empty() {
            return AuthDecision::Denied(DenyReason::EmptyPassword);
        }

        match self.resolver.resolve(&config, username, password).await {
            Resolution::Accepted(identity) => self.accept(&config, identity, username, password).await,
            Resolution::Rejected => {
                self.erase_cached(username).await;
                AuthDecision::Denied(DenyReason::Rejected)
            }
            Resolution::AbsentFromDirectory => {
                self.remove_principal(username);
                self.erase_cached(username).await;
                AuthDecision::Denied(DenyReason::AbsentFromDirectory)
            }
            Resolution::Unreachable(e) => {
                warn!(username, error = %e, "No directory endpoint reachable");
                self.unreachable(&config, username, password).await
            }
            Resolution::ConfigurationError(e) => {
                error!(username, error = %e, "Directory configuration error");
                AuthDecision::Denied(DenyReason::ConfigurationError)
            }
        }
    }

    fn verify_local(&self, username: &str, password: &str) -> AuthDecision {
        match self.table.read_local_credential(username) {
            Ok(Some(row)) if row.check_password(password) => AuthDecision::Accepted(Grant {
                principal: username.to_string(),
                permissions: row.permissions,
                source: GrantSource::LocalTable,
            }),
            Ok(Some(_)) => AuthDecision::Denied(DenyReason::LocalCredentialMismatch),
            Ok(None) => AuthDecision::Denied(DenyReason::UnknownLocalPrincipal),
            Err(e) => {
                error!(username, error = %e, "Failed to read permission table");
                AuthDecision::Denied(DenyReason::Internal)
            }
        }
    }

    async fn accept(
        &self,
        config: &AuthConfig,
        identity: AcceptedIdentity,
        username: &str,
        password: &str,
    ) -> AuthDecision {
        let permissions = match self.groups.resolve(config, &identity, password).await {
            GroupRules::Resolved(spec) => spec,
            GroupRules::Unreachable(e) => {
                warn!(endpoint = %identity.endpoint(), error = %e, "Group lookup lost the directory");
                self.registry.record_outcome(identity.endpoint(), false);
                return self.unreachable(config, username, password).await;
            }
            GroupRules::Failed(e) => {
                error!(username, error = %e, "Group lookup failed");
                return AuthDecision::Denied(DenyReason::ConfigurationError);
            }
        };

        if let Err(e) = self
            .table
            .upsert(username, CredentialDescriptor::Unset, &permissions)
        {
            error!(username, error = %e, "Failed to upsert principal");
            return AuthDecision::Denied(DenyReason::Internal);
        }

        if config.fallback_enabled {
            if let Err(e) = self.cache.store_verified(&identity, username, password).await {
                warn!(username, error = %e, "Failed to refresh fallback cache");
            }
        }

        AuthDecision::Accepted(Grant {
            principal: username.to_string(),
            permissions,
            source: GrantSource::Directory,
        })
    }

    async fn unreachable(&self, config: &AuthConfig, username: &str, password: &str) -> AuthDecision {
        if !config.fallback_enabled {
            return AuthDecision::Denied(DenyReason::DirectoryUnavailable);
        }

        match self.cache.verify(username, password).await {
            FallbackLookup::Hit => {}
            FallbackLookup::Mismatch | FallbackLookup::Miss => {
                return AuthDecision::Denied(DenyReason::FallbackMiss)
            }
        }

        match self.table.read_local_credential(username) {
            Ok(Some(row)) if row.enabled && !row.is_exempt() => {
                metrics::record_fallback_hit();
                AuthDecision::Accepted(Grant {
                    principal: username.to_string(),
                    permissions: row.permissions,
                    source: GrantSource::Fallback,
                })
            }
            Ok(_) => AuthDecision::Denied(DenyReason::FallbackMiss),
            Err(e) => {
                error!(username, error = %e, "Failed to read permission table");
                AuthDecision::Denied(DenyReason::Internal)
            }
        }
    }

    fn remove_principal(&self, username: &str) {
        match self.table.read_local_credential(username) {
            Ok(Some(row)) if row.is_exempt() => {}
            Ok(Some(_)) => match self.table.delete(username) {
                Ok(_) => info!(username, "Principal absent from directory, deleted"),
                Err(e) => error!(username, error = %e, "Failed to delete principal"),
            },
            Ok(None) => {}
            Err(e) => error!(username, error = %e, "Failed to read permission table"),
        }
    }

    async fn erase_cached(&self, username: &str) {
        if let Err(e) = self.cache.erase(username).await {
            warn!(username, error = %e, "Failed to erase fallback cache entry");
        }
    }
}
