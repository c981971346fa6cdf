//! Credential resolution
//!
//! Runs the configured strategy against one endpoint at a time. A transport
//! failure marks the endpoint unhealthy and restarts the whole strategy on the
//! next endpoint; any answer from the directory marks it healthy and ends the
//! loop.

use std::sync::Arc;

use ldapbridge_core::config::{BindConfig, SearchAndBindConfig};
use ldapbridge_core::types::{BindOutcome, DirectoryEndpoint, SearchOutcome};
use ldapbridge_core::{AuthConfig, AuthMode, USERNAME_PLACEHOLDER};
use tracing::{debug, warn};

use crate::directory::{
    escape_dn_value, escape_filter_value, BindCredentials, DirectoryClient, SearchRequest,
};
use crate::health::EndpointRegistry;

/// A directory-verified identity. Only the resolver creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedIdentity {
    dn: String,
    endpoint: DirectoryEndpoint,
}

impl AcceptedIdentity {
    pub(crate) fn new(dn: String, endpoint: DirectoryEndpoint) -> Self {
        Self { dn, endpoint }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Endpoint that accepted the credentials
    pub fn endpoint(&self) -> &DirectoryEndpoint {
        &self.endpoint
    }
}

/// Unified result of both strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accepted(AcceptedIdentity),
    /// The directory confirmed the password is wrong
    Rejected,
    /// The directory affirmatively reported no such identity
    AbsentFromDirectory,
    /// No endpoint could be reached
    Unreachable(String),
    /// The bridge itself is misconfigured (service account, filter...)
    ConfigurationError(String),
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Accepted(_) => "accepted",
            Resolution::Rejected => "rejected",
            Resolution::AbsentFromDirectory => "absent",
            Resolution::Unreachable(_) => "unreachable",
            Resolution::ConfigurationError(_) => "configuration_error",
        }
    }
}

/// Outcome of running the strategy on a single endpoint
enum Step {
    Answered(Resolution),
    Transport(String),
}

pub struct CredentialResolver {
    client: Arc<dyn DirectoryClient>,
    registry: Arc<EndpointRegistry>,
}

impl CredentialResolver {
    pub fn new(client: Arc<dyn DirectoryClient>, registry: Arc<EndpointRegistry>) -> Self {
        Self { client, registry }
    }

    pub async fn resolve(&self, config: &AuthConfig, username: &str, password: &str) -> Resolution {
        self.registry.reconcile(config);

        let order = match self.registry.failover_order() {
            Ok(order) => order,
            Err(e) => return Resolution::Unreachable(e.to_string()),
        };

        let mut last_error = String::new();
        for endpoint in order {
            let step = match &config.mode {
                AuthMode::Bind(mode) => self.direct_bind(config, mode, &endpoint, username, password).await,
                AuthMode::SearchAndBind(mode) => {
                    self.search_and_bind(config, mode, &endpoint, username, password)
                        .await
                }
            };

            match step {
                Step::Answered(resolution) => {
                    self.registry.record_outcome(&endpoint, true);
                    debug!(
                        username,
                        endpoint = %endpoint,
                        resolution = resolution.as_str(),
                        "Credentials resolved"
                    );
                    return resolution;
                }
                Step::Transport(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Directory endpoint unreachable, failing over");
                    self.registry.record_outcome(&endpoint, false);
                    last_error = e;
                }
            }
        }

        Resolution::Unreachable(last_error)
    }

    async fn direct_bind(
        &self,
        config: &AuthConfig,
        mode: &BindConfig,
        endpoint: &DirectoryEndpoint,
        username: &str,
        password: &str,
    ) -> Step {
        let dn = bind_dn(mode, username);
        match self.client.bind(endpoint, &dn, password, config.timeout).await {
            BindOutcome::Ok => Step::Answered(Resolution::Accepted(AcceptedIdentity::new(dn, endpoint.clone()))),
            BindOutcome::InvalidCredentials => Step::Answered(Resolution::Rejected),
            BindOutcome::Unreachable(e) => Step::Transport(e),
        }
    }

    async fn search_and_bind(
        &self,
        config: &AuthConfig,
        mode: &SearchAndBindConfig,
        endpoint: &DirectoryEndpoint,
        username: &str,
        password: &str,
    ) -> Step {
        let service = BindCredentials::new(mode.service_dn.clone(), mode.service_password.clone());
        let request = SearchRequest {
            base: mode.base.clone(),
            filter: user_filter(&mode.filter, username),
            attributes: vec![mode.dn_attribute.clone()],
        };

        let entries = match self
            .client
            .search(endpoint, &service, &request, config.timeout)
            .await
        {
            SearchOutcome::Found(entries) => entries,
            SearchOutcome::NotFound => return Step::Answered(Resolution::AbsentFromDirectory),
            SearchOutcome::Unreachable(e) => return Step::Transport(e),
            SearchOutcome::InvalidServiceCredentials => {
                return Step::Answered(Resolution::ConfigurationError(
                    "search account credentials refused".to_string(),
                ))
            }
            SearchOutcome::Failed { code, message } => {
                return Step::Answered(Resolution::ConfigurationError(format!(
                    "user search failed (rc={}): {}",
                    code, message
                )))
            }
        };

        if entries.len() > 1 {
            warn!(username, matches = entries.len(), "Ambiguous directory match, treating as absent");
            return Step::Answered(Resolution::AbsentFromDirectory);
        }
        let Some(entry) = entries.into_iter().next() else {
            return Step::Answered(Resolution::AbsentFromDirectory);
        };

        let dn = match entry.first_value(&mode.dn_attribute) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => entry.dn,
        };

        match self.client.bind(endpoint, &dn, password, config.timeout).await {
            BindOutcome::Ok => Step::Answered(Resolution::Accepted(AcceptedIdentity::new(dn, endpoint.clone()))),
            BindOutcome::InvalidCredentials => Step::Answered(Resolution::Rejected),
            BindOutcome::Unreachable(e) => Step::Transport(e),
        }
    }
}

/// Bind DN for direct-bind mode
pub fn bind_dn(mode: &BindConfig, username: &str) -> String {
    format!("{}{}{}", mode.dn_prefix, escape_dn_value(username), mode.dn_suffix)
}

/// Search filter with every placeholder replaced by the escaped username
pub fn user_filter(template: &str, username: &str) -> String {
    template.replace(USERNAME_PLACEHOLDER, &escape_filter_value(username))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDirectory;
    use ldapbridge_core::{ConfigStore, LdapSettings};
    use std::time::Duration;

    const ALICE_DN: &str = "cn=alice,ou=people,dc=example,dc=org";

    fn bind_config(servers: &str) -> Arc<AuthConfig> {
        let store = ConfigStore::new(LdapSettings::default()).unwrap();
        store.set("ldap.servers", servers).unwrap();
        store.set("ldap.bind_dn_suffix", ",ou=people,dc=example,dc=org").unwrap();
        store.snapshot()
    }

    fn search_config(servers: &str) -> Arc<AuthConfig> {
        let store = ConfigStore::new(LdapSettings::default()).unwrap();
        store.set("ldap.servers", servers).unwrap();
        store.set("ldap.auth_mode", "search_and_bind").unwrap();
        store.set("ldap.search_base", "dc=example,dc=org").unwrap();
        store.set("ldap.search_bind_dn", "cn=svc,dc=example,dc=org").unwrap();
        store.set("ldap.search_bind_passwd", "svcpass").unwrap();
        store.snapshot()
    }

    fn resolver(directory: Arc<ScriptedDirectory>) -> (CredentialResolver, Arc<EndpointRegistry>) {
        let registry = Arc::new(EndpointRegistry::new());
        (CredentialResolver::new(directory, registry.clone()), registry)
    }

    fn directory() -> Arc<ScriptedDirectory> {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.add_user(ALICE_DN, "alice", "alicepass");
        directory.set_service_account("cn=svc,dc=example,dc=org", "svcpass");
        directory
    }

    #[test]
    fn test_bind_dn_escapes_username() {
        let mode = BindConfig {
            dn_prefix: "cn=".into(),
            dn_suffix: ",dc=x".into(),
        };
        assert_eq!(bind_dn(&mode, "alice"), "cn=alice,dc=x");
        assert!(!bind_dn(&mode, "eve,dc=evil").contains("eve,dc=evil"));
    }

    #[test]
    fn test_user_filter_replaces_every_placeholder() {
        assert_eq!(
            user_filter("(|(uid=%u)(mail=%u))", "bob"),
            "(|(uid=bob)(mail=bob))"
        );
        assert!(!user_filter("(uid=%u)", "*").contains("=*)"));
    }

    #[tokio::test]
    async fn test_direct_bind() {
        let directory = directory();
        let (resolver, _) = resolver(directory.clone());
        let config = bind_config("ldap://ldap1");

        match resolver.resolve(&config, "alice", "alicepass").await {
            Resolution::Accepted(identity) => {
                assert_eq!(identity.dn(), ALICE_DN);
                assert_eq!(identity.endpoint().url, "ldap://ldap1:389");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            resolver.resolve(&config, "alice", "wrong").await,
            Resolution::Rejected
        );
    }

    #[tokio::test]
    async fn test_search_and_bind() {
        let directory = directory();
        let (resolver, _) = resolver(directory.clone());
        let config = search_config("ldap://ldap1");

        assert!(matches!(
            resolver.resolve(&config, "alice", "alicepass").await,
            Resolution::Accepted(ref id) if id.dn() == ALICE_DN
        ));
        assert_eq!(
            resolver.resolve(&config, "alice", "wrong").await,
            Resolution::Rejected
        );
        assert_eq!(
            resolver.resolve(&config, "mallory", "x").await,
            Resolution::AbsentFromDirectory
        );
    }

    #[tokio::test]
    async fn test_ambiguous_match_is_absence() {
        let directory = directory();
        directory.add_user("cn=alice,ou=contractors,dc=example,dc=org", "alice", "alicepass");
        let (resolver, _) = resolver(directory.clone());

        assert_eq!(
            resolver
                .resolve(&search_config("ldap://ldap1"), "alice", "alicepass")
                .await,
            Resolution::AbsentFromDirectory
        );
    }

    #[tokio::test]
    async fn test_missing_dn_attribute_uses_entry_dn() {
        let directory = directory();
        directory.omit_dn_attribute(true);
        let (resolver, _) = resolver(directory.clone());

        assert!(matches!(
            resolver
                .resolve(&search_config("ldap://ldap1"), "alice", "alicepass")
                .await,
            Resolution::Accepted(ref id) if id.dn() == ALICE_DN
        ));
    }

    #[tokio::test]
    async fn test_bad_service_account_is_configuration_error() {
        let directory = directory();
        directory.set_service_account("cn=svc,dc=example,dc=org", "rotated");
        let (resolver, registry) = resolver(directory.clone());

        assert!(matches!(
            resolver
                .resolve(&search_config("ldap://ldap1"), "alice", "alicepass")
                .await,
            Resolution::ConfigurationError(_)
        ));
        assert!(registry.aggregate_healthy());
    }

    #[tokio::test]
    async fn test_failover_to_next_endpoint() {
        let directory = directory();
        directory.set_down("ldap://ldap1:389");
        let (resolver, registry) = resolver(directory.clone());
        let config = bind_config("ldap://ldap1 ldap://ldap2");

        match resolver.resolve(&config, "alice", "alicepass").await {
            Resolution::Accepted(identity) => assert_eq!(identity.endpoint().url, "ldap://ldap2:389"),
            other => panic!("unexpected {:?}", other),
        }
        let status = registry.status();
        assert!(!status.endpoints[0].health.is_healthy());
        assert!(status.endpoints[1].health.is_healthy());

        // Unhealthy endpoints go last, so the next attempt starts on ldap2
        let before = directory.bind_count();
        resolver.resolve(&config, "alice", "alicepass").await;
        assert_eq!(directory.bind_count(), before + 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_down() {
        let directory = directory();
        directory.set_all_down(&["ldap://ldap1:389", "ldap://ldap2:389"]);
        let (resolver, registry) = resolver(directory.clone());

        assert!(matches!(
            resolver
                .resolve(&bind_config("ldap://ldap1 ldap://ldap2"), "alice", "alicepass")
                .await,
            Resolution::Unreachable(_)
        ));
        assert!(!registry.aggregate_healthy());
    }

    #[tokio::test]
    async fn test_unhealthy_endpoint_retried_lazily() {
        let directory = directory();
        directory.set_down("ldap://ldap1:389");
        let (resolver, registry) = resolver(directory.clone());
        let config = bind_config("ldap://ldap1");

        assert!(matches!(
            resolver.resolve(&config, "alice", "alicepass").await,
            Resolution::Unreachable(_)
        ));

        directory.set_up("ldap://ldap1:389");
        assert!(matches!(
            resolver.resolve(&config, "alice", "alicepass").await,
            Resolution::Accepted(_)
        ));
        assert!(registry.aggregate_healthy());
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let directory = directory();
        directory.set_delay("ldap://ldap1:389", Duration::from_secs(30));
        let (resolver, _) = resolver(directory.clone());

        let store = ConfigStore::new(LdapSettings::default()).unwrap();
        store.set("ldap.servers", "ldap://ldap1 ldap://ldap2").unwrap();
        store.set("ldap.bind_dn_suffix", ",ou=people,dc=example,dc=org").unwrap();
        store.set("ldap.timeout_ms", "50").unwrap();

        let started = std::time::Instant::now();
        match resolver.resolve(&store.snapshot(), "alice", "alicepass").await {
            Resolution::Accepted(identity) => assert_eq!(identity.endpoint().url, "ldap://ldap2:389"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_endpoints_configured() {
        let (resolver, _) = resolver(directory());
        assert!(matches!(
            resolver.resolve(&bind_config(""), "alice", "alicepass").await,
            Resolution::Unreachable(_)
        ));
    }
}
