//! Group rule resolution
//!
//! Maps a verified DN to a permission spec by collecting the rules attribute
//! of every group listing the DN as a member.

use std::sync::Arc;

use ldapbridge_core::types::{PermissionSpec, SearchOutcome};
use ldapbridge_core::{AuthConfig, AuthMode, BASELINE_RULES};
use tracing::debug;

use crate::directory::{escape_filter_value, BindCredentials, DirectoryClient, SearchRequest};
use crate::resolver::AcceptedIdentity;

/// Result of a group lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRules {
    Resolved(PermissionSpec),
    /// Transport failure; the attempt must not grant anything
    Unreachable(String),
    /// Protocol error or refused bind
    Failed(String),
}

pub struct GroupRuleResolver {
    client: Arc<dyn DirectoryClient>,
}

impl GroupRuleResolver {
    pub fn new(client: Arc<dyn DirectoryClient>) -> Self {
        Self { client }
    }

    /// Look up the groups of `identity` on the endpoint that accepted it.
    /// In bind mode the search runs as the user, otherwise as the search
    /// account.
    pub async fn resolve(
        &self,
        config: &AuthConfig,
        identity: &AcceptedIdentity,
        password: &str,
    ) -> GroupRules {
        let bind_as = match &config.mode {
            AuthMode::Bind(_) => BindCredentials::new(identity.dn(), password),
            AuthMode::SearchAndBind(mode) => {
                BindCredentials::new(mode.service_dn.clone(), mode.service_password.clone())
            }
        };

        let request = SearchRequest {
            base: config.groups.search_base.clone(),
            filter: format!(
                "({}={})",
                config.groups.member_attribute,
                escape_filter_value(identity.dn())
            ),
            attributes: vec![config.groups.rules_attribute.clone()],
        };

        let mut spec = baseline(config);

        match self
            .client
            .search(identity.endpoint(), &bind_as, &request, config.timeout)
            .await
        {
            SearchOutcome::Found(groups) => {
                for group in &groups {
                    for fragment in group.values(&config.groups.rules_attribute) {
                        spec.push_fragment(fragment);
                    }
                }
                debug!(dn = identity.dn(), groups = groups.len(), "Group rules resolved");
                GroupRules::Resolved(spec)
            }
            SearchOutcome::NotFound => {
                debug!(dn = identity.dn(), "No groups found");
                GroupRules::Resolved(spec)
            }
            SearchOutcome::Unreachable(e) => GroupRules::Unreachable(e),
            SearchOutcome::InvalidServiceCredentials => {
                GroupRules::Failed("group search bind refused".to_string())
            }
            SearchOutcome::Failed { code, message } => {
                GroupRules::Failed(format!("group search failed (rc={}): {}", code, message))
            }
        }
    }
}

/// Rules every directory-derived spec starts with: the reset rules followed
/// by the configured defaults
pub fn baseline(config: &AuthConfig) -> PermissionSpec {
    let mut spec = PermissionSpec::from_rules(BASELINE_RULES);
    for rule in config.default_rules.rules() {
        spec.push_fragment(rule);
    }
    spec
}
