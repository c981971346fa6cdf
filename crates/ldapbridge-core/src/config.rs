//! Configuration for ldapbridge
//!
//! Settings come from a TOML file, from `LDAPBRIDGE_*` environment variables
//! and from runtime `set` calls. Every accepted change is compiled into an
//! immutable [`AuthConfig`] snapshot; an attempt reads one snapshot from start
//! to finish so a concurrent change only affects later attempts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{DirectoryEndpoint, PermissionSpec, TrustMaterial};
use crate::USERNAME_PLACEHOLDER;

/// Prefix of every runtime setting key
pub const KEY_PREFIX: &str = "ldap.";

/// Prefix of environment variables read by [`BridgeConfig::from_env`]
pub const ENV_PREFIX: &str = "LDAPBRIDGE_";

const MASK: &str = "********";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub ldap: LdapSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.ldap.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `LDAPBRIDGE_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `LDAPBRIDGE_*` variables. `ldap.search_filter` is read from
    /// `LDAPBRIDGE_SEARCH_FILTER`, and so on for every key.
    pub fn apply_env(&mut self) -> Result<()> {
        for key in LdapSettings::KEYS {
            if let Ok(value) = std::env::var(env_var_for(key)) {
                self.ldap.set(key, &value)?;
            }
        }
        if let Ok(path) = std::env::var("LDAPBRIDGE_FALLBACK_CACHE_PATH") {
            self.ldap.fallback_cache_path = non_empty_path(&path);
        }
        if let Ok(level) = std::env::var("LDAPBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LDAPBRIDGE_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }
}

/// Environment variable name for a setting key
pub fn env_var_for(key: &str) -> String {
    let short = key.strip_prefix(KEY_PREFIX).unwrap_or(key);
    format!("{}{}", ENV_PREFIX, short.replace('.', "_").to_ascii_uppercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Authentication strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModeKind {
    #[default]
    Bind,
    SearchAndBind,
}

impl AuthModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthModeKind::Bind => "bind",
            AuthModeKind::SearchAndBind => "search_and_bind",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bind" => Some(AuthModeKind::Bind),
            "search_and_bind" | "search+bind" => Some(AuthModeKind::SearchAndBind),
            _ => None,
        }
    }
}

/// Operator-facing settings, one field per `ldap.*` key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapSettings {
    pub auth_enabled: bool,
    pub servers: Vec<String>,
    pub auth_mode: AuthModeKind,
    pub bind_dn_prefix: String,
    pub bind_dn_suffix: String,
    pub search_base: String,
    pub search_filter: String,
    pub search_dn_attribute: String,
    pub search_bind_dn: String,
    pub search_bind_passwd: String,
    pub use_starttls: bool,
    pub tls_ca_cert_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub groups_rules_attribute: String,
    pub groups_search_base: String,
    pub groups_member_attribute: String,
    pub default_acl_rules: String,
    pub exempted_users_regex: String,
    pub acl_fallback_enabled: bool,
    pub timeout_ms: u64,
    /// Seconds between re-probes of unhealthy endpoints, 0 disables
    pub failure_detector_interval: u64,
    /// Where the fallback cache is persisted. File/env only.
    pub fallback_cache_path: Option<PathBuf>,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            auth_enabled: true,
            servers: Vec::new(),
            auth_mode: AuthModeKind::Bind,
            bind_dn_prefix: "cn=".to_string(),
            bind_dn_suffix: String::new(),
            search_base: String::new(),
            search_filter: "(uid=%u)".to_string(),
            search_dn_attribute: "entryDN".to_string(),
            search_bind_dn: String::new(),
            search_bind_passwd: String::new(),
            use_starttls: false,
            tls_ca_cert_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            groups_rules_attribute: "aclRules".to_string(),
            groups_search_base: String::new(),
            groups_member_attribute: "member".to_string(),
            default_acl_rules: String::new(),
            exempted_users_regex: String::new(),
            acl_fallback_enabled: false,
            timeout_ms: 5000,
            failure_detector_interval: 1,
            fallback_cache_path: None,
        }
    }
}

impl LdapSettings {
    /// Keys accepted by [`LdapSettings::set`] and [`LdapSettings::get`]
    pub const KEYS: [&'static str; 22] = [
        "ldap.auth_enabled",
        "ldap.servers",
        "ldap.auth_mode",
        "ldap.bind_dn_prefix",
        "ldap.bind_dn_suffix",
        "ldap.search_base",
        "ldap.search_filter",
        "ldap.search_dn_attribute",
        "ldap.search_bind_dn",
        "ldap.search_bind_passwd",
        "ldap.use_starttls",
        "ldap.tls_ca_cert_path",
        "ldap.tls_cert_path",
        "ldap.tls_key_path",
        "ldap.groups_rules_attribute",
        "ldap.groups_search_base",
        "ldap.groups_member_attribute",
        "ldap.default_acl_rules",
        "ldap.exempted_users_regex",
        "ldap.acl_fallback_enabled",
        "ldap.timeout_ms",
        "ldap.failure_detector_interval",
    ];

    /// Validate and apply one setting. On error nothing changes.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "ldap.auth_enabled" => self.auth_enabled = parse_bool(key, value)?,
            "ldap.servers" => {
                let servers = split_servers(value);
                for server in &servers {
                    DirectoryEndpoint::parse(server, self.use_starttls, TrustMaterial::default())?;
                }
                self.servers = servers;
            }
            "ldap.auth_mode" => {
                self.auth_mode = AuthModeKind::parse(value)
                    .ok_or_else(|| Error::invalid(key, "expected bind or search_and_bind"))?;
            }
            "ldap.bind_dn_prefix" => {
                validate_dn_fragment(key, value)?;
                self.bind_dn_prefix = value.to_string();
            }
            "ldap.bind_dn_suffix" => {
                validate_dn_fragment(key, value)?;
                if !value.is_empty() && !value.starts_with(',') && !value.starts_with('@') {
                    return Err(Error::invalid(key, "suffix must start with ',' or '@'"));
                }
                self.bind_dn_suffix = value.to_string();
            }
            "ldap.search_base" => {
                validate_base(key, value)?;
                self.search_base = value.to_string();
            }
            "ldap.search_filter" => {
                validate_filter(key, value)?;
                self.search_filter = value.to_string();
            }
            "ldap.search_dn_attribute" => {
                validate_attribute(key, value)?;
                self.search_dn_attribute = value.to_string();
            }
            "ldap.search_bind_dn" => {
                validate_dn_fragment(key, value)?;
                self.search_bind_dn = value.to_string();
            }
            "ldap.search_bind_passwd" => self.search_bind_passwd = value.to_string(),
            "ldap.use_starttls" => self.use_starttls = parse_bool(key, value)?,
            "ldap.tls_ca_cert_path" => self.tls_ca_cert_path = validate_file(key, value)?,
            "ldap.tls_cert_path" => self.tls_cert_path = validate_file(key, value)?,
            "ldap.tls_key_path" => self.tls_key_path = validate_file(key, value)?,
            "ldap.groups_rules_attribute" => {
                validate_attribute(key, value)?;
                self.groups_rules_attribute = value.to_string();
            }
            "ldap.groups_search_base" => {
                validate_base(key, value)?;
                self.groups_search_base = value.to_string();
            }
            "ldap.groups_member_attribute" => {
                validate_attribute(key, value)?;
                self.groups_member_attribute = value.to_string();
            }
            "ldap.default_acl_rules" => self.default_acl_rules = value.trim().to_string(),
            "ldap.exempted_users_regex" => {
                compile_exemption(value)?;
                self.exempted_users_regex = value.to_string();
            }
            "ldap.acl_fallback_enabled" => self.acl_fallback_enabled = parse_bool(key, value)?,
            "ldap.timeout_ms" => {
                let ms = parse_u64(key, value)?;
                if ms == 0 {
                    return Err(Error::invalid(key, "must be greater than zero"));
                }
                self.timeout_ms = ms;
            }
            "ldap.failure_detector_interval" => {
                self.failure_detector_interval = parse_u64(key, value)?;
            }
            _ => return Err(Error::UnknownSetting(key.to_string())),
        }
        Ok(())
    }

    /// Current value of a setting; secrets are masked
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "ldap.auth_enabled" => yes_no(self.auth_enabled),
            "ldap.servers" => self.servers.join(" "),
            "ldap.auth_mode" => self.auth_mode.as_str().to_string(),
            "ldap.bind_dn_prefix" => self.bind_dn_prefix.clone(),
            "ldap.bind_dn_suffix" => self.bind_dn_suffix.clone(),
            "ldap.search_base" => self.search_base.clone(),
            "ldap.search_filter" => self.search_filter.clone(),
            "ldap.search_dn_attribute" => self.search_dn_attribute.clone(),
            "ldap.search_bind_dn" => self.search_bind_dn.clone(),
            "ldap.search_bind_passwd" => {
                if self.search_bind_passwd.is_empty() {
                    String::new()
                } else {
                    MASK.to_string()
                }
            }
            "ldap.use_starttls" => yes_no(self.use_starttls),
            "ldap.tls_ca_cert_path" => path_string(&self.tls_ca_cert_path),
            "ldap.tls_cert_path" => path_string(&self.tls_cert_path),
            "ldap.tls_key_path" => path_string(&self.tls_key_path),
            "ldap.groups_rules_attribute" => self.groups_rules_attribute.clone(),
            "ldap.groups_search_base" => self.groups_search_base.clone(),
            "ldap.groups_member_attribute" => self.groups_member_attribute.clone(),
            "ldap.default_acl_rules" => self.default_acl_rules.clone(),
            "ldap.exempted_users_regex" => self.exempted_users_regex.clone(),
            "ldap.acl_fallback_enabled" => yes_no(self.acl_fallback_enabled),
            "ldap.timeout_ms" => self.timeout_ms.to_string(),
            "ldap.failure_detector_interval" => self.failure_detector_interval.to_string(),
            _ => return Err(Error::UnknownSetting(key.to_string())),
        };
        Ok(value)
    }

    /// Re-validate every field. Used for settings deserialized from a file.
    pub fn validate(&self) -> Result<()> {
        let mut scratch = LdapSettings::default();
        for key in Self::KEYS {
            let value = match key {
                "ldap.search_bind_passwd" => self.search_bind_passwd.clone(),
                _ => self.get(key)?,
            };
            scratch.set(key, &value)?;
        }
        Ok(())
    }

    fn trust_material(&self) -> TrustMaterial {
        TrustMaterial {
            ca_cert_path: self.tls_ca_cert_path.clone(),
            client_cert_path: self.tls_cert_path.clone(),
            client_key_path: self.tls_key_path.clone(),
        }
    }

    /// Base for group searches: explicit, else the search base, else the
    /// bind suffix without its leading comma
    pub fn effective_groups_search_base(&self) -> String {
        if !self.groups_search_base.is_empty() {
            return self.groups_search_base.clone();
        }
        if !self.search_base.is_empty() {
            return self.search_base.clone();
        }
        match self.bind_dn_suffix.strip_prefix(',') {
            Some(base) => base.to_string(),
            None => String::new(),
        }
    }

    /// Compile into an immutable snapshot
    pub fn compile(&self, generation: u64) -> Result<AuthConfig> {
        let trust = self.trust_material();
        let endpoints = self
            .servers
            .iter()
            .map(|s| DirectoryEndpoint::parse(s, self.use_starttls, trust.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mode = match self.auth_mode {
            AuthModeKind::Bind => AuthMode::Bind(BindConfig {
                dn_prefix: self.bind_dn_prefix.clone(),
                dn_suffix: self.bind_dn_suffix.clone(),
            }),
            AuthModeKind::SearchAndBind => AuthMode::SearchAndBind(SearchAndBindConfig {
                base: self.search_base.clone(),
                filter: self.search_filter.clone(),
                dn_attribute: self.search_dn_attribute.clone(),
                service_dn: self.search_bind_dn.clone(),
                service_password: self.search_bind_passwd.clone(),
            }),
        };

        let mut default_rules = PermissionSpec::new();
        default_rules.push_fragment(&self.default_acl_rules);

        Ok(AuthConfig {
            generation,
            enabled: self.auth_enabled,
            mode,
            endpoints,
            groups: GroupRulesConfig {
                search_base: self.effective_groups_search_base(),
                member_attribute: self.groups_member_attribute.clone(),
                rules_attribute: self.groups_rules_attribute.clone(),
            },
            default_rules,
            exemption: compile_exemption(&self.exempted_users_regex)?,
            fallback_enabled: self.acl_fallback_enabled,
            timeout: Duration::from_millis(self.timeout_ms),
            failure_detector_interval: Duration::from_secs(self.failure_detector_interval),
        })
    }
}

/// Direct-bind parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfig {
    pub dn_prefix: String,
    pub dn_suffix: String,
}

/// Search-and-bind parameters
#[derive(Clone, PartialEq, Eq)]
pub struct SearchAndBindConfig {
    pub base: String,
    /// Filter template; every `%u` is replaced by the escaped username
    pub filter: String,
    pub dn_attribute: String,
    pub service_dn: String,
    pub service_password: String,
}

impl std::fmt::Debug for SearchAndBindConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchAndBindConfig")
            .field("base", &self.base)
            .field("filter", &self.filter)
            .field("dn_attribute", &self.dn_attribute)
            .field("service_dn", &self.service_dn)
            .field("service_password", &MASK)
            .finish()
    }
}

/// Authentication strategy with the parameters it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Bind(BindConfig),
    SearchAndBind(SearchAndBindConfig),
}

impl AuthMode {
    pub fn kind(&self) -> AuthModeKind {
        match self {
            AuthMode::Bind(_) => AuthModeKind::Bind,
            AuthMode::SearchAndBind(_) => AuthModeKind::SearchAndBind,
        }
    }
}

/// Group rule lookup parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRulesConfig {
    pub search_base: String,
    pub member_attribute: String,
    pub rules_attribute: String,
}

/// Immutable, compiled configuration snapshot
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Incremented on every accepted change
    pub generation: u64,
    pub enabled: bool,
    pub mode: AuthMode,
    pub endpoints: Vec<DirectoryEndpoint>,
    pub groups: GroupRulesConfig,
    pub default_rules: PermissionSpec,
    pub exemption: Option<Regex>,
    pub fallback_enabled: bool,
    /// Bound on every directory round trip
    pub timeout: Duration,
    pub failure_detector_interval: Duration,
}

impl AuthConfig {
    /// Whether the username matches the exemption pattern
    pub fn is_exempt(&self, username: &str) -> bool {
        self.exemption
            .as_ref()
            .map(|re| re.is_match(username))
            .unwrap_or(false)
    }
}

/// Runtime settings with snapshot publication.
///
/// `set` validates the value, compiles a new snapshot and swaps it in; a
/// rejected value leaves both the settings and the snapshot untouched.
pub struct ConfigStore {
    settings: Mutex<LdapSettings>,
    snapshot: RwLock<Arc<AuthConfig>>,
    generation: AtomicU64,
}

impl ConfigStore {
    pub fn new(settings: LdapSettings) -> Result<Self> {
        let snapshot = settings.compile(0)?;
        Ok(Self {
            settings: Mutex::new(settings),
            snapshot: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(0),
        })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut settings = self.settings.lock();
        let mut candidate = settings.clone();
        candidate.set(key, value)?;

        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot = candidate.compile(generation)?;

        *settings = candidate;
        *self.snapshot.write() = Arc::new(snapshot);
        self.generation.store(generation, Ordering::SeqCst);

        if key == "ldap.search_bind_passwd" {
            debug!(key, generation, "Setting updated");
        } else {
            info!(key, value, generation, "Setting updated");
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String> {
        self.settings.lock().get(key)
    }

    /// Snapshot used by the next attempt
    pub fn snapshot(&self) -> Arc<AuthConfig> {
        self.snapshot.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> LdapSettings {
        self.settings.lock().clone()
    }

    /// Every key with its (masked) current value
    pub fn dump(&self) -> Vec<(&'static str, String)> {
        let settings = self.settings.lock();
        LdapSettings::KEYS
            .iter()
            .filter_map(|key| settings.get(key).ok().map(|v| (*key, v)))
            .collect()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(Error::invalid(key, "expected yes or no")),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(key, "expected a non-negative integer"))
}

fn yes_no(value: bool) -> String {
    let value = if value { "yes" } else { "no" };
    value.to_string()
}

fn path_string(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_dn_fragment(key: &str, value: &str) -> Result<()> {
    if value.contains(USERNAME_PLACEHOLDER) {
        return Err(Error::invalid(key, "placeholder %u is only valid in search_filter"));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::invalid(key, "control characters are not allowed"));
    }
    Ok(())
}

fn validate_base(key: &str, value: &str) -> Result<()> {
    validate_dn_fragment(key, value)?;
    if !value.is_empty() && !value.contains('=') {
        return Err(Error::invalid(key, "expected a distinguished name"));
    }
    Ok(())
}

fn validate_filter(key: &str, value: &str) -> Result<()> {
    if !value.contains(USERNAME_PLACEHOLDER) {
        return Err(Error::invalid(key, "filter must contain the %u placeholder"));
    }
    if !value.starts_with('(') || !value.ends_with(')') {
        return Err(Error::invalid(key, "filter must be enclosed in parentheses"));
    }
    let mut depth: i64 = 0;
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::invalid(key, "unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::invalid(key, "unbalanced parentheses"));
    }
    Ok(())
}

fn validate_attribute(key: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ';' | '.'));
    if !valid {
        return Err(Error::invalid(key, "expected an attribute name"));
    }
    Ok(())
}

fn validate_file(key: &str, value: &str) -> Result<Option<PathBuf>> {
    let Some(path) = non_empty_path(value) else {
        return Ok(None);
    };
    if !path.is_file() {
        return Err(Error::invalid(
            key,
            format!("file not found: {}", path.display()),
        ));
    }
    Ok(Some(path))
}

fn compile_exemption(value: &str) -> Result<Option<Regex>> {
    if value.is_empty() {
        return Ok(None);
    }
    Regex::new(value)
        .map(Some)
        .map_err(|e| Error::invalid("ldap.exempted_users_regex", e.to_string()))
}
