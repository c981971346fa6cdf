//! LDAP directory client
//!
//! Opens one connection per round trip. `ldaps://` endpoints use implicit
//! TLS, StartTLS endpoints upgrade before the first bind. A configured CA
//! bundle replaces the native trust roots.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchResult};
use ldapbridge_core::types::{
    BindOutcome, DirectoryEndpoint, DirectoryEntry, SearchOutcome, TlsMode, TrustMaterial,
};
use parking_lot::Mutex;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use tracing::{debug, error, warn};

use super::{BindCredentials, DirectoryClient, SearchRequest};
use crate::error::{AuthError, AuthResult};
use crate::metrics;

// LDAP result codes
const RC_SUCCESS: u32 = 0;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;

/// [`DirectoryClient`] backed by `ldap3`
pub struct LdapDirectoryClient {
    tls_configs: Mutex<HashMap<TrustMaterial, Arc<ClientConfig>>>,
}

impl Default for LdapDirectoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LdapDirectoryClient {
    pub fn new() -> Self {
        Self {
            tls_configs: Mutex::new(HashMap::new()),
        }
    }

    /// TLS client configuration for a set of trust material, built once
    fn tls_config(&self, trust: &TrustMaterial) -> AuthResult<Arc<ClientConfig>> {
        if let Some(config) = self.tls_configs.lock().get(trust) {
            return Ok(config.clone());
        }

        let config = Arc::new(build_tls_config(trust)?);
        self.tls_configs
            .lock()
            .insert(trust.clone(), config.clone());
        Ok(config)
    }

    async fn connect(&self, endpoint: &DirectoryEndpoint, timeout: Duration) -> Result<Ldap, String> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_starttls(endpoint.tls_mode == TlsMode::StartTls);

        if endpoint.tls_mode.is_secure() {
            let config = self.tls_config(&endpoint.trust).map_err(|e| {
                error!(endpoint = %endpoint, error = %e, "TLS configuration unusable");
                e.to_string()
            })?;
            settings = settings.set_config(config);
        }

        debug!(endpoint = %endpoint, tls = endpoint.tls_mode.as_str(), "Connecting to directory");

        let (conn, ldap) = LdapConnAsync::with_settings(settings, endpoint.address())
            .await
            .map_err(|e| format!("Failed to connect to {}: {}", endpoint, e))?;

        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn bind_inner(&self, endpoint: &DirectoryEndpoint, dn: &str, password: &str, timeout: Duration) -> BindOutcome {
        let mut ldap = match self.connect(endpoint, timeout).await {
            Ok(ldap) => ldap,
            Err(e) => return BindOutcome::Unreachable(e),
        };

        let outcome = match ldap.simple_bind(dn, password).await {
            Ok(result) => classify_bind(result.rc, &result.text),
            Err(e) => BindOutcome::Unreachable(format!("Bind failed: {}", e)),
        };

        let _ = ldap.unbind().await;
        outcome
    }

    async fn search_inner(
        &self,
        endpoint: &DirectoryEndpoint,
        bind_as: &BindCredentials,
        request: &SearchRequest,
        timeout: Duration,
    ) -> SearchOutcome {
        let mut ldap = match self.connect(endpoint, timeout).await {
            Ok(ldap) => ldap,
            Err(e) => return SearchOutcome::Unreachable(e),
        };

        let outcome = self.bound_search(&mut ldap, bind_as, request).await;
        let _ = ldap.unbind().await;
        outcome
    }

    async fn bound_search(
        &self,
        ldap: &mut Ldap,
        bind_as: &BindCredentials,
        request: &SearchRequest,
    ) -> SearchOutcome {
        if !bind_as.is_anonymous() {
            match ldap.simple_bind(&bind_as.dn, &bind_as.password).await {
                Ok(result) => match classify_bind(result.rc, &result.text) {
                    BindOutcome::Ok => {}
                    BindOutcome::InvalidCredentials => {
                        warn!(dn = %bind_as.dn, rc = result.rc, "Search account bind refused");
                        return SearchOutcome::InvalidServiceCredentials;
                    }
                    BindOutcome::Unreachable(e) => return SearchOutcome::Unreachable(e),
                },
                Err(e) => return SearchOutcome::Unreachable(format!("Bind failed: {}", e)),
            }
        }

        debug!(base = %request.base, filter = %request.filter, "Searching directory");

        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();
        match ldap
            .search(&request.base, Scope::Subtree, &request.filter, attrs)
            .await
        {
            Ok(SearchResult(entries, result)) => {
                let entries = entries
                    .into_iter()
                    .filter(|e| !e.is_ref())
                    .map(|e| {
                        let entry = SearchEntry::construct(e);
                        DirectoryEntry {
                            dn: entry.dn,
                            attributes: entry.attrs,
                        }
                    })
                    .collect();
                classify_search(result.rc, &result.text, entries)
            }
            Err(e) => SearchOutcome::Unreachable(format!("Search failed: {}", e)),
        }
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectoryClient {
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        dn: &str,
        password: &str,
        timeout: Duration,
    ) -> BindOutcome {
        let outcome = match tokio::time::timeout(timeout, self.bind_inner(endpoint, dn, password, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => BindOutcome::Unreachable(format!("Bind timed out after {:?}", timeout)),
        };

        let label = match &outcome {
            BindOutcome::Ok => "ok",
            BindOutcome::InvalidCredentials => "invalid_credentials",
            BindOutcome::Unreachable(_) => "unreachable",
        };
        metrics::record_directory_call(endpoint.address(), label);
        outcome
    }

    async fn search(
        &self,
        endpoint: &DirectoryEndpoint,
        bind_as: &BindCredentials,
        request: &SearchRequest,
        timeout: Duration,
    ) -> SearchOutcome {
        let outcome = match tokio::time::timeout(
            timeout,
            self.search_inner(endpoint, bind_as, request, timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SearchOutcome::Unreachable(format!("Search timed out after {:?}", timeout)),
        };

        let label = match &outcome {
            SearchOutcome::Found(_) => "found",
            SearchOutcome::NotFound => "not_found",
            SearchOutcome::Unreachable(_) => "unreachable",
            SearchOutcome::InvalidServiceCredentials => "invalid_service_credentials",
            SearchOutcome::Failed { .. } => "failed",
        };
        metrics::record_directory_call(endpoint.address(), label);
        outcome
    }

    async fn probe(&self, endpoint: &DirectoryEndpoint, timeout: Duration) -> bool {
        let attempt = async {
            let mut ldap = self.connect(endpoint, timeout).await?;
            let _ = ldap.unbind().await;
            Ok::<(), String>(())
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "Probe timed out");
                false
            }
        }
    }
}

fn classify_bind(rc: u32, text: &str) -> BindOutcome {
    match rc {
        RC_SUCCESS => BindOutcome::Ok,
        RC_BUSY | RC_UNAVAILABLE => BindOutcome::Unreachable(format!("rc={} {}", rc, text)),
        _ => BindOutcome::InvalidCredentials,
    }
}

/// Only a successful search with no entries means absence. noSuchObject (32)
/// refers to the base DN, so it is a failure like any other code.
fn classify_search(rc: u32, text: &str, entries: Vec<DirectoryEntry>) -> SearchOutcome {
    match rc {
        RC_SUCCESS | RC_SIZE_LIMIT_EXCEEDED if entries.is_empty() => SearchOutcome::NotFound,
        RC_SUCCESS | RC_SIZE_LIMIT_EXCEEDED => SearchOutcome::Found(entries),
        RC_BUSY | RC_UNAVAILABLE => SearchOutcome::Unreachable(format!("rc={} {}", rc, text)),
        _ => SearchOutcome::Failed {
            code: rc,
            message: text.to_string(),
        },
    }
}

fn build_tls_config(trust: &TrustMaterial) -> AuthResult<ClientConfig> {
    let mut roots = RootCertStore::empty();

    match &trust.ca_cert_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(&cert)
                    .map_err(|e| AuthError::Tls(format!("Invalid CA certificate in {:?}: {}", path, e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| AuthError::Tls(format!("Failed to load native roots: {}", e)))?;
            let der: Vec<Vec<u8>> = native.into_iter().map(|c| c.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&der);
            debug!(added, ignored, "Loaded native trust roots");
        }
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    match (&trust.client_cert_path, &trust.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| AuthError::Tls(format!("Invalid client identity: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => {
            warn!("Client certificate and key must both be set; presenting no client identity");
            Ok(builder.with_no_client_auth())
        }
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> AuthResult<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| AuthError::Tls(format!("Failed to open certificate file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
        .map_err(|e| AuthError::Tls(format!("Failed to parse certificates: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(AuthError::Tls(format!("No certificates found in {:?}", path)));
    }

    Ok(certs)
}

/// Load the first private key (PKCS#8, RSA or SEC1) from a PEM file
fn load_private_key(path: &Path) -> AuthResult<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| AuthError::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| AuthError::Tls(format!("Failed to parse private key: {}", e)))?;

    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| AuthError::Tls(format!("No private key found in {:?}", path)))
}
