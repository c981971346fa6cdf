//! Endpoint health tracking
//!
//! Handles:
//! - Deterministic endpoint selection in configured order
//! - Marking endpoints unhealthy on transport failure, healthy on any answer
//! - Reconciling with the configured endpoint list
//! - Background re-probing of unhealthy endpoints

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ldapbridge_core::types::{DirectoryEndpoint, DirectoryStatus, EndpointHealth, EndpointStatus};
use ldapbridge_core::{AuthConfig, ConfigStore};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::DirectoryClient;
use crate::error::{AuthError, AuthResult};
use crate::metrics;

#[derive(Debug, Clone)]
struct EndpointRecord {
    endpoint: DirectoryEndpoint,
    health: EndpointHealth,
    consecutive_failures: u32,
    last_change: Option<DateTime<Utc>>,
}

impl EndpointRecord {
    fn new(endpoint: DirectoryEndpoint) -> Self {
        metrics::set_endpoint_health(endpoint.address(), true);
        Self {
            endpoint,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            last_change: None,
        }
    }

    fn status(&self) -> EndpointStatus {
        EndpointStatus {
            url: self.endpoint.url.clone(),
            tls_mode: self.endpoint.tls_mode,
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            last_change: self.last_change,
        }
    }
}

/// Shared, read-mostly registry of directory endpoints
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    records: RwLock<Vec<EndpointRecord>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_endpoints(endpoints: &[DirectoryEndpoint]) -> Self {
        let registry = Self::new();
        registry.replace(endpoints);
        registry
    }

    /// Align the registry with the snapshot's endpoint list. Surviving
    /// endpoints keep their health, new ones start healthy.
    pub fn reconcile(&self, config: &AuthConfig) {
        let unchanged = {
            let records = self.records.read();
            records.len() == config.endpoints.len()
                && records
                    .iter()
                    .zip(&config.endpoints)
                    .all(|(r, e)| &r.endpoint == e)
        };
        if !unchanged {
            self.replace(&config.endpoints);
        }
    }

    fn replace(&self, endpoints: &[DirectoryEndpoint]) {
        let mut records = self.records.write();
        let mut next = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            match records.iter().find(|r| r.endpoint.url == endpoint.url) {
                Some(existing) => next.push(EndpointRecord {
                    endpoint: endpoint.clone(),
                    ..existing.clone()
                }),
                None => {
                    debug!(endpoint = %endpoint, "Endpoint added");
                    next.push(EndpointRecord::new(endpoint.clone()));
                }
            }
        }

        for removed in records.iter().filter(|r| !endpoints.iter().any(|e| e.url == r.endpoint.url)) {
            debug!(endpoint = %removed.endpoint, "Endpoint removed");
        }

        *records = next;
    }

    /// First healthy endpoint in configured order: where the next attempt
    /// starts. Reported by `AuthEngine::active_endpoint`.
    pub fn select_endpoint(&self) -> AuthResult<DirectoryEndpoint> {
        self.records
            .read()
            .iter()
            .find(|r| r.health.is_healthy())
            .map(|r| r.endpoint.clone())
            .ok_or(AuthError::AllEndpointsUnavailable)
    }

    /// Order in which one attempt tries endpoints: healthy ones in
    /// configured order, then unhealthy ones in configured order
    pub fn failover_order(&self) -> AuthResult<Vec<DirectoryEndpoint>> {
        let records = self.records.read();
        if records.is_empty() {
            return Err(AuthError::AllEndpointsUnavailable);
        }

        let healthy = records.iter().filter(|r| r.health.is_healthy());
        let unhealthy = records.iter().filter(|r| !r.health.is_healthy());
        Ok(healthy.chain(unhealthy).map(|r| r.endpoint.clone()).collect())
    }

    /// Record a round trip. `ok = false` means a transport failure.
    pub fn record_outcome(&self, endpoint: &DirectoryEndpoint, ok: bool) {
        let mut records = self.records.write();
        let Some(record) = records.iter_mut().find(|r| r.endpoint.url == endpoint.url) else {
            return;
        };

        if ok {
            record.consecutive_failures = 0;
            if !record.health.is_healthy() {
                record.health = EndpointHealth::Healthy;
                record.last_change = Some(Utc::now());
                metrics::set_endpoint_health(endpoint.address(), true);
                info!(endpoint = %endpoint, "Directory endpoint recovered");
            }
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if record.health.is_healthy() {
                record.health = EndpointHealth::Unhealthy;
                record.last_change = Some(Utc::now());
                metrics::set_endpoint_health(endpoint.address(), false);
                warn!(endpoint = %endpoint, "Directory endpoint marked unhealthy");
            }
        }
    }

    pub fn is_healthy(&self, endpoint: &DirectoryEndpoint) -> bool {
        self.records
            .read()
            .iter()
            .any(|r| r.endpoint.url == endpoint.url && r.health.is_healthy())
    }

    pub fn unhealthy_endpoints(&self) -> Vec<DirectoryEndpoint> {
        self.records
            .read()
            .iter()
            .filter(|r| !r.health.is_healthy())
            .map(|r| r.endpoint.clone())
            .collect()
    }

    pub fn endpoints(&self) -> Vec<DirectoryEndpoint> {
        self.records.read().iter().map(|r| r.endpoint.clone()).collect()
    }

    /// Healthy iff at least one endpoint is healthy
    pub fn aggregate_healthy(&self) -> bool {
        self.records.read().iter().any(|r| r.health.is_healthy())
    }

    pub fn status(&self) -> DirectoryStatus {
        DirectoryStatus {
            endpoints: self.records.read().iter().map(EndpointRecord::status).collect(),
        }
    }
}

/// Background task re-probing unhealthy endpoints
pub struct FailureDetector {
    shutdown: Arc<RwLock<bool>>,
    handle: JoinHandle<()>,
}

impl FailureDetector {
    /// Start probing on the snapshot's interval. The interval is re-read
    /// every round, so it can be changed (or set to 0 to pause) at runtime.
    pub fn spawn(
        registry: Arc<EndpointRegistry>,
        client: Arc<dyn DirectoryClient>,
        config: Arc<ConfigStore>,
    ) -> Self {
        let shutdown = Arc::new(RwLock::new(false));
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            loop {
                let snapshot = config.snapshot();
                let interval = snapshot.failure_detector_interval;
                let paused = interval.is_zero();

                tokio::time::sleep(if paused { Duration::from_secs(1) } else { interval }).await;

                if *stop.read() {
                    break;
                }
                if paused {
                    continue;
                }

                let snapshot = config.snapshot();
                registry.reconcile(&snapshot);
                probe_unhealthy(&registry, client.as_ref(), snapshot.timeout).await;
            }

            debug!("Failure detector stopped");
        });

        Self { shutdown, handle }
    }

    pub fn stop(&self) {
        *self.shutdown.write() = true;
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}

/// Probe every unhealthy endpoint once, marking the reachable ones healthy.
/// Returns how many recovered.
pub async fn probe_unhealthy(
    registry: &EndpointRegistry,
    client: &dyn DirectoryClient,
    timeout: Duration,
) -> usize {
    let mut recovered = 0;
    for endpoint in registry.unhealthy_endpoints() {
        if client.probe(&endpoint, timeout).await {
            registry.record_outcome(&endpoint, true);
            recovered += 1;
        } else {
            debug!(endpoint = %endpoint, "Endpoint still unreachable");
        }
    }
    recovered
}
