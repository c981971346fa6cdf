//! Metrics for the authentication bridge
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding process.

use ldapbridge_core::types::AuthDecision;
use metrics::{counter, gauge, histogram};

/// Metric names
pub mod names {
    pub const AUTH_ATTEMPTS_TOTAL: &str = "ldapbridge_auth_attempts_total";
    pub const AUTH_DURATION_SECONDS: &str = "ldapbridge_auth_duration_seconds";
    pub const DIRECTORY_CALLS_TOTAL: &str = "ldapbridge_directory_calls_total";
    pub const FALLBACK_HITS_TOTAL: &str = "ldapbridge_fallback_hits_total";
    pub const ENDPOINT_HEALTHY: &str = "ldapbridge_endpoint_healthy";
}

/// Record the final decision of one attempt
pub fn record_decision(decision: &AuthDecision, duration_secs: f64) {
    let (result, reason) = match decision {
        AuthDecision::Accepted(grant) => ("accepted", grant.source.as_str()),
        AuthDecision::Denied(reason) => ("denied", reason.as_str()),
    };

    counter!(
        names::AUTH_ATTEMPTS_TOTAL,
        "result" => result,
        "reason" => reason
    )
    .increment(1);

    histogram!(names::AUTH_DURATION_SECONDS, "result" => result).record(duration_secs);
}

/// Record one directory round trip
pub fn record_directory_call(endpoint: &str, outcome: &'static str) {
    counter!(
        names::DIRECTORY_CALLS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_fallback_hit() {
    counter!(names::FALLBACK_HITS_TOTAL).increment(1);
}

pub fn set_endpoint_health(endpoint: &str, healthy: bool) {
    gauge!(names::ENDPOINT_HEALTHY, "endpoint" => endpoint.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}
