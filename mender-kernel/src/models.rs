use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Worker kind as declared by the worker itself (e.g. "worker-A", "2.py").
pub type ServiceName = String;

/// Identifier minted by the registry for one worker session.
pub type InstanceId = String;

/// Freshness of every evaluated instance of one service.
pub type InstanceHealth = BTreeMap<InstanceId, bool>;

/// Point-in-time liveness snapshot pushed to the health sink.
///
/// Wire shape: `{"timestamp": "...", "apps": [{"<name>": {"<id>": true}}]}`.
/// Only services with at least one evaluated instance appear in `apps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: String,
    pub apps: Vec<BTreeMap<ServiceName, InstanceHealth>>,
}

impl HealthReport {
    /// Freshness of an instance in this report, if it was evaluated.
    pub fn instance(&self, service: &str, id: &str) -> Option<bool> {
        self.apps
            .iter()
            .find_map(|entry| entry.get(service))
            .and_then(|instances| instances.get(id).copied())
    }

    pub fn services(&self) -> Vec<&str> {
        self.apps
            .iter()
            .flat_map(|entry| entry.keys().map(String::as_str))
            .collect()
    }
}

/// Current UTC time as RFC 3339, the format used on every outward timestamp.
pub fn rfc3339_now() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
