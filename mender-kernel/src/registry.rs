/**
 * IDENTITY REGISTRY - Instance ids handed out to connecting workers
 *
 * Each worker process asks for an id once, passing its service name. The
 * registry mints a UUID v4, files it under that name and returns it.
 *
 * Entries are never evicted: a worker that restarts gets a new id and the old
 * one stays registered. The liveness evaluator copes with ids that never
 * heartbeat (or stopped doing so).
 */

use crate::models::{InstanceId, ServiceName};
use crate::state::{new_state, Shared};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type SharedRegistry = Shared<IdentityRegistry>;

#[derive(Debug, Default, Clone)]
pub struct IdentityRegistry {
    services: BTreeMap<ServiceName, BTreeSet<InstanceId>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        new_state(Self::new())
    }

    /// Issues a fresh instance id for `service`.
    pub fn register(&mut self, service: &str) -> InstanceId {
        let id = Uuid::new_v4().to_string();
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(id.clone());
        id
    }

    pub fn instances_of(&self, service: &str) -> Option<&BTreeSet<InstanceId>> {
        self.services.get(service)
    }

    /// Iterates `(service, ids)` in name order.
    pub fn services(&self) -> impl Iterator<Item = (&ServiceName, &BTreeSet<InstanceId>)> {
        self.services.iter()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Total number of ids ever issued.
    pub fn len(&self) -> usize {
        self.services.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Name -> ids copy for the admin API.
    pub fn snapshot(&self) -> BTreeMap<ServiceName, Vec<InstanceId>> {
        self.services
            .iter()
            .map(|(name, ids)| (name.clone(), ids.iter().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_issues_distinct_ids_per_call() {
        let mut registry = IdentityRegistry::new();
        let x = registry.register("worker-A");
        let y = registry.register("worker-A");
        assert_ne!(x, y);
        assert!(Uuid::parse_str(&x).is_ok());

        let ids = registry.instances_of("worker-A").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&x) && ids.contains(&y));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.service_count(), 1);
    }

    #[test]
    fn test_ids_belong_to_exactly_one_service() {
        let mut registry = IdentityRegistry::new();
        let a = registry.register("worker-A");
        let b = registry.register("worker-B");

        let owners: Vec<_> = registry
            .services()
            .filter(|(_, ids)| ids.contains(&a))
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(owners, vec!["worker-A".to_string()]);
        assert!(!registry.instances_of("worker-A").unwrap().contains(&b));
    }

    #[test]
    fn test_snapshot_lists_every_service() {
        let mut registry = IdentityRegistry::new();
        assert!(registry.is_empty());
        registry.register("b");
        registry.register("a");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(snapshot["a"].len(), 1);
    }
}
