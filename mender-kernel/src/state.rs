use crate::failures::FailureLog;
use crate::health::HealthTracker;
use crate::heartbeat::SharedHeartbeats;
use crate::registry::SharedRegistry;
use crate::remediation::Remediator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Handles shared by every listener (worker channels and admin API).
#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub heartbeats: SharedHeartbeats,
    pub failures: FailureLog,
    pub remediator: Remediator,
    pub health_tracker: HealthTracker,
    pub liveness_timeout: Duration,
    pub api_key: Option<Arc<str>>,
}
