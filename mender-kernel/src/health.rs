/**
 * LIVENESS & HEALTH PUBLISHER - Periodic freshness reports for every worker
 *
 * EVALUATION:
 * - Every registered instance with a recorded heartbeat is evaluated:
 *   fresh when `now - last_seen < liveness_timeout`, stale otherwise.
 * - Instances that never heartbeated (or sent Exit) are left out, and so is
 *   a service with no evaluated instance.
 *
 * PUBLICATION:
 * - Each cycle connects to the health sink as a WebSocket client, sends the
 *   report as one JSON text message and closes. An unreachable sink costs one
 *   warning per outage; the cycle keeps running.
 * - The push runs on its own task so a slow sink never delays the next
 *   evaluation. At most one push is in flight; ticks during it only evaluate.
 * - The latest report and counters are kept for `/api/health` and
 *   `/system/health`.
 */

use crate::config::SinkConf;
use crate::heartbeat::{HeartbeatTracker, SharedHeartbeats};
use crate::models::{rfc3339_now, HealthReport, InstanceHealth, ServiceName};
use crate::registry::{IdentityRegistry, SharedRegistry};
use crate::remediation::{Phase, Remediator};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot encode report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),
}

/// Builds a report of every evaluable instance at `now`.
pub fn evaluate(
    registry: &IdentityRegistry,
    heartbeats: &HeartbeatTracker,
    now: OffsetDateTime,
    timeout: Duration,
) -> HealthReport {
    let mut apps = Vec::new();
    for (service, ids) in registry.services() {
        let instances: InstanceHealth = ids
            .iter()
            .filter_map(|id| {
                let last = heartbeats.last_seen(id)?;
                Some((id.clone(), now - last < timeout))
            })
            .collect();
        if !instances.is_empty() {
            apps.push(BTreeMap::from([(ServiceName::clone(service), instances)]));
        }
    }
    let timestamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| rfc3339_now());
    HealthReport { timestamp, apps }
}

/// Sends one report to `uri` and closes the connection.
pub async fn push_report(uri: &str, report: &HealthReport, limit: Duration) -> Result<(), SinkError> {
    let payload = serde_json::to_string(report)?;
    let exchange = async {
        let (mut ws, _) = tokio_tungstenite::connect_async(uri).await.map_err(Box::new)?;
        ws.send(Message::Text(payload.into())).await.map_err(Box::new)?;
        // the report is delivered once sent; a racing close from the sink is fine
        let _ = ws.close(None).await;
        Ok::<(), SinkError>(())
    };
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| SinkError::Timeout(limit))?
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub services_registered: usize,
    pub instances_registered: usize,
    pub instances_tracked: usize,
    pub memory_usage_mb: f32,
    pub sink_status: String,
    pub reports_evaluated: u64,
    pub reports_published: u64,
    pub publish_failures: u64,
    pub remediation_phase: Phase,
    pub remediations_completed: u64,
    pub dropped_triggers: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    published: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    evaluations: Arc<AtomicU64>,
    pushing: Arc<AtomicBool>,
    sink_status: Arc<parking_lot::Mutex<String>>,
    latest: Arc<parking_lot::Mutex<Option<HealthReport>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            published: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            evaluations: Arc::new(AtomicU64::new(0)),
            pushing: Arc::new(AtomicBool::new(false)),
            sink_status: Arc::new(parking_lot::Mutex::new("pending".to_string())),
            latest: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.lock().clone()
    }

    pub fn sink_status(&self) -> String {
        self.sink_status.lock().clone()
    }

    fn store(&self, report: HealthReport) {
        *self.latest.lock() = Some(report);
    }

    fn mark_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut status = self.sink_status.lock();
        if *status == "unreachable" {
            info!("health sink reachable again");
        }
        *status = "ok".to_string();
    }

    fn mark_failed(&self, uri: &str, err: &SinkError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut status = self.sink_status.lock();
        if *status == "unreachable" {
            debug!(sink = %uri, "health push failed: {err}");
        } else {
            warn!(sink = %uri, "health push failed: {err}");
        }
        *status = "unreachable".to_string();
    }

    pub fn get_health(
        &self,
        registry: &SharedRegistry,
        heartbeats: &SharedHeartbeats,
        remediator: &Remediator,
    ) -> KernelHealth {
        let (services_registered, instances_registered) = {
            let reg = registry.lock();
            (reg.service_count(), reg.len())
        };
        let instances_tracked = heartbeats.lock().len();
        let remediation = remediator.status();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            services_registered,
            instances_registered,
            instances_tracked,
            memory_usage_mb: get_memory_usage_mb(),
            sink_status: self.sink_status(),
            reports_evaluated: self.evaluations.load(Ordering::Relaxed),
            reports_published: self.published.load(Ordering::Relaxed),
            publish_failures: self.failures.load(Ordering::Relaxed),
            remediation_phase: remediation.phase,
            remediations_completed: remediation.completed_jobs,
            dropped_triggers: remediation.dropped_triggers,
        }
    }

    /// Evaluates now and stores the result as the latest report.
    pub fn evaluate_now(
        &self,
        registry: &SharedRegistry,
        heartbeats: &SharedHeartbeats,
        timeout: Duration,
    ) -> HealthReport {
        let report = {
            let reg = registry.lock();
            let beats = heartbeats.lock();
            evaluate(&reg, &beats, OffsetDateTime::now_utc(), timeout)
        };
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.store(report.clone());
        report
    }

    /// Starts the evaluate-and-push cycle.
    pub fn spawn_health_publisher(
        &self,
        registry: SharedRegistry,
        heartbeats: SharedHeartbeats,
        sink: Option<SinkConf>,
        every: Duration,
        liveness_timeout: Duration,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        if sink.is_none() {
            *tracker.sink_status.lock() = "disabled".to_string();
            info!("no health sink configured, reports stay local");
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let report = tracker.evaluate_now(&registry, &heartbeats, liveness_timeout);
                let Some(sink) = &sink else { continue };

                if tracker.pushing.swap(true, Ordering::AcqRel) {
                    debug!("previous health push still in flight, skipping");
                    continue;
                }
                let pusher = tracker.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    match push_report(&sink.uri, &report, Duration::from_secs(sink.timeout_secs)).await {
                        Ok(()) => {
                            pusher.mark_published();
                            debug!(services = report.apps.len(), "health report published");
                        }
                        Err(e) => pusher.mark_failed(&sink.uri, &e),
                    }
                    pusher.pushing.store(false, Ordering::Release);
                });
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
