/**
 * KERNEL BOOTSTRAP - Wires the shared state and starts every listener
 *
 * Binds the three worker channels and the admin API, then spawns their
 * servers together with the health publisher. Failing to bind is the only
 * fatal error; afterwards every failure stays local to a connection or job.
 * Port 0 is accepted anywhere, the bound addresses are reported back.
 */

use crate::backup::SourceTree;
use crate::config::KernelConfig;
use crate::failures::FailureLog;
use crate::fixer::Fixer;
use crate::health::HealthTracker;
use crate::heartbeat::HeartbeatTracker;
use crate::http::build_router;
use crate::knowledge::KnowledgeBase;
use crate::registry::IdentityRegistry;
use crate::remediation::Remediator;
use crate::state::AppState;
use crate::ws::{heartbeat_router, identity_router, stream_router};
use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A started kernel; dropping it stops every task.
pub struct RunningKernel {
    pub identity_addr: SocketAddr,
    pub heartbeat_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningKernel {
    /// Resolves when any server task ends.
    pub async fn wait(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let tasks = std::mem::take(&mut self.tasks);
        let (_, _, rest) = futures::future::select_all(tasks).await;
        self.tasks = rest;
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RunningKernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {what} listener on {addr}"))
}

fn serve(listener: TcpListener, router: Router, what: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!(listener = what, "server stopped: {e}");
        }
    })
}

fn open_knowledge(config: &KernelConfig) -> Option<Arc<KnowledgeBase>> {
    let path = config.remediation.knowledge_base.as_ref()?;
    match KnowledgeBase::open(path) {
        Ok(kb) => Some(Arc::new(kb)),
        Err(e) => {
            warn!("knowledge base disabled: {e}");
            None
        }
    }
}

/// Starts the kernel with `fixer` as the remediation backend.
pub async fn start(config: &KernelConfig, fixer: Arc<dyn Fixer>) -> Result<RunningKernel> {
    config.validate().context("invalid configuration")?;

    let identity = bind(config.listen.identity, "identity").await?;
    let heartbeat = bind(config.listen.heartbeat, "heartbeat").await?;
    let stream = bind(config.listen.stream, "log stream").await?;
    let admin = bind(config.listen.admin, "admin").await?;

    let failures = FailureLog::spawn(&config.failure_log);
    let sources = SourceTree::new(
        &config.remediation.source_dir,
        config.remediation.source_extensions.clone(),
    );
    let mut remediator = Remediator::new(fixer, sources, failures.clone())
        .with_fixer_timeout(config.fixer_timeout())
        .with_context_entries(config.remediation.context_entries)
        .with_history_limit(config.remediation.history_limit);
    if let Some(kb) = open_knowledge(config) {
        remediator = remediator.with_knowledge(kb);
    }

    let api_key: Option<Arc<str>> = config
        .admin
        .api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(Arc::from);
    if api_key.is_none() {
        warn!("no admin api key configured, admin API is open");
    }

    let state = AppState {
        registry: IdentityRegistry::shared(),
        heartbeats: HeartbeatTracker::shared(),
        failures,
        remediator,
        health_tracker: HealthTracker::new(),
        liveness_timeout: config.liveness_timeout(),
        api_key,
    };

    let kernel = RunningKernel {
        identity_addr: identity.local_addr()?,
        heartbeat_addr: heartbeat.local_addr()?,
        stream_addr: stream.local_addr()?,
        admin_addr: admin.local_addr()?,
        state: state.clone(),
        tasks: vec![
            serve(identity, identity_router(state.clone()), "identity"),
            serve(heartbeat, heartbeat_router(state.clone()), "heartbeat"),
            serve(stream, stream_router(state.clone()), "log stream"),
            serve(admin, build_router(state.clone()), "admin"),
            state.health_tracker.spawn_health_publisher(
                state.registry.clone(),
                state.heartbeats.clone(),
                config.health_sink.clone(),
                config.publish_interval(),
                config.liveness_timeout(),
            ),
        ],
    };

    info!(
        identity = %kernel.identity_addr,
        heartbeat = %kernel.heartbeat_addr,
        stream = %kernel.stream_addr,
        admin = %kernel.admin_addr,
        "kernel listening"
    );
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixer::UnconfiguredFixer;

    fn ephemeral_config(dir: &std::path::Path) -> KernelConfig {
        let mut config = KernelConfig::default();
        let local = SocketAddr::from(([127, 0, 0, 1], 0));
        config.listen.identity = local;
        config.listen.heartbeat = local;
        config.listen.stream = local;
        config.listen.admin = local;
        config.health_sink = None;
        config.failure_log = dir.join("log.txt");
        config.remediation.source_dir = dir.to_path_buf();
        config.remediation.knowledge_base = Some(dir.join("kb.json"));
        config
    }

    #[tokio::test]
    async fn test_start_binds_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = start(&ephemeral_config(dir.path()), Arc::new(UnconfiguredFixer)).await.unwrap();
        let ports = [
            kernel.identity_addr.port(),
            kernel.heartbeat_addr.port(),
            kernel.stream_addr.port(),
            kernel.admin_addr.port(),
        ];
        assert!(ports.iter().all(|p| *p != 0));
        let unique: std::collections::BTreeSet<u16> = ports.into_iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(kernel.state.remediator.knowledge().is_some());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = ephemeral_config(dir.path());
        config.listen.stream = taken.local_addr().unwrap();

        let err = start(&config, Arc::new(UnconfiguredFixer)).await.err().unwrap();
        assert!(err.to_string().contains("log stream"), "{err}");
    }
}
