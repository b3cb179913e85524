/*!
In-process health sink

Accepts the kernel's health-push connections and keeps every report it
receives, so tests can wait for a report matching a predicate.
*/

use anyhow::{Context, Result};
use futures::StreamExt;
use mender_kernel::HealthReport;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Reports {
    received: Mutex<Vec<HealthReport>>,
    arrived: Notify,
}

impl Reports {
    fn list(&self) -> MutexGuard<'_, Vec<HealthReport>> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct HealthSinkStub {
    addr: SocketAddr,
    reports: Arc<Reports>,
    task: JoinHandle<()>,
}

impl HealthSinkStub {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind health sink")?;
        let addr = listener.local_addr()?;
        let reports = Arc::new(Reports::default());

        let task = tokio::spawn({
            let reports = reports.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let reports = reports.clone();
                    tokio::spawn(async move {
                        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
                        while let Some(Ok(msg)) = ws.next().await {
                            let Message::Text(text) = msg else { continue };
                            match serde_json::from_str::<HealthReport>(text.as_str()) {
                                Ok(report) => {
                                    reports.list().push(report);
                                    reports.arrived.notify_waiters();
                                }
                                Err(e) => log::warn!("[sink] unexpected payload: {e}"),
                            }
                        }
                    });
                }
            }
        });

        log::info!("[sink] listening on ws://{addr}");
        Ok(Self { addr, reports, task })
    }

    pub fn uri(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports.list().clone()
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.reports.list().last().cloned()
    }

    /// First report received from now on that satisfies `accept`.
    pub async fn wait_for<F>(&self, within: Duration, accept: F) -> Result<HealthReport>
    where
        F: Fn(&HealthReport) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        let mut seen = self.reports.list().len();
        loop {
            let arrived = self.reports.arrived.notified();
            {
                let list = self.reports.list();
                if let Some(report) = list[seen..].iter().find(|r| accept(r)) {
                    return Ok(report.clone());
                }
                seen = list.len();
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                anyhow::bail!("no matching health report within {within:?}");
            }
        }
    }
}

impl Drop for HealthSinkStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}
