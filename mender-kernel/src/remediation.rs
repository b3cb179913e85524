/**
 * REMEDIATION ORCHESTRATOR - Single-flight automated repair of failing workers
 *
 * LIFECYCLE (per job):
 *   Idle -> Running -> Applied | Failed -> Idle
 *
 * OPERATION:
 * - `trigger` is called by the log stream on every ERROR/FATAL line. It tries
 *   to take the single-flight guard; while a job runs, triggers are dropped
 *   and counted, never queued or retried.
 * - A job resolves the app's source file, reads it, gathers the app's recent
 *   failure-log entries and asks the `Fixer` for a replacement within
 *   `fixer_timeout`. A usable replacement is applied only after a backup of
 *   the current file was written.
 * - The guard is released when it is dropped, whatever path the job took
 *   (error, timeout, panic). A guard dropped without an outcome records the
 *   job as aborted.
 */

use crate::backup::{BackupError, SourceTree};
use crate::failures::FailureLog;
use crate::fixer::{FixRequest, Fixer, FixerError};
use crate::knowledge::KnowledgeBase;
use crate::logline::Severity;
use crate::models::rfc3339_now;
use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("{0}")]
    Source(BackupError),
    #[error("cannot read source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read failure log: {0}")]
    Context(#[source] io::Error),
    #[error("fixer failed: {0}")]
    Fixer(#[from] FixerError),
    #[error("fixer timed out after {0:?}")]
    Timeout(Duration),
    #[error("fixer returned the source unchanged")]
    Unchanged,
    #[error("backup failed: {0}")]
    Backup(BackupError),
    #[error("cannot write source {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: u64,
    pub app: String,
    pub severity: String,
    pub line: String,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Applied { backup: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub job: JobInfo,
    pub outcome: JobOutcome,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationStatus {
    pub phase: Phase,
    pub current: Option<JobInfo>,
    pub dropped_triggers: u64,
    pub completed_jobs: u64,
    /// Oldest first.
    pub history: Vec<JobRecord>,
}

#[derive(Debug, Default)]
struct Flight {
    current: Option<JobInfo>,
    next_id: u64,
    dropped: u64,
    history: VecDeque<JobRecord>,
}

/// Held for the lifetime of one job.
struct FlightGuard {
    flight: Shared<Flight>,
    completed: Arc<watch::Sender<u64>>,
    history_limit: usize,
    outcome: Option<JobOutcome>,
}

impl FlightGuard {
    fn finish(mut self, outcome: JobOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| JobOutcome::Failed { reason: "aborted".into() });
        {
            let mut flight = self.flight.lock();
            if let Some(job) = flight.current.take() {
                flight.history.push_back(JobRecord { job, outcome, finished_at: rfc3339_now() });
                while flight.history.len() > self.history_limit {
                    flight.history.pop_front();
                }
            }
        }
        self.completed.send_modify(|n| *n += 1);
    }
}

#[derive(Clone)]
pub struct Remediator {
    flight: Shared<Flight>,
    completed: Arc<watch::Sender<u64>>,
    fixer: Arc<dyn Fixer>,
    sources: SourceTree,
    failures: FailureLog,
    knowledge: Option<Arc<KnowledgeBase>>,
    fixer_timeout: Duration,
    context_entries: usize,
    history_limit: usize,
}

impl Remediator {
    pub fn new(fixer: Arc<dyn Fixer>, sources: SourceTree, failures: FailureLog) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            flight: new_state(Flight::default()),
            completed: Arc::new(completed),
            fixer,
            sources,
            failures,
            knowledge: None,
            fixer_timeout: Duration::from_secs(120),
            context_entries: 20,
            history_limit: 32,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_fixer_timeout(mut self, timeout: Duration) -> Self {
        self.fixer_timeout = timeout;
        self
    }

    pub fn with_context_entries(mut self, entries: usize) -> Self {
        self.context_entries = entries;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn sources(&self) -> &SourceTree {
        &self.sources
    }

    pub fn knowledge(&self) -> Option<&Arc<KnowledgeBase>> {
        self.knowledge.as_ref()
    }

    fn try_acquire(&self, app: &str, severity: &Severity, line: &str) -> Option<FlightGuard> {
        let mut flight = self.flight.lock();
        if let Some(running) = flight.current.as_ref().map(|job| job.app.clone()) {
            flight.dropped += 1;
            debug!(app = %app, running = %running, "remediation busy");
            return None;
        }
        flight.next_id += 1;
        flight.current = Some(JobInfo {
            id: flight.next_id,
            app: app.to_string(),
            severity: severity.to_string(),
            line: line.to_string(),
            started_at: rfc3339_now(),
        });
        Some(FlightGuard {
            flight: self.flight.clone(),
            completed: self.completed.clone(),
            history_limit: self.history_limit,
            outcome: None,
        })
    }

    /// Starts a job for `app` unless one is already running.
    /// Returns false when the trigger was dropped.
    pub fn trigger(&self, app: &str, severity: &Severity, line: &str) -> bool {
        let Some(guard) = self.try_acquire(app, severity, line) else {
            warn!(app = %app, "remediation already in progress, trigger dropped");
            return false;
        };
        info!(app = %app, severity = %severity, "remediation started");

        let this = self.clone();
        let app = app.to_string();
        tokio::spawn(async move {
            let outcome = match this.remediate(&app).await {
                Ok(backup) => {
                    info!(app = %app, backup = %backup.display(), "fix applied");
                    JobOutcome::Applied { backup }
                }
                Err(e) => {
                    warn!(app = %app, "remediation failed: {e}");
                    JobOutcome::Failed { reason: e.to_string() }
                }
            };
            guard.finish(outcome);
        });
        true
    }

    async fn remediate(&self, app: &str) -> Result<PathBuf, RemediationError> {
        let path = self.sources.resolve(app).await.map_err(RemediationError::Source)?;
        let source = fs::read_to_string(&path)
            .await
            .map_err(|source| RemediationError::Read { path: path.clone(), source })?;
        let logs = self
            .failures
            .recent_context(app, self.context_entries)
            .await
            .map_err(RemediationError::Context)?;

        let request = FixRequest { app: app.to_string(), source, logs };
        debug!(app = %app, path = %path.display(), "asking fixer");
        let fixed = tokio::time::timeout(self.fixer_timeout, self.fixer.fix(&request))
            .await
            .map_err(|_| RemediationError::Timeout(self.fixer_timeout))??;

        if fixed.trim_end() == request.source.trim_end() {
            return Err(RemediationError::Unchanged);
        }

        let backup = self.sources.create_backup(&path).await.map_err(RemediationError::Backup)?;
        fs::write(&path, &fixed)
            .await
            .map_err(|source| RemediationError::Write { path: path.clone(), source })?;

        if let Some(kb) = &self.knowledge {
            if let Err(e) = kb.record(app, &request.source, &fixed).await {
                warn!(app = %app, "cannot record fix in knowledge base: {e}");
            }
        }
        Ok(backup)
    }

    pub fn is_running(&self) -> bool {
        self.flight.lock().current.is_some()
    }

    pub fn status(&self) -> RemediationStatus {
        let completed_jobs = *self.completed.borrow();
        let flight = self.flight.lock();
        RemediationStatus {
            phase: if flight.current.is_some() { Phase::Running } else { Phase::Idle },
            current: flight.current.clone(),
            dropped_triggers: flight.dropped,
            completed_jobs,
            history: flight.history.iter().cloned().collect(),
        }
    }

    /// Resolves once at least `count` jobs have finished.
    pub async fn wait_for_completed(&self, count: u64) {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}
