/*!
Test harness for the mender kernel

Starts a real kernel with:
- every listener on an ephemeral loopback port
- failure log, sources, backups and knowledge base inside a temp directory
- a `MockFixer` as remediation backend
- an in-process health sink receiving every published report
*/

use crate::mock_fixer::MockFixer;
use crate::sink_stub::HealthSinkStub;
use crate::worker_client::WorkerClient;
use anyhow::{Context, Result};
use mender_kernel::config::SinkConf;
use mender_kernel::failures::{parse_entries, FailureEntry};
use mender_kernel::remediation::RemediationStatus;
use mender_kernel::state::AppState;
use mender_kernel::{start, KernelConfig, RunningKernel};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub kernel: RunningKernel,
    pub fixer: MockFixer,
    pub sink: HealthSinkStub,
    pub config: KernelConfig,
    dir: TempDir,
}

impl TestHarness {
    /// Kernel with a 1 s liveness timeout and a 100 ms publish interval.
    pub async fn start(fixer: MockFixer) -> Result<Self> {
        Self::start_with(fixer, |_| {}).await
    }

    pub async fn start_with<F>(fixer: MockFixer, tweak: F) -> Result<Self>
    where
        F: FnOnce(&mut KernelConfig),
    {
        env_logger::try_init().ok();

        let dir = tempfile::tempdir().context("create temp dir")?;
        let sink = HealthSinkStub::start().await?;

        let local = SocketAddr::from(([127, 0, 0, 1], 0));
        let mut config = KernelConfig::default();
        config.listen.identity = local;
        config.listen.heartbeat = local;
        config.listen.stream = local;
        config.listen.admin = local;
        config.liveness.timeout_secs = 1;
        config.liveness.publish_interval_ms = 100;
        config.health_sink = Some(SinkConf { uri: sink.uri(), timeout_secs: 1 });
        config.failure_log = dir.path().join("log.txt");
        config.remediation.source_dir = dir.path().to_path_buf();
        config.remediation.knowledge_base = Some(dir.path().join("knowledge_base.json"));
        config.remediation.fixer.timeout_secs = 2;
        tweak(&mut config);

        let kernel = start(&config, Arc::new(fixer.clone())).await?;
        log::info!("[harness] kernel up, stream on {}", kernel.stream_addr);
        Ok(Self { kernel, fixer, sink, config, dir })
    }

    pub fn state(&self) -> &AppState {
        &self.kernel.state
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn worker(&self, name: &str) -> WorkerClient {
        WorkerClient::new(name, self.kernel.identity_addr, self.kernel.heartbeat_addr, self.kernel.stream_addr)
    }

    /// Writes a worker source file into the source directory.
    pub fn write_source(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_source(&self, file_name: &str) -> Result<String> {
        let path = self.dir.path().join(file_name);
        std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Names of the backup files currently in the source directory.
    pub fn backups(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.ends_with(".bkp"))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn failure_entries(&self) -> Result<Vec<FailureEntry>> {
        let text = self.state().failures.read_all().await?;
        Ok(parse_entries(&text))
    }

    pub fn remediation(&self) -> RemediationStatus {
        self.state().remediator.status()
    }

    /// Waits until `count` remediation jobs have finished.
    pub async fn wait_for_jobs(&self, count: u64) -> Result<RemediationStatus> {
        tokio::time::timeout(WAIT, self.state().remediator.wait_for_completed(count))
            .await
            .with_context(|| format!("{count} remediation jobs did not finish"))?;
        Ok(self.remediation())
    }

    /// Polls `check` against the kernel state until it holds.
    pub async fn wait_until<F>(&self, what: &str, check: F) -> Result<()>
    where
        F: Fn(&AppState) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < WAIT {
            if check(self.state()) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("[harness] timeout waiting for {what}");
        anyhow::bail!("timeout waiting for {what}")
    }
}

/// Declares a tokio test running `$body` against a fresh harness.
/// The body may use `?`; an error fails the test.
#[macro_export]
macro_rules! kernel_test {
    ($name:ident, $fixer:expr, |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() {
            let $harness = $crate::test_utils::TestHarness::start($fixer)
                .await
                .expect("harness start");
            let result = async { $body Ok::<(), anyhow::Error>(()) }.await;
            if let Err(e) = result {
                panic!("Test '{}' failed: {e:#}", stringify!($name));
            }
        }
    };
}
