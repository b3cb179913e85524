/*!
Mock Fixer for remediation tests without an external model

Records every request it receives and answers from a script. A gated mock
holds each call until `release` is called, which keeps a remediation job
running for as long as a test needs.
*/

use async_trait::async_trait;
use mender_kernel::{FixRequest, Fixer, FixerError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// What the mock answers.
#[derive(Debug, Clone)]
pub enum MockReply {
    Source(String),
    Fail(String),
    /// Never answers; only the kernel's fixer timeout ends the call.
    Hang,
}

struct Inner {
    reply: Mutex<MockReply>,
    requests: Mutex<Vec<FixRequest>>,
    gated: bool,
    gate: Notify,
    called: Notify,
}

#[derive(Clone)]
pub struct MockFixer {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockFixer {
    fn build(reply: MockReply, gated: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                reply: Mutex::new(reply),
                requests: Mutex::new(Vec::new()),
                gated,
                gate: Notify::new(),
                called: Notify::new(),
            }),
        }
    }

    /// Answers every request with `source`.
    pub fn replying<S: Into<String>>(source: S) -> Self {
        Self::build(MockReply::Source(source.into()), false)
    }

    pub fn failing<S: Into<String>>(reason: S) -> Self {
        Self::build(MockReply::Fail(reason.into()), false)
    }

    pub fn hanging() -> Self {
        Self::build(MockReply::Hang, false)
    }

    /// Like `replying`, but each call waits for `release`.
    pub fn gated<S: Into<String>>(source: S) -> Self {
        Self::build(MockReply::Source(source.into()), true)
    }

    pub fn set_reply(&self, reply: MockReply) {
        *lock(&self.inner.reply) = reply;
    }

    /// Lets one held call answer.
    pub fn release(&self) {
        self.inner.gate.notify_one();
    }

    pub fn requests(&self) -> Vec<FixRequest> {
        lock(&self.inner.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.inner.requests).len()
    }

    pub fn last_request(&self) -> Option<FixRequest> {
        lock(&self.inner.requests).last().cloned()
    }

    /// Waits until the mock has received at least `count` calls.
    pub async fn wait_for_calls(&self, count: usize, within: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let called = self.inner.called.notified();
            if self.call_count() >= count {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, called).await.is_err() {
                anyhow::bail!("expected {count} fixer calls, got {}", self.call_count());
            }
        }
    }

    pub fn clear(&self) {
        lock(&self.inner.requests).clear();
    }
}

#[async_trait]
impl Fixer for MockFixer {
    async fn fix(&self, request: &FixRequest) -> Result<String, FixerError> {
        lock(&self.inner.requests).push(request.clone());
        self.inner.called.notify_waiters();
        log::info!("[mock-fixer] call for {}", request.app);

        if self.inner.gated {
            self.inner.gate.notified().await;
        }
        let reply = lock(&self.inner.reply).clone();
        match reply {
            MockReply::Source(source) => Ok(source),
            MockReply::Fail(reason) => Err(FixerError::Rejected(reason)),
            MockReply::Hang => std::future::pending().await,
        }
    }
}
