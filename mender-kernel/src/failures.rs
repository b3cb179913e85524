/**
 * FAILURE LOG - Durable, append-only record of ERROR/FATAL worker lines
 *
 * OPERATION:
 * - Every entry is framed with the app that produced it:
 *     ============================================================
 *     Application: <app>
 *     ============================================================
 *     <line>
 * - A single writer task owns the file. Stream handlers only push commands
 *   onto its channel, so concurrent failures never interleave and a slow disk
 *   never stalls a log stream.
 * - Readers (admin API, remediation context) go straight to the file after a
 *   flush barrier that waits for every previously queued append.
 */

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

pub const FRAME_RULE: &str = "============================================================";

enum LogCommand {
    Append { app: String, line: String },
    Flush(oneshot::Sender<()>),
    Clear(oneshot::Sender<io::Result<()>>),
}

/// One framed entry read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    pub app: String,
    pub body: String,
}

/// Handle to the failure log; cheap to clone.
#[derive(Clone)]
pub struct FailureLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl FailureLog {
    /// Starts the writer task. Must be called inside a tokio runtime.
    pub fn spawn<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a framed entry; never waits on the disk.
    pub fn append(&self, app: &str, line: &str) {
        let cmd = LogCommand::Append { app: app.to_string(), line: line.to_string() };
        if self.tx.send(cmd).is_err() {
            error!(app = %app, "failure log writer is gone, entry lost");
        }
    }

    /// Resolves once every append queued before this call hit the file.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Truncates the log (serialized with pending appends).
    pub async fn clear(&self) -> io::Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogCommand::Clear(ack))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "failure log writer stopped"))?;
        done.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "failure log writer stopped"))?
    }

    /// Whole log text; empty when nothing was ever written.
    pub async fn read_all(&self) -> io::Result<String> {
        self.flush().await;
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Last `limit` entries written for `app`, re-framed.
    pub async fn recent_context(&self, app: &str, limit: usize) -> io::Result<String> {
        let text = self.read_all().await?;
        let entries: Vec<FailureEntry> = parse_entries(&text)
            .into_iter()
            .filter(|entry| entry.app == app)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..]
            .iter()
            .map(|entry| frame(&entry.app, &entry.body))
            .collect())
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Append { app, line } => {
                if let Err(e) = append_frame(&path, &app, &line).await {
                    error!(path = %path.display(), app = %app, "failed to append failure entry: {e}");
                } else {
                    debug!(app = %app, "failure entry persisted");
                }
            }
            LogCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            LogCommand::Clear(ack) => {
                let _ = ack.send(fs::write(&path, b"").await);
            }
        }
    }
}

async fn append_frame(path: &Path, app: &str, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(frame(app, line).as_bytes()).await?;
    file.flush().await
}

/// Renders one framed entry, newline-terminated.
pub fn frame(app: &str, line: &str) -> String {
    let mut out = format!("{FRAME_RULE}\nApplication: {app}\n{FRAME_RULE}\n{line}");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn header_at<'a>(lines: &[&'a str], i: usize) -> Option<&'a str> {
    if *lines.get(i)? != FRAME_RULE || *lines.get(i + 2)? != FRAME_RULE {
        return None;
    }
    lines[i + 1].strip_prefix("Application: ")
}

/// Splits log text back into entries. Text before the first frame is ignored.
pub fn parse_entries(text: &str) -> Vec<FailureEntry> {
    let lines: Vec<&str> = text.lines().collect();
    let mut entries = Vec::new();
    let mut current: Option<FailureEntry> = None;
    let mut i = 0;

    while i < lines.len() {
        if let Some(app) = header_at(&lines, i) {
            entries.extend(current.take());
            current = Some(FailureEntry { app: app.to_string(), body: String::new() });
            i += 3;
            continue;
        }
        if let Some(entry) = current.as_mut() {
            entry.body.push_str(lines[i]);
            entry.body.push('\n');
        }
        i += 1;
    }
    entries.extend(current);
    entries
}
