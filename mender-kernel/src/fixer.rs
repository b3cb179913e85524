//! Fixer capability consumed by the remediation orchestrator.
//!
//! The kernel only knows the contract: faulty source + recent failure log in,
//! replacement source out. `CommandFixer` adapts any external program to that
//! contract (typically an LLM-backed script): the request is written to its
//! stdin as JSON and its stdout is taken as the replacement source.

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Input handed to a fixer.
#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    pub app: String,
    pub source: String,
    pub logs: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FixerError {
    #[error("no fixer configured")]
    NotConfigured,
    #[error("invalid fixer command {command:?}: {reason}")]
    BadCommand { command: String, reason: String },
    #[error("fixer I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode fix request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("fixer exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("fixer output is not valid UTF-8")]
    Encoding,
    #[error("fixer returned no source")]
    EmptyOutput,
    #[error("fixer rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Fixer: Send + Sync {
    /// Returns replacement source for `request.source`.
    async fn fix(&self, request: &FixRequest) -> Result<String, FixerError>;
}

/// Stand-in used when no fixer command is configured: every job fails fast.
pub struct UnconfiguredFixer;

#[async_trait]
impl Fixer for UnconfiguredFixer {
    async fn fix(&self, _request: &FixRequest) -> Result<String, FixerError> {
        Err(FixerError::NotConfigured)
    }
}

/// Runs an external program per request.
#[derive(Debug, Clone)]
pub struct CommandFixer {
    program: String,
    args: Vec<String>,
}

impl CommandFixer {
    /// Parses a shell-style command line, e.g. `python3 fixer.py --model flash`.
    pub fn from_command_line(line: &str) -> Result<Self, FixerError> {
        let bad = |reason: String| FixerError::BadCommand { command: line.to_string(), reason };
        let mut words = shell_words::split(line).map_err(|e| bad(e.to_string()))?;
        if words.is_empty() {
            return Err(bad("empty command".into()));
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Fixer for CommandFixer {
    async fn fix(&self, request: &FixRequest) -> Result<String, FixerError> {
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("MENDER_APP", &request.app)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stdin is fed concurrently so a chatty child cannot deadlock on a full pipe
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else { return Ok(()) };
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        let output = output?;

        if !output.status.success() {
            return Err(FixerError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8(output.stdout).map_err(|_| FixerError::Encoding)?;
        let cleaned = clean_output(&text);
        if cleaned.trim().is_empty() {
            return Err(FixerError::EmptyOutput);
        }
        Ok(cleaned)
    }
}

/// Strips Markdown code fences and a leading `python` label from model output.
pub fn clean_output(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    let joined = kept.join("\n");
    let trimmed = joined.trim().trim_matches('`').trim();
    let body = match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim().eq_ignore_ascii_case("python") => rest.trim(),
        _ => trimmed,
    };
    if body.is_empty() {
        return String::new();
    }
    format!("{body}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FixRequest {
        FixRequest {
            app: "worker-A".into(),
            source: "print(1/0)\n".into(),
            logs: "ZeroDivisionError".into(),
        }
    }

    #[test]
    fn test_clean_output_strips_fences() {
        assert_eq!(clean_output("```python\nprint('ok')\n```\n"), "print('ok')\n");
        assert_eq!(clean_output("```\nx = 1\ny = 2\n```"), "x = 1\ny = 2\n");
        assert_eq!(clean_output("python\nx = 1"), "x = 1\n");
        assert_eq!(clean_output("`x = 1`"), "x = 1\n");
        assert_eq!(clean_output("  \n```\n```"), "");
    }

    #[test]
    fn test_command_line_parsing() {
        let fixer = CommandFixer::from_command_line("python3 'my fixer.py' --fast").unwrap();
        assert_eq!(fixer.program(), "python3");
        assert_eq!(fixer.args, vec!["my fixer.py".to_string(), "--fast".to_string()]);
        assert!(matches!(CommandFixer::from_command_line("  "), Err(FixerError::BadCommand { .. })));
        assert!(matches!(CommandFixer::from_command_line("python 'oops"), Err(FixerError::BadCommand { .. })));
    }

    #[tokio::test]
    async fn test_unconfigured_fixer_fails() {
        assert!(matches!(UnconfiguredFixer.fix(&request()).await, Err(FixerError::NotConfigured)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_fixer_reads_stdout() {
        let fixer = CommandFixer::from_command_line(r#"sh -c "cat > /dev/null; printf '```python\nprint(0)\n```\n'""#).unwrap();
        assert_eq!(fixer.fix(&request()).await.unwrap(), "print(0)\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_fixer_sees_request_on_stdin() {
        let fixer = CommandFixer::from_command_line("cat").unwrap();
        let out = fixer.fix(&request()).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(echoed["app"], "worker-A");
        assert_eq!(echoed["logs"], "ZeroDivisionError");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_fixer_reports_failures() {
        let failing = CommandFixer::from_command_line(r#"sh -c "echo nope >&2; exit 3""#).unwrap();
        match failing.fix(&request()).await {
            Err(FixerError::Exited { stderr, .. }) => assert_eq!(stderr, "nope"),
            other => panic!("unexpected result: {other:?}"),
        }

        let silent = CommandFixer::from_command_line("true").unwrap();
        assert!(matches!(silent.fix(&request()).await, Err(FixerError::EmptyOutput)));

        let missing = CommandFixer::from_command_line("/nonexistent/mender-fixer").unwrap();
        assert!(matches!(missing.fix(&request()).await, Err(FixerError::Io(_))));
    }
}
