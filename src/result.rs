//! Uniform command outcome
//!
//! Every adapter reports a finished command through [`ExecResult`], whatever
//! the backing transport was. Reserved exit codes: `-1` killed before exit,
//! `124` timeout, `125` target (container/pod) not found.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{Error, Result};

/// Exit code used when a command was killed before producing one.
pub const EXIT_KILLED: i32 = -1;

/// Exit code used when the engine timed a command out.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code used when the execution target does not exist.
pub const EXIT_TARGET_NOT_FOUND: i32 = 125;

/// One captured stream plus its truncation marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Set when `max_buffer` was hit and the tail was dropped.
    pub truncated: bool,
}

impl CapturedStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            truncated: false,
        }
    }

    /// Lossy UTF-8 view of the captured bytes.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// The uniform outcome of one executed command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured stdout (empty when the sink was not `Pipe`).
    pub stdout: CapturedStream,

    /// Captured stderr (empty when the sink was not `Pipe`).
    pub stderr: CapturedStream,

    /// Raw exit code, or one of the reserved codes above.
    pub exit_code: i32,

    /// Terminating signal name, if the process died on one.
    pub signal: Option<String>,

    /// The executed command line, already masked.
    pub command: String,

    /// Wall-clock execution time.
    pub duration: Duration,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    /// Name of the adapter that ran the command.
    pub adapter: &'static str,

    /// Remote host, for SSH-backed executions.
    pub host: Option<String>,

    /// Container or pod identifier, for Docker/Kubernetes executions.
    pub container: Option<String>,
}

impl ExecResult {
    /// Success means a zero exit code and no terminating signal.
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Trimmed UTF-8 stdout.
    pub fn text(&self) -> String {
        self.stdout.as_text().trim().to_string()
    }

    /// Stdout split on `\n`, with a trailing empty line dropped.
    pub fn lines(&self) -> Vec<String> {
        let text = self.stdout.as_text().into_owned();
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines
    }

    /// Parse stdout as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.stdout.bytes)
            .map_err(|e| Error::InvalidArgument(format!("stdout is not valid JSON: {}", e)))
    }

    /// `true` when the command succeeded. Never fails.
    pub fn succeeds(&self) -> bool {
        self.ok()
    }

    /// `true` when the command failed. Never fails.
    pub fn fails(&self) -> bool {
        !self.ok()
    }
}

impl std::fmt::Display for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ok() {
            write!(f, "[{}] ok in {:?}: {}", self.adapter, self.duration, self.command)
        } else if let Some(signal) = &self.signal {
            write!(
                f,
                "[{}] killed by {} (exit {}): {}",
                self.adapter, signal, self.exit_code, self.command
            )
        } else {
            write!(
                f,
                "[{}] exit {}: {}",
                self.adapter, self.exit_code, self.command
            )
        }
    }
}

/// Builder-style constructor used by adapters.
///
/// Timing is stamped here so adapters only report what they measured.
pub struct ResultBuilder {
    adapter: &'static str,
    command: String,
    started_at: DateTime<Utc>,
    host: Option<String>,
    container: Option<String>,
}

impl ResultBuilder {
    pub fn new(adapter: &'static str, command: impl Into<String>) -> Self {
        Self {
            adapter,
            command: command.into(),
            started_at: Utc::now(),
            host: None,
            container: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn finish(
        self,
        stdout: CapturedStream,
        stderr: CapturedStream,
        exit_code: i32,
        signal: Option<String>,
    ) -> ExecResult {
        let ended_at = Utc::now();
        let duration = (ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        ExecResult {
            stdout,
            stderr,
            exit_code,
            signal,
            command: self.command,
            duration,
            started_at: self.started_at,
            ended_at,
            adapter: self.adapter,
            host: self.host,
            container: self.container,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_stdout(bytes: &[u8]) -> ExecResult {
        ResultBuilder::new("mock", "echo test").finish(
            CapturedStream::new(bytes.to_vec()),
            CapturedStream::default(),
            0,
            None,
        )
    }

    #[test]
    fn test_ok_and_projections() {
        let result = result_with_stdout(b"hello world\n");
        assert!(result.ok());
        assert!(result.succeeds());
        assert!(!result.fails());
        assert_eq!(result.text(), "hello world");
    }

    #[test]
    fn test_lines_drops_trailing_empty() {
        let result = result_with_stdout(b"a\nb\nc\n");
        assert_eq!(result.lines(), vec!["a", "b", "c"]);

        let no_trailing = result_with_stdout(b"a\nb");
        assert_eq!(no_trailing.lines(), vec!["a", "b"]);
    }

    #[test]
    fn test_json_projection() {
        let result = result_with_stdout(b"{\"name\": \"xec\", \"count\": 3}");
        let value = result.json().unwrap();
        assert_eq!(value["name"], "xec");
        assert_eq!(value["count"], 3);

        let bad = result_with_stdout(b"not json");
        assert!(bad.json().is_err());
    }

    #[test]
    fn test_signal_means_failure() {
        let result = ResultBuilder::new("local", "sleep 10").finish(
            CapturedStream::default(),
            CapturedStream::default(),
            EXIT_KILLED,
            Some("SIGTERM".to_string()),
        );
        assert!(!result.ok());
        assert!(result.fails());
        assert!(result.to_string().contains("SIGTERM"));
    }
}
