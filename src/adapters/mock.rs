//! Scripted adapter for tests
//!
//! Commands are matched against programmed rules in registration order; the
//! first match wins. Unmatched commands succeed with empty output. Every
//! execution is recorded for assertion.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Adapter, ExecContext};
use crate::command::Command;
use crate::error::{Error, ErrorKind, Result};
use crate::result::{CapturedStream, ExecResult, ResultBuilder};

/// How a rule matches a command line.
#[derive(Debug, Clone)]
pub enum MockMatcher {
    Exact(String),
    Prefix(String),
    Contains(String),
    Any,
}

impl MockMatcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            MockMatcher::Exact(s) => line == s,
            MockMatcher::Prefix(s) => line.starts_with(s.as_str()),
            MockMatcher::Contains(s) => line.contains(s.as_str()),
            MockMatcher::Any => true,
        }
    }
}

/// What a matched rule produces.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: i32,
    },
    Failure(ErrorKind),
    /// Resolve after a delay, then succeed with the given stdout. Used for
    /// timeout and cancellation tests.
    Slow {
        delay: std::time::Duration,
        stdout: Vec<u8>,
    },
}

impl MockResponse {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        MockResponse::Output {
            stdout: stdout.into(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    pub fn exit(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        MockResponse::Output {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

struct MockRule {
    matcher: MockMatcher,
    response: MockResponse,
    /// Consume the rule after its first match.
    once: bool,
}

#[derive(Default)]
pub struct MockAdapter {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, matcher: MockMatcher, response: MockResponse) {
        self.rules.lock().push(MockRule {
            matcher,
            response,
            once: false,
        });
    }

    /// Register a rule consumed by its first match.
    pub fn on_once(&self, matcher: MockMatcher, response: MockResponse) {
        self.rules.lock().push(MockRule {
            matcher,
            response,
            once: true,
        });
    }

    /// Every command line this adapter has executed, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.rules.lock().clear();
        self.calls.lock().clear();
    }

    fn respond(&self, line: &str) -> MockResponse {
        let mut rules = self.rules.lock();
        if let Some(index) = rules.iter().position(|r| r.matcher.matches(line)) {
            let response = rules[index].response.clone();
            if rules[index].once {
                rules.remove(index);
            }
            return response;
        }
        MockResponse::success(Vec::new())
    }

    fn build_result(&self, line: &str, stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> ExecResult {
        ResultBuilder::new("mock", line).finish(
            CapturedStream::new(stdout),
            CapturedStream::new(stderr),
            exit_code,
            None,
        )
    }

    fn fail(&self, line: &str, kind: ErrorKind) -> Error {
        match kind {
            ErrorKind::ConnectionError => Error::Connection(format!("mock: {}", line)),
            ErrorKind::AuthError => Error::Auth(format!("mock: {}", line)),
            ErrorKind::TargetNotFound => Error::TargetNotFound {
                target: line.to_string(),
                result: None,
            },
            ErrorKind::AdapterUnavailable => Error::AdapterUnavailable {
                adapter: "mock".to_string(),
                reason: line.to_string(),
            },
            ErrorKind::InvalidArgument => Error::InvalidArgument(format!("mock: {}", line)),
            other => Error::Internal(anyhow::anyhow!("mock failure of kind {}", other)),
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let line = command.display_line();
        self.calls.lock().push(line.clone());

        match self.respond(&line) {
            MockResponse::Output {
                stdout,
                stderr,
                exit_code,
            } => {
                if !stdout.is_empty() {
                    ctx.emitter.output(crate::events::StreamKind::Stdout, &stdout);
                }
                if !stderr.is_empty() {
                    ctx.emitter.output(crate::events::StreamKind::Stderr, &stderr);
                }
                Ok(self.build_result(&line, stdout, stderr, exit_code))
            }
            MockResponse::Failure(kind) => Err(self.fail(&line, kind)),
            MockResponse::Slow { delay, stdout } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        Ok(self.build_result(&line, stdout, Vec::new(), 0))
                    }
                    _ = ctx.cancel.cancelled() => {
                        Ok(ResultBuilder::new("mock", &line).finish(
                            CapturedStream::default(),
                            CapturedStream::default(),
                            crate::result::EXIT_KILLED,
                            Some("SIGTERM".to_string()),
                        ))
                    }
                }
            }
        }
    }

    fn execute_sync(&self, command: &Command) -> Result<ExecResult> {
        let line = command.display_line();
        self.calls.lock().push(line.clone());

        match self.respond(&line) {
            MockResponse::Output {
                stdout,
                stderr,
                exit_code,
            } => Ok(self.build_result(&line, stdout, stderr, exit_code)),
            MockResponse::Failure(kind) => Err(self.fail(&line, kind)),
            MockResponse::Slow { stdout, .. } => Ok(self.build_result(&line, stdout, Vec::new(), 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Emitter;
    use crate::events::EventBus;
    use crate::mask::Masker;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecContext {
        ExecContext {
            id: 1,
            cancel: CancellationToken::new(),
            emitter: Emitter::detached(EventBus::new(), Arc::new(Masker::new())),
            kill_grace: Duration::from_millis(100),
            max_buffer: 1024,
        }
    }

    #[tokio::test]
    async fn test_default_success() {
        let adapter = MockAdapter::new();
        let cmd = Command::new("anything");
        let result = adapter.execute(&cmd, &ctx()).await.unwrap();
        assert!(result.ok());
        assert_eq!(adapter.calls(), vec!["anything"]);
    }

    #[tokio::test]
    async fn test_scripted_output() {
        let adapter = MockAdapter::new();
        adapter.on(
            MockMatcher::Prefix("git".into()),
            MockResponse::success(b"main\n".to_vec()),
        );

        let cmd = Command::new("git").arg("branch");
        let result = adapter.execute(&cmd, &ctx()).await.unwrap();
        assert_eq!(result.stdout.bytes, b"main\n");
    }

    #[tokio::test]
    async fn test_once_rule_consumed() {
        let adapter = MockAdapter::new();
        adapter.on_once(MockMatcher::Any, MockResponse::Failure(ErrorKind::ConnectionError));

        let cmd = Command::new("flaky");
        let first = adapter.execute(&cmd, &ctx()).await;
        assert!(matches!(first, Err(Error::Connection(_))));

        let second = adapter.execute(&cmd, &ctx()).await.unwrap();
        assert!(second.ok());
    }

    #[test]
    fn test_sync_path() {
        let adapter = MockAdapter::new();
        adapter.on(MockMatcher::Exact("whoami".into()), MockResponse::success(b"sam\n".to_vec()));
        let result = adapter.execute_sync(&Command::new("whoami")).unwrap();
        assert_eq!(result.stdout.bytes, b"sam\n");
    }
}
