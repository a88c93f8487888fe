//! Execution engine
//!
//! The front-facing coordinator: selects the adapter from the command's
//! target, merges defaults, applies retry and timeout policy, masks
//! everything that leaves, emits lifecycle events and owns adapter disposal.

pub mod limiter;

pub use limiter::{Limiter, LimiterError, LimiterGuard};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapters::docker::{AutoCreateConfig, DockerAdapter};
use crate::adapters::k8s::K8sAdapter;
use crate::adapters::local::LocalAdapter;
use crate::adapters::mock::MockAdapter;
use crate::adapters::remote_docker::RemoteDockerAdapter;
use crate::adapters::ssh::{SshAdapter, SshPool};
use crate::adapters::{Adapter, Emitter, ExecContext};
use crate::command::{Command, OutputSink, Shell, StdinSource, Target};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventBus, EventKind, Selector, Subscription};
use crate::mask::Masker;
use crate::result::{
    CapturedStream, ExecResult, ResultBuilder, EXIT_KILLED, EXIT_TARGET_NOT_FOUND, EXIT_TIMEOUT,
};

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

fn default_max_buffer() -> usize {
    10 * 1024 * 1024
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_ssh_idle_timeout_ms() -> u64 {
    60_000
}

/// Engine-wide defaults, merged under each command's own settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Applied when a command sets no timeout. Zero disables.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Whether commands default to running under a shell.
    #[serde(default = "default_true")]
    pub default_shell: bool,

    /// Capture limit per stream.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,

    /// When false, every command behaves as if `nothrow` were set.
    #[serde(default = "default_true")]
    pub throw_on_non_zero: bool,

    /// Grace between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Idle SSH connections are closed after this long.
    #[serde(default = "default_ssh_idle_timeout_ms")]
    pub ssh_idle_timeout_ms: u64,

    /// Helper-container auto-creation for missing docker exec targets.
    #[serde(default)]
    pub auto_create: AutoCreateConfig,

    /// Disable to pass output through unmasked.
    #[serde(default = "default_true")]
    pub masking: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            default_shell: true,
            max_buffer: default_max_buffer(),
            throw_on_non_zero: true,
            kill_grace_ms: default_kill_grace_ms(),
            ssh_idle_timeout_ms: default_ssh_idle_timeout_ms(),
            auto_create: AutoCreateConfig::default(),
            masking: true,
        }
    }
}

/// Why an attempt ended before the adapter finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    None,
    Timeout,
    Cancelled,
}

/// A builder pre-scoped to one target.
pub struct ScopedBuilder {
    target: Target,
}

impl ScopedBuilder {
    /// Re-target an existing command.
    pub fn command(&self, command: &Command) -> Command {
        command.target(self.target.clone())
    }

    /// Build from a template and target it here.
    pub fn template(&self, template: crate::command::Template) -> Result<Command> {
        Ok(template.build()?.target(self.target.clone()))
    }
}

pub struct Engine {
    config: EngineConfig,
    events: EventBus,
    masker: Arc<Masker>,
    local: Arc<LocalAdapter>,
    mock: Arc<MockAdapter>,
    ssh: Arc<SshAdapter>,
    docker: Arc<DockerAdapter>,
    remote_docker: Arc<RemoteDockerAdapter>,
    k8s: Arc<K8sAdapter>,
    disposed: AtomicBool,
    next_command_id: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new();
        let masker = Arc::new(if config.masking {
            Masker::new()
        } else {
            Masker::disabled()
        });
        let detached = Emitter::detached(events.clone(), masker.clone());
        let kill_grace = Duration::from_millis(config.kill_grace_ms);

        let pool = Arc::new(SshPool::new(
            Duration::from_millis(config.ssh_idle_timeout_ms),
            detached.clone(),
        ));
        let ssh = Arc::new(SshAdapter::new(pool));
        let docker = Arc::new(DockerAdapter::new(
            config.auto_create.clone(),
            detached.clone(),
            kill_grace,
            config.max_buffer,
        ));
        let remote_docker = Arc::new(RemoteDockerAdapter::new(
            ssh.clone(),
            config.auto_create.clone(),
            detached.clone(),
            kill_grace,
            config.max_buffer,
        ));
        let k8s = Arc::new(K8sAdapter::new(detached, kill_grace, config.max_buffer));

        Self {
            config,
            events,
            masker,
            local: Arc::new(LocalAdapter::new()),
            mock: Arc::new(MockAdapter::new()),
            ssh,
            docker,
            remote_docker,
            k8s,
            disposed: AtomicBool::new(false),
            next_command_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The scripted adapter, for tests and dry runs.
    pub fn mock_adapter(&self) -> &MockAdapter {
        &self.mock
    }

    /// The SSH adapter, for file transfers.
    pub fn ssh_adapter(&self) -> &SshAdapter {
        &self.ssh
    }

    /// The docker adapter, for the higher-order CLI operations.
    pub fn docker_adapter(&self) -> &DockerAdapter {
        &self.docker
    }

    /// The kubernetes adapter, for port-forwarding, log streaming and copy.
    pub fn k8s_adapter(&self) -> &K8sAdapter {
        &self.k8s
    }

    // ------------------------------------------------------------------
    // Subscription surface
    // ------------------------------------------------------------------

    /// Subscribe a handler to one event kind. Unsubscribes on drop.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(Some(vec![kind]), Selector::default(), handler)
    }

    /// Subscribe with full kind/selector control.
    pub fn on_filtered(
        &self,
        kinds: Option<Vec<EventKind>>,
        selector: Selector,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(kinds, selector, handler)
    }

    // ------------------------------------------------------------------
    // Scoped builders
    // ------------------------------------------------------------------

    pub fn ssh(&self, opts: crate::command::SshOptions) -> ScopedBuilder {
        ScopedBuilder {
            target: Target::Ssh(opts),
        }
    }

    pub fn docker(&self, opts: crate::command::DockerOptions) -> ScopedBuilder {
        ScopedBuilder {
            target: Target::Docker(opts),
        }
    }

    pub fn k8s(&self, opts: crate::command::K8sOptions) -> ScopedBuilder {
        ScopedBuilder {
            target: Target::Kubernetes(opts),
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn adapter_for(&self, target: &Target) -> &dyn Adapter {
        match target {
            Target::Local => self.local.as_ref(),
            Target::Mock => self.mock.as_ref(),
            Target::Ssh(_) => self.ssh.as_ref(),
            Target::Docker(_) => self.docker.as_ref(),
            Target::RemoteDocker { .. } => self.remote_docker.as_ref(),
            Target::Kubernetes(_) => self.k8s.as_ref(),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Internal(anyhow::anyhow!("engine is disposed")));
        }
        Ok(())
    }

    /// Fold engine defaults into a command.
    fn resolve(&self, command: &Command) -> Command {
        let mut resolved = command.clone();
        if !self.config.default_shell && matches!(resolved.shell, Shell::Default) {
            resolved = resolved.shell(false);
        }
        if !self.config.throw_on_non_zero {
            resolved.nothrow = true;
        }
        resolved
    }

    /// Run one command (or pipeline) to completion.
    #[instrument(skip_all, fields(adapter = command.target_ref().adapter_name()))]
    pub async fn run(&self, command: &Command) -> Result<ExecResult> {
        self.ensure_live()?;
        if command.pipe_from.is_some() {
            return self.run_pipeline(command).await;
        }
        self.run_single(&self.resolve(command)).await
    }

    /// Synchronous execution for adapters that support it (local, mock).
    pub fn run_sync(&self, command: &Command) -> Result<ExecResult> {
        self.ensure_live()?;
        let resolved = self.resolve(command);
        let adapter: &dyn Adapter = match resolved.target_ref() {
            Target::Local => self.local.as_ref(),
            Target::Mock => self.mock.as_ref(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "run_sync supports local and mock targets, not '{}'",
                    other.adapter_name()
                )))
            }
        };

        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let masked_line = self.masker.mask(&resolved.display_line());
        self.events.emit(Event::CommandStart {
            id,
            command: masked_line,
            adapter: adapter.name(),
        });

        match adapter.execute_sync(&resolved) {
            Ok(result) => self.apply_policy(id, adapter.name(), &resolved, result, Cause::None),
            Err(err) => Err(self.report_error(id, adapter.name(), &resolved, err)),
        }
    }

    async fn run_single(&self, command: &Command) -> Result<ExecResult> {
        let adapter = self.adapter_for(command.target_ref());
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let masked_line = self.masker.mask(&command.display_line());
        self.events.emit(Event::CommandStart {
            id,
            command: masked_line,
            adapter: adapter.name(),
        });

        let retry = command.retry.clone();
        let attempts = retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
        let mut backoff = retry.as_ref().map(|policy| ExponentialBackoff {
            initial_interval: Duration::from_millis(policy.backoff_ms),
            randomization_factor: if policy.jitter { 0.3 } else { 0.0 },
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        });

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let (outcome, cause) = self.attempt(adapter, command, id).await;

            let retryable = match (&outcome, &retry) {
                (Err(err), Some(policy)) => {
                    cause == Cause::None
                        && attempt < attempts
                        && policy.retry_on.contains(&err.kind())
                }
                _ => false,
            };

            if retryable {
                let delay = backoff
                    .as_mut()
                    .and_then(|b| b.next_backoff())
                    .unwrap_or_else(|| Duration::from_millis(250));
                debug!(attempt, ?delay, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                continue;
            }

            return match outcome {
                Ok(result) => self.apply_policy(id, adapter.name(), command, result, cause),
                Err(err) => Err(self.report_error(id, adapter.name(), command, err)),
            };
        }
    }

    /// One adapter attempt under timeout/cancellation supervision.
    async fn attempt(
        &self,
        adapter: &dyn Adapter,
        command: &Command,
        id: u64,
    ) -> (Result<ExecResult>, Cause) {
        let exec_token = CancellationToken::new();
        // If this attempt's future is dropped, make sure the adapter's kill
        // path still runs.
        let drop_guard = scopeguard::guard(exec_token.clone(), |token| token.cancel());

        let ctx = ExecContext {
            id,
            cancel: exec_token.clone(),
            emitter: Emitter::new(self.events.clone(), self.masker.clone(), id, command.quiet),
            kill_grace: Duration::from_millis(self.config.kill_grace_ms),
            max_buffer: command.max_buffer.unwrap_or(self.config.max_buffer),
        };

        let timeout = command
            .timeout
            .unwrap_or(Duration::from_millis(self.config.default_timeout_ms));

        let timeout_wait = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(timeout).await;
            }
        };
        let external = command.cancel.clone();
        let external_wait = async {
            match &external {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let exec = adapter.execute(command, &ctx);
        tokio::pin!(exec);

        let grace = Duration::from_millis(self.config.kill_grace_ms) + Duration::from_secs(2);
        let (outcome, cause) = tokio::select! {
            outcome = &mut exec => (outcome, Cause::None),
            _ = timeout_wait => {
                exec_token.cancel();
                let outcome = match tokio::time::timeout(grace, &mut exec).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(self.synthesized_kill_result(adapter.name(), command)),
                };
                (outcome, Cause::Timeout)
            }
            _ = external_wait => {
                exec_token.cancel();
                let outcome = match tokio::time::timeout(grace, &mut exec).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(self.synthesized_kill_result(adapter.name(), command)),
                };
                (outcome, Cause::Cancelled)
            }
        };

        // Normal completion: disarm the drop guard.
        scopeguard::ScopeGuard::into_inner(drop_guard);
        (outcome, cause)
    }

    /// Stand-in result when an adapter failed to return within the grace
    /// window after a kill.
    fn synthesized_kill_result(&self, adapter: &'static str, command: &Command) -> ExecResult {
        warn!(adapter, "adapter did not return within the kill grace window");
        ResultBuilder::new(adapter, command.display_line()).finish(
            CapturedStream::default(),
            CapturedStream::default(),
            EXIT_KILLED,
            Some("SIGTERM".to_string()),
        )
    }

    /// Mask a finished result before it leaves the engine.
    fn mask_result(&self, mut result: ExecResult) -> ExecResult {
        result.command = self.masker.mask(&result.command);
        result.stdout.bytes = self.masker.mask_bytes(&result.stdout.bytes);
        result.stderr.bytes = self.masker.mask_bytes(&result.stderr.bytes);
        result
    }

    fn mask_error(&self, err: Error) -> Error {
        match err {
            Error::CommandFailed {
                command,
                exit_code,
                result,
            } => Error::CommandFailed {
                command: self.masker.mask(&command),
                exit_code,
                result: Box::new(self.mask_result(*result)),
            },
            Error::BufferExceeded { limit, result } => Error::BufferExceeded {
                limit,
                result: result.map(|r| Box::new(self.mask_result(*r))),
            },
            Error::TargetNotFound { target, result } => Error::TargetNotFound {
                target,
                result: result.map(|r| Box::new(self.mask_result(*r))),
            },
            other => other,
        }
    }

    /// Throwing policy (§ result/error contract): non-zero exits raise
    /// `CommandFailed` unless `nothrow`; 125 maps to `TargetNotFound`;
    /// timeout and cancellation always win over the exit code.
    fn apply_policy(
        &self,
        id: u64,
        adapter: &'static str,
        command: &Command,
        result: ExecResult,
        cause: Cause,
    ) -> Result<ExecResult> {
        let mut result = self.mask_result(result);

        match cause {
            Cause::Timeout => {
                result.exit_code = EXIT_TIMEOUT;
                result.signal = Some("SIGTERM".to_string());
                let timeout_ms = command
                    .timeout
                    .unwrap_or(Duration::from_millis(self.config.default_timeout_ms))
                    .as_millis() as u64;
                if command.nothrow {
                    self.emit_complete(id, adapter, &result);
                    Ok(result)
                } else {
                    let err = Error::Timeout {
                        command: result.command.clone(),
                        timeout_ms,
                        result: Some(Box::new(result)),
                    };
                    self.emit_error(id, adapter, &err);
                    Err(err)
                }
            }
            Cause::Cancelled => {
                result.exit_code = EXIT_KILLED;
                result.signal = Some("SIGTERM".to_string());
                if command.nothrow {
                    self.emit_complete(id, adapter, &result);
                    Ok(result)
                } else {
                    let err = Error::Cancelled {
                        command: result.command.clone(),
                        result: Some(Box::new(result)),
                    };
                    self.emit_error(id, adapter, &err);
                    Err(err)
                }
            }
            Cause::None => {
                if result.ok() || command.nothrow {
                    self.emit_complete(id, adapter, &result);
                    return Ok(result);
                }
                let err = if result.exit_code == EXIT_TARGET_NOT_FOUND {
                    Error::TargetNotFound {
                        target: result
                            .container
                            .clone()
                            .or_else(|| result.host.clone())
                            .unwrap_or_else(|| result.command.clone()),
                        result: Some(Box::new(result)),
                    }
                } else {
                    Error::CommandFailed {
                        command: result.command.clone(),
                        exit_code: result.exit_code,
                        result: Box::new(result),
                    }
                };
                self.emit_error(id, adapter, &err);
                Err(err)
            }
        }
    }

    fn emit_complete(&self, id: u64, adapter: &'static str, result: &ExecResult) {
        self.events.emit(Event::CommandComplete {
            id,
            command: result.command.clone(),
            adapter,
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
        });
    }

    fn emit_error(&self, id: u64, adapter: &'static str, err: &Error) {
        self.events.emit(Event::CommandError {
            id,
            command: err
                .partial_result()
                .map(|r| r.command.clone())
                .unwrap_or_default(),
            adapter,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn report_error(
        &self,
        id: u64,
        adapter: &'static str,
        _command: &Command,
        err: Error,
    ) -> Error {
        let err = self.mask_error(err);
        self.emit_error(id, adapter, &err);
        err
    }

    /// Run a pipeline, streaming each stage's stdout into the next stage's
    /// stdin in memory.
    ///
    /// Stages run concurrently with forced `nothrow`; lifecycle events are
    /// emitted per stage. The pipeline's exit code is the rightmost non-zero
    /// one, and the throwing policy applies once, to the pipeline as a whole.
    async fn run_pipeline(&self, last: &Command) -> Result<ExecResult> {
        let chain = last.pipeline_chain();
        let mut stages: Vec<Command> = chain.into_iter().cloned().collect();
        for stage in &mut stages {
            stage.pipe_from = None;
        }

        // Wire stage i's stdout channel into stage i+1's stdin reader.
        for i in 0..stages.len() - 1 {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
            stages[i] = stages[i].stdout(OutputSink::Channel(tx));
            let reader = StreamReader::new(
                ReceiverStream::new(rx).map(Ok::<Bytes, std::io::Error>),
            );
            stages[i + 1] = stages[i + 1].stdin(StdinSource::reader(reader));
        }

        let futures = stages.into_iter().map(|stage| {
            let stage = self.resolve(&stage.nothrow());
            async move { self.run_single(&stage).await }
        });
        let results: Vec<Result<ExecResult>> = futures::future::join_all(futures).await;

        let mut collected = Vec::with_capacity(results.len());
        for result in results {
            collected.push(result?);
        }

        let pipeline_exit = collected
            .iter()
            .rev()
            .map(|r| r.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0);

        let mut final_result = collected
            .pop()
            .ok_or_else(|| Error::InvalidArgument("empty pipeline".to_string()))?;
        final_result.exit_code = pipeline_exit;

        if pipeline_exit != 0 && !last.nothrow && self.config.throw_on_non_zero {
            return Err(Error::CommandFailed {
                command: final_result.command.clone(),
                exit_code: pipeline_exit,
                result: Box::new(final_result),
            });
        }
        Ok(final_result)
    }

    /// Close every adapter in reverse registration order. Idempotent; all
    /// failures are aggregated into one `Internal` error.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let adapters: [(&'static str, &dyn Adapter); 6] = [
            ("k8s", self.k8s.as_ref()),
            ("remote-docker", self.remote_docker.as_ref()),
            ("docker", self.docker.as_ref()),
            ("ssh", self.ssh.as_ref()),
            ("mock", self.mock.as_ref()),
            ("local", self.local.as_ref()),
        ];

        let mut failures = Vec::new();
        for (name, adapter) in adapters {
            if let Err(err) = adapter.dispose().await {
                warn!(adapter = name, "disposal failed: {}", err);
                failures.push(format!("{}: {}", name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(
                "adapter disposal failed: {}",
                failures.join("; ")
            )))
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockMatcher, MockResponse};
    use crate::command::{RetryPolicy, Template};
    use parking_lot::Mutex;
    use std::time::Instant;

    fn engine() -> Engine {
        Engine::default()
    }

    #[tokio::test]
    async fn test_local_echo_end_to_end() {
        let engine = engine();
        let cmd = Template::new()
            .lit("echo ")
            .val("hello world")
            .build()
            .unwrap();
        let result = engine.run(&cmd).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.bytes, b"hello world\n");
        assert!(result.stderr.bytes.is_empty());
        assert_eq!(result.adapter, "local");
        assert!(result.ok());
    }

    #[tokio::test]
    async fn test_command_failed_policy() {
        let engine = engine();
        let cmd = Command::new("sh").args(["-c", "exit 3"]).shell(false);
        let err = engine.run(&cmd).await.unwrap_err();
        match err {
            Error::CommandFailed { exit_code, result, .. } => {
                assert_eq!(exit_code, 3);
                assert_eq!(result.exit_code, 3);
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothrow_never_raises_command_failed() {
        let engine = engine();
        let cmd = Command::new("sh").args(["-c", "exit 3"]).shell(false).nothrow();
        let result = engine.run(&cmd).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.fails());
    }

    #[tokio::test]
    async fn test_timeout_policy() {
        let engine = engine();
        let cmd = Command::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));

        let start = Instant::now();
        let err = engine.run(&cmd).await.unwrap_err();
        let elapsed = start.elapsed();

        match err {
            Error::Timeout { timeout_ms, result, .. } => {
                assert_eq!(timeout_ms, 200);
                let result = result.unwrap();
                assert_eq!(result.exit_code, EXIT_TIMEOUT);
                assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        // SIGTERM lands immediately; well under the kill grace.
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_timeout_with_nothrow_returns_result() {
        let engine = engine();
        let cmd = Command::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .nothrow();
        let result = engine.run(&cmd).await.unwrap();
        assert_eq!(result.exit_code, EXIT_TIMEOUT);
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let engine = engine();
        let token = CancellationToken::new();
        let cmd = Command::new("sleep").arg("5").signal(token.clone());

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = engine.run(&cmd).await.unwrap_err();
        match err {
            Error::Cancelled { result, .. } => {
                let result = result.unwrap();
                assert_eq!(result.exit_code, EXIT_KILLED);
                assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
            }
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_ordering() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = engine.on_filtered(None, Selector::default(), move |event| {
            seen_clone.lock().push(event.kind());
        });

        let cmd = Template::new().lit("echo ").val("ordered").build().unwrap();
        engine.run(&cmd).await.unwrap();

        let kinds = seen.lock().clone();
        assert_eq!(kinds.first(), Some(&EventKind::CommandStart));
        assert_eq!(kinds.last(), Some(&EventKind::CommandComplete));
        assert!(kinds.contains(&EventKind::CommandOutput));
        // Exactly one terminal event.
        let terminals = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::CommandComplete | EventKind::CommandError))
            .count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn test_no_error_event_under_nothrow() {
        let engine = engine();
        engine.mock_adapter().on(
            MockMatcher::Any,
            MockResponse::exit(125, b"Error: No such container: does-not-exist\n".to_vec()),
        );

        let errors = Arc::new(Mutex::new(0_usize));
        let errors_clone = errors.clone();
        let _sub = engine.on(EventKind::CommandError, move |_| {
            *errors_clone.lock() += 1;
        });

        let cmd = Command::new("echo").arg("hi").mock().nothrow();
        let result = engine.run(&cmd).await.unwrap();

        assert_eq!(result.exit_code, 125);
        assert!(!result.ok());
        assert!(result.stderr.as_text().contains("does-not-exist"));
        assert_eq!(*errors.lock(), 0);
    }

    #[tokio::test]
    async fn test_exit_125_maps_to_target_not_found() {
        let engine = engine();
        engine.mock_adapter().on(
            MockMatcher::Any,
            MockResponse::exit(125, b"No such container: ghost\n".to_vec()),
        );

        let cmd = Command::new("echo").arg("hi").mock();
        let err = engine.run(&cmd).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetNotFound);
    }

    #[tokio::test]
    async fn test_retry_on_connection_error() {
        let engine = engine();
        engine
            .mock_adapter()
            .on_once(MockMatcher::Any, MockResponse::Failure(ErrorKind::ConnectionError));
        engine.mock_adapter().on(
            MockMatcher::Any,
            MockResponse::success(b"recovered\n".to_vec()),
        );

        let cmd = Command::new("flaky").mock().retry(RetryPolicy {
            attempts: 3,
            backoff_ms: 10,
            jitter: false,
            retry_on: vec![ErrorKind::ConnectionError],
        });
        let result = engine.run(&cmd).await.unwrap();
        assert_eq!(result.stdout.bytes, b"recovered\n");
        assert_eq!(engine.mock_adapter().calls().len(), 2);
    }

    #[tokio::test]
    async fn test_command_failed_not_retried_by_default() {
        let engine = engine();
        engine
            .mock_adapter()
            .on(MockMatcher::Any, MockResponse::exit(1, b"boom".to_vec()));

        let cmd = Command::new("fails").mock().retry(RetryPolicy::default());
        let err = engine.run(&cmd).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(engine.mock_adapter().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_masking_of_result_and_command() {
        let engine = engine();
        let cmd = Template::new()
            .lit("echo ")
            .val("API_KEY=ghp_abcdef0123456789abcdef")
            .build()
            .unwrap();
        let result = engine.run(&cmd).await.unwrap();

        assert!(result.stdout.as_text().contains("API_KEY=[REDACTED]"));
        assert!(!result.stdout.as_text().contains("ghp_"));
        assert!(result.command.contains("[REDACTED]"));
        assert!(!result.command.contains("ghp_"));
    }

    #[tokio::test]
    async fn test_pipeline_streams_between_stages() {
        let engine = engine();
        let upstream = Command::new("printf").arg("one\ntwo\nthree\n");
        let downstream = Command::new("wc").arg("-l");
        let pipeline = upstream.pipe(&downstream);

        let result = engine.run(&pipeline).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.text(), "3");
    }

    #[tokio::test]
    async fn test_pipeline_exit_code_is_rightmost_nonzero() {
        let engine = engine();
        let a = Command::new("sh").args(["-c", "echo data; exit 4"]).shell(false);
        let b = Command::new("cat");
        let pipeline = a.pipe(&b).nothrow();

        let result = engine.run(&pipeline).await.unwrap();
        assert_eq!(result.exit_code, 4);
    }

    #[tokio::test]
    async fn test_run_sync_local_and_mock_only() {
        let engine = engine();
        let local = Command::new("echo").arg("sync");
        let result = engine.run_sync(&local).unwrap();
        assert_eq!(result.stdout.bytes, b"sync\n");

        let ssh = local.ssh(crate::command::SshOptions::new(
            "host",
            "user",
            crate::command::SshAuth::Agent,
        ));
        let err = engine.run_sync(&ssh).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let engine = engine();
        engine.dispose().await.unwrap();
        engine.dispose().await.unwrap();

        let err = engine.run(&Command::new("echo")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_scoped_builder_targets() {
        let engine = engine();
        let scoped = engine.docker(crate::command::DockerOptions::container("web"));
        let cmd = scoped.command(&Command::new("ls"));
        assert_eq!(cmd.target_ref().adapter_name(), "docker");
    }
}
