//! Command value type and target options
//!
//! A [`Command`] is the fully-prepared description of one execution. It is
//! immutable: every fluent method leaves the receiver untouched and returns a
//! modified copy, so two chains built from the same base never observe each
//! other's changes.

pub mod quote;
mod template;

pub use quote::{PosixQuoter, Quoter};
pub use template::{FlagValue, Template, TemplateValue};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

/// One argv token, assembled from trusted literal text and interpolated
/// values. Values are quoted at render time; literals pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    parts: Vec<TokenPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenPart {
    /// Author-written fragment text, rendered as-is.
    Lit(String),
    /// Interpolated value, rendered through the quoter.
    Val(String),
}

impl Token {
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![TokenPart::Lit(text.into())],
        }
    }

    pub fn value(text: impl Into<String>) -> Self {
        Self {
            parts: vec![TokenPart::Val(text.into())],
        }
    }

    pub(crate) fn empty() -> Self {
        Self { parts: Vec::new() }
    }

    pub(crate) fn push_lit(&mut self, text: &str) {
        self.parts.push(TokenPart::Lit(text.to_string()));
    }

    pub(crate) fn push_val(&mut self, text: &str) {
        self.parts.push(TokenPart::Val(text.to_string()));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The raw token bytes, as handed to a direct `exec`.
    pub fn raw(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                TokenPart::Lit(s) | TokenPart::Val(s) => s.as_str(),
            })
            .collect()
    }

    /// The token as it appears on a shell command line.
    pub fn render(&self, quoter: &dyn Quoter) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                TokenPart::Lit(s) => s.clone(),
                TokenPart::Val(s) => quoter.quote(s),
            })
            .collect()
    }
}

/// Shell selection for a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shell {
    /// Direct exec, no shell. Adapters that cannot honour this document the
    /// effective behaviour.
    Never,
    /// The adapter's default shell (`sh -c` on POSIX targets).
    #[default]
    Default,
    /// An explicit shell program.
    Program(String),
}

impl From<bool> for Shell {
    fn from(value: bool) -> Self {
        if value {
            Shell::Default
        } else {
            Shell::Never
        }
    }
}

impl From<&str> for Shell {
    fn from(value: &str) -> Self {
        Shell::Program(value.to_string())
    }
}

/// Shared once-consumable reader used for streaming stdin.
pub type SharedReader = Arc<tokio::sync::Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>>;

/// Where a command's stdin comes from.
#[derive(Clone, Default)]
pub enum StdinSource {
    #[default]
    Null,
    /// Pass the calling process's stdin through (TTY line discipline kept).
    Inherit,
    Bytes(Vec<u8>),
    /// A byte stream, consumed exactly once.
    Reader(SharedReader),
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinSource::Null => f.write_str("Null"),
            StdinSource::Inherit => f.write_str("Inherit"),
            StdinSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            StdinSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl StdinSource {
    pub fn is_present(&self) -> bool {
        !matches!(self, StdinSource::Null)
    }

    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        StdinSource::Reader(Arc::new(tokio::sync::Mutex::new(Some(Box::new(reader)))))
    }
}

/// Where a command's output goes.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// Capture into the result (subject to `max_buffer`).
    #[default]
    Pipe,
    /// Pass through to the calling process.
    Inherit,
    /// Discard.
    Ignore,
    /// Forward chunks to a caller-supplied channel (still captured).
    Channel(mpsc::Sender<bytes::Bytes>),
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Pipe => f.write_str("Pipe"),
            OutputSink::Inherit => f.write_str("Inherit"),
            OutputSink::Ignore => f.write_str("Ignore"),
            OutputSink::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// Per-command retry policy, applied by the engine around adapter execution.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Initial backoff delay; grows exponentially with a cap.
    pub backoff_ms: u64,
    /// Randomise delays to avoid thundering herds.
    pub jitter: bool,
    /// Error kinds worth retrying. `CommandFailed` is retried only when
    /// listed explicitly.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 250,
            jitter: true,
            retry_on: vec![ErrorKind::ConnectionError],
        }
    }
}

/// SSH authentication material.
#[derive(Clone)]
pub enum SshAuth {
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Key material passed inline: PEM text, or base64 of it (the form CI
    /// secret stores usually hold).
    KeyData {
        data: String,
        passphrase: Option<String>,
    },
    Password(String),
    Agent,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Key { path, .. } => f.debug_struct("Key").field("path", path).finish(),
            SshAuth::KeyData { .. } => f.write_str("KeyData"),
            SshAuth::Password(_) => f.write_str("Password"),
            SshAuth::Agent => f.write_str("Agent"),
        }
    }
}

/// How sudo obtains its password on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoMethod {
    /// `sudo -S`, password fed on stdin.
    Stdin,
    /// `sudo -A`, askpass helper exported.
    Askpass,
}

#[derive(Debug, Clone)]
pub struct SudoOptions {
    pub password: Option<String>,
    pub method: SudoMethod,
}

/// SSH target options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: SshAuth,
    /// Budget for TCP connect + handshake + auth.
    pub ready_timeout_ms: u64,
    /// Keep-alive ping interval.
    pub keep_alive_ms: u64,
    /// Consecutive keep-alive failures before the connection is declared dead.
    pub keep_alive_max_fail: u32,
    /// Channel multiplexing cap; `None` serialises channels per connection.
    pub multiplex: Option<usize>,
    pub sudo: Option<SudoOptions>,
}

impl SshOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            auth,
            ready_timeout_ms: 10_000,
            keep_alive_ms: 10_000,
            keep_alive_max_fail: 3,
            multiplex: None,
            sudo: None,
        }
    }
}

/// Docker execution mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// `docker exec` into an existing container.
    Exec,
    /// `docker run` a fresh container.
    Run,
    /// Exec when the container exists, run when an image is given.
    #[default]
    Auto,
}

/// Docker target options.
#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    pub container: Option<String>,
    pub image: Option<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    /// `docker run --rm`; defaults on for run mode.
    pub auto_remove: bool,
    pub run_mode: RunMode,
    /// `-v` volume specs for run mode.
    pub volumes: Vec<String>,
    /// `-p` port specs for run mode.
    pub ports: Vec<String>,
    /// `--network` for run mode.
    pub network: Option<String>,
    /// Extra `-e K=V` pairs beyond the command's own env.
    pub env: HashMap<String, String>,
}

impl DockerOptions {
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            auto_remove: true,
            ..Default::default()
        }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            auto_remove: true,
            run_mode: RunMode::Run,
            ..Default::default()
        }
    }
}

/// Kubernetes target options.
#[derive(Debug, Clone)]
pub struct K8sOptions {
    /// Literal pod name, `-l`-prefixed label selector, or a regex.
    pub pod: String,
    pub namespace: String,
    pub container: Option<String>,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub tty: bool,
    pub stdin: bool,
    /// Extra flags appended verbatim to `kubectl exec`.
    pub exec_flags: Vec<String>,
}

impl K8sOptions {
    pub fn pod(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            namespace: "default".to_string(),
            container: None,
            context: None,
            kubeconfig: None,
            tty: false,
            stdin: false,
            exec_flags: Vec::new(),
        }
    }
}

/// Tagged adapter selection.
#[derive(Debug, Clone, Default)]
pub enum Target {
    #[default]
    Local,
    Ssh(SshOptions),
    Docker(DockerOptions),
    RemoteDocker {
        ssh: SshOptions,
        docker: DockerOptions,
    },
    Kubernetes(K8sOptions),
    Mock,
}

impl Target {
    /// Stable adapter name, used in results and event selectors.
    pub fn adapter_name(&self) -> &'static str {
        match self {
            Target::Local => "local",
            Target::Ssh(_) => "ssh",
            Target::Docker(_) => "docker",
            Target::RemoteDocker { .. } => "remote-docker",
            Target::Kubernetes(_) => "k8s",
            Target::Mock => "mock",
        }
    }
}

/// Throttled progress reporting.
#[derive(Clone)]
pub struct Progress {
    pub enabled: bool,
    /// Minimum interval between handler invocations.
    pub interval: Duration,
    pub handler: Arc<dyn Fn(ProgressUpdate) + Send + Sync>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("enabled", &self.enabled)
            .field("interval", &self.interval)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressUpdate {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub elapsed: Duration,
}

/// The fully-prepared description of one execution.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub(crate) argv: Vec<Token>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) shell: Shell,
    pub(crate) stdin: StdinSource,
    pub(crate) stdout: OutputSink,
    pub(crate) stderr: OutputSink,
    /// `None` means the engine default; `Some(ZERO)` disables the timeout.
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_buffer: Option<usize>,
    pub(crate) nothrow: bool,
    /// Suppress `command:output` events for this command.
    pub(crate) quiet: bool,
    pub(crate) nice: Option<i32>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) target: Target,
    pub(crate) retry: Option<RetryPolicy>,
    /// Upstream command whose stdout feeds this command's stdin.
    pub(crate) pipe_from: Option<Box<Command>>,
    pub(crate) progress: Option<Progress>,
}

impl Command {
    /// A command from a trusted program name and raw argument values.
    ///
    /// The program is literal; arguments are treated as interpolated values
    /// and quoted on shell render.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![Token::literal(program)],
            ..Default::default()
        }
    }

    /// Append one argument value (quoted on shell render).
    pub fn arg(&self, value: impl Into<String>) -> Self {
        let mut cmd = self.clone();
        cmd.argv.push(Token::value(value));
        cmd
    }

    /// Append several argument values.
    pub fn args<I, S>(&self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = self.clone();
        cmd.argv.extend(values.into_iter().map(Token::value));
        cmd
    }

    pub(crate) fn from_tokens(argv: Vec<Token>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Fluent configuration (copy-on-modify)
    // ------------------------------------------------------------------

    pub fn cwd(&self, dir: impl Into<PathBuf>) -> Self {
        let mut cmd = self.clone();
        cmd.cwd = Some(dir.into());
        cmd
    }

    pub fn env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut cmd = self.clone();
        cmd.env.insert(key.into(), value.into());
        cmd
    }

    pub fn envs(&self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut cmd = self.clone();
        cmd.env.extend(vars);
        cmd
    }

    pub fn timeout(&self, timeout: Duration) -> Self {
        let mut cmd = self.clone();
        cmd.timeout = Some(timeout);
        cmd
    }

    /// Disable the engine's default timeout.
    pub fn no_timeout(&self) -> Self {
        self.timeout(Duration::ZERO)
    }

    pub fn shell(&self, shell: impl Into<Shell>) -> Self {
        let mut cmd = self.clone();
        cmd.shell = shell.into();
        cmd
    }

    pub fn stdin(&self, stdin: impl Into<StdinSource>) -> Self {
        let mut cmd = self.clone();
        cmd.stdin = stdin.into();
        cmd
    }

    pub fn stdout(&self, sink: OutputSink) -> Self {
        let mut cmd = self.clone();
        cmd.stdout = sink;
        cmd
    }

    pub fn stderr(&self, sink: OutputSink) -> Self {
        let mut cmd = self.clone();
        cmd.stderr = sink;
        cmd
    }

    pub fn max_buffer(&self, bytes: usize) -> Self {
        let mut cmd = self.clone();
        cmd.max_buffer = Some(bytes);
        cmd
    }

    /// Report non-zero exits through the result instead of an error.
    pub fn nothrow(&self) -> Self {
        let mut cmd = self.clone();
        cmd.nothrow = true;
        cmd
    }

    /// Suppress output events for this command.
    pub fn quiet(&self) -> Self {
        let mut cmd = self.clone();
        cmd.quiet = true;
        cmd
    }

    pub fn nice(&self, level: i32) -> Self {
        let mut cmd = self.clone();
        cmd.nice = Some(level);
        cmd
    }

    pub fn retry(&self, policy: RetryPolicy) -> Self {
        let mut cmd = self.clone();
        cmd.retry = Some(policy);
        cmd
    }

    /// Attach an external cancellation handle.
    pub fn signal(&self, token: CancellationToken) -> Self {
        let mut cmd = self.clone();
        cmd.cancel = Some(token);
        cmd
    }

    pub fn progress(&self, progress: Progress) -> Self {
        let mut cmd = self.clone();
        cmd.progress = Some(progress);
        cmd
    }

    // ------------------------------------------------------------------
    // Target selection
    // ------------------------------------------------------------------

    pub fn local(&self) -> Self {
        self.target(Target::Local)
    }

    pub fn ssh(&self, opts: SshOptions) -> Self {
        self.target(Target::Ssh(opts))
    }

    pub fn docker(&self, opts: DockerOptions) -> Self {
        self.target(Target::Docker(opts))
    }

    pub fn remote_docker(&self, ssh: SshOptions, docker: DockerOptions) -> Self {
        self.target(Target::RemoteDocker { ssh, docker })
    }

    pub fn k8s(&self, opts: K8sOptions) -> Self {
        self.target(Target::Kubernetes(opts))
    }

    pub fn mock(&self) -> Self {
        self.target(Target::Mock)
    }

    pub fn target(&self, target: Target) -> Self {
        let mut cmd = self.clone();
        cmd.target = target;
        cmd
    }

    /// Compose this command's stdout into `next`'s stdin.
    ///
    /// Pipes are left-associative; the engine streams between adapters
    /// without an intermediate file.
    pub fn pipe(&self, next: &Command) -> Command {
        let mut downstream = next.clone();
        downstream.pipe_from = Some(Box::new(self.clone()));
        downstream
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn target_ref(&self) -> &Target {
        &self.target
    }

    pub fn is_nothrow(&self) -> bool {
        self.nothrow
    }

    /// Raw argv for direct (shell-less) exec.
    pub fn argv_raw(&self) -> Vec<String> {
        self.argv.iter().map(Token::raw).collect()
    }

    /// The shell command line, with interpolated values quoted.
    pub fn render_line(&self, quoter: &dyn Quoter) -> String {
        let mut tokens: Vec<String> = self.argv.iter().map(|t| t.render(quoter)).collect();
        if let Some(level) = self.nice {
            tokens.splice(0..0, ["nice".to_string(), "-n".to_string(), level.to_string()]);
        }
        quoter.join(&tokens)
    }

    /// The line shown in results, events and errors (pre-masking).
    pub fn display_line(&self) -> String {
        self.render_line(&PosixQuoter)
    }

    /// Commands of the pipeline in execution order, leftmost first.
    pub(crate) fn pipeline_chain(&self) -> Vec<&Command> {
        let mut chain = Vec::new();
        let mut current = self;
        chain.push(current);
        while let Some(upstream) = current.pipe_from.as_deref() {
            chain.push(upstream);
            current = upstream;
        }
        chain.reverse();
        chain
    }
}

impl From<&str> for StdinSource {
    fn from(value: &str) -> Self {
        StdinSource::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for StdinSource {
    fn from(value: String) -> Self {
        StdinSource::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for StdinSource {
    fn from(value: Vec<u8>) -> Self {
        StdinSource::Bytes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chains_do_not_share_state() {
        let base = Command::new("echo").arg("hi");
        let a = base.cwd("/tmp").env("A", "1");
        let b = base.env("B", "2").nothrow();

        assert!(base.cwd.is_none());
        assert!(base.env.is_empty());
        assert!(!base.nothrow);

        assert_eq!(a.cwd.as_deref(), Some(std::path::Path::new("/tmp")));
        assert!(a.env.contains_key("A"));
        assert!(!a.env.contains_key("B"));

        assert!(b.cwd.is_none());
        assert!(b.env.contains_key("B"));
        assert!(b.nothrow);
    }

    #[test]
    fn test_render_quotes_values_not_literals() {
        let cmd = Command::new("echo").arg("hello world");
        assert_eq!(cmd.display_line(), "echo 'hello world'");
        assert_eq!(cmd.argv_raw(), vec!["echo", "hello world"]);
    }

    #[test]
    fn test_nice_prefix() {
        let cmd = Command::new("sort").nice(10);
        assert_eq!(cmd.display_line(), "nice -n 10 sort");
    }

    #[test]
    fn test_pipe_chain_order() {
        let a = Command::new("cat").arg("file");
        let b = Command::new("grep").arg("x");
        let c = Command::new("wc").arg("-l");
        let pipeline = a.pipe(&b).pipe(&c);

        let chain = pipeline.pipeline_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].display_line(), "cat file");
        assert_eq!(chain[1].display_line(), "grep x");
        assert_eq!(chain[2].display_line(), "wc -l");
    }

    #[test]
    fn test_target_names() {
        assert_eq!(Target::Local.adapter_name(), "local");
        assert_eq!(Target::Mock.adapter_name(), "mock");
        let ssh = Target::Ssh(SshOptions::new("h", "u", SshAuth::Agent));
        assert_eq!(ssh.adapter_name(), "ssh");
    }

    #[test]
    fn test_stdin_conversions() {
        let cmd = Command::new("cat").stdin("hello");
        assert!(cmd.stdin.is_present());
        match &cmd.stdin {
            StdinSource::Bytes(b) => assert_eq!(b, b"hello"),
            other => panic!("unexpected stdin source: {:?}", other),
        }
    }

    #[test]
    fn test_shell_conversions() {
        assert_eq!(Shell::from(true), Shell::Default);
        assert_eq!(Shell::from(false), Shell::Never);
        assert_eq!(Shell::from("/bin/bash"), Shell::Program("/bin/bash".into()));
    }
}
