//! Kubernetes adapter
//!
//! Drives the `kubectl` binary against the caller's active context (or an
//! explicit context/kubeconfig). Pod targets may be a literal name, a
//! `-l`-prefixed label selector, or a regex; selectors resolve to the first
//! pod in `Running` state. Port-forwarding and log streaming ride long-lived
//! `kubectl` children behind handles.

mod forward;
mod logs;

pub use forward::PortForwardHandle;
pub use logs::{LogStreamHandle, LogStreamOptions};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::proc::{run_process, ProcSpec};
use super::{Adapter, Emitter, ExecContext};
use crate::command::{Command, K8sOptions, PosixQuoter, Shell, Target};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::result::{CapturedStream, ExecResult, ResultBuilder, EXIT_TARGET_NOT_FOUND};

const PROBE_PATHS: &[&str] = &[
    "/usr/local/bin/kubectl",
    "/usr/bin/kubectl",
    "/opt/homebrew/bin/kubectl",
];

fn pod_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("pod name pattern"))
}

/// Validate a DNS-1123 pod or container name.
pub(crate) fn validate_k8s_name(name: &str) -> Result<()> {
    if !pod_name_pattern().is_match(name) {
        return Err(Error::InvalidArgument(format!(
            "invalid kubernetes name: {:?}",
            name
        )));
    }
    Ok(())
}

/// How the `pod` field of [`K8sOptions`] is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodSelector {
    Literal(String),
    Label(String),
    Pattern(String),
}

pub(crate) fn classify_pod(pod: &str) -> PodSelector {
    if let Some(rest) = pod.strip_prefix("-l") {
        return PodSelector::Label(rest.trim().to_string());
    }
    if pod_name_pattern().is_match(pod) {
        return PodSelector::Literal(pod.to_string());
    }
    PodSelector::Pattern(pod.to_string())
}

pub struct K8sAdapter {
    binary: OnceLock<Option<PathBuf>>,
    #[allow(dead_code)]
    emitter: Emitter,
    kill_grace: Duration,
    max_buffer: usize,
}

impl K8sAdapter {
    pub fn new(emitter: Emitter, kill_grace: Duration, max_buffer: usize) -> Self {
        Self {
            binary: OnceLock::new(),
            emitter,
            kill_grace,
            max_buffer,
        }
    }

    fn discover(&self) -> Option<PathBuf> {
        self.binary
            .get_or_init(|| {
                if let Ok(explicit) = std::env::var("XEC_KUBECTL_BIN") {
                    return Some(PathBuf::from(explicit));
                }
                for candidate in PROBE_PATHS {
                    if Path::new(candidate).is_file() {
                        return Some(PathBuf::from(candidate));
                    }
                }
                if let Some(paths) = std::env::var_os("PATH") {
                    for dir in std::env::split_paths(&paths) {
                        let candidate = dir.join("kubectl");
                        if candidate.is_file() {
                            return Some(candidate);
                        }
                    }
                }
                None
            })
            .clone()
    }

    pub(crate) fn binary_path(&self) -> Result<PathBuf> {
        self.discover().ok_or_else(|| Error::AdapterUnavailable {
            adapter: "k8s".to_string(),
            reason: "kubectl binary not found".to_string(),
        })
    }

    /// Namespace/context/kubeconfig flags shared by every invocation.
    pub(crate) fn global_flags(opts: &K8sOptions) -> Vec<String> {
        let mut flags = vec!["-n".to_string(), opts.namespace.clone()];
        if let Some(context) = &opts.context {
            flags.push("--context".to_string());
            flags.push(context.clone());
        }
        if let Some(kubeconfig) = &opts.kubeconfig {
            flags.push("--kubeconfig".to_string());
            flags.push(kubeconfig.to_string_lossy().into_owned());
        }
        flags
    }

    async fn cli_quiet(&self, args: &[String]) -> Result<ExecResult> {
        let binary = self.binary_path()?;
        let spec = ProcSpec {
            program: binary.to_string_lossy().into_owned(),
            args: args.to_vec(),
            cwd: None,
            env: HashMap::new(),
            stdin: crate::command::StdinSource::Null,
            stdout: crate::command::OutputSink::Pipe,
            stderr: crate::command::OutputSink::Pipe,
            max_buffer: self.max_buffer,
            kill_grace: self.kill_grace,
            progress: None,
        };
        let quiet_emitter = Emitter::new(
            crate::events::EventBus::new(),
            Arc::new(crate::mask::Masker::disabled()),
            0,
            true,
        );
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = run_process(spec, &token, &quiet_emitter).await?;
        Ok(
            ResultBuilder::new("k8s", format!("kubectl {}", args.join(" "))).finish(
                outcome.stdout,
                outcome.stderr,
                outcome.exit_code,
                outcome.signal,
            ),
        )
    }

    /// Resolve the pod named by `opts.pod` to a concrete pod name.
    ///
    /// Selector and pattern targets pick the first pod in `Running` state;
    /// callers wanting multi-pod fan-out iterate themselves.
    pub(crate) async fn resolve_pod(&self, opts: &K8sOptions) -> Result<Option<String>> {
        match classify_pod(&opts.pod) {
            PodSelector::Literal(name) => {
                let mut args = vec!["get".to_string(), "pod".to_string(), name.clone()];
                args.extend(Self::global_flags(opts));
                args.push("-o".to_string());
                args.push("json".to_string());
                let result = self.cli_quiet(&args).await?;
                Ok((result.exit_code == 0).then_some(name))
            }
            PodSelector::Label(selector) => {
                let mut args = vec!["get".to_string(), "pods".to_string()];
                args.push("-l".to_string());
                args.push(selector);
                args.extend(Self::global_flags(opts));
                args.push("-o".to_string());
                args.push("json".to_string());
                let result = self.cli_quiet(&args).await?;
                if result.exit_code != 0 {
                    return Ok(None);
                }
                Ok(first_running_pod(&result.json()?, None))
            }
            PodSelector::Pattern(pattern) => {
                let regex = Regex::new(&pattern).map_err(|e| {
                    Error::InvalidArgument(format!("invalid pod pattern {:?}: {}", pattern, e))
                })?;
                let mut args = vec!["get".to_string(), "pods".to_string()];
                args.extend(Self::global_flags(opts));
                args.push("-o".to_string());
                args.push("json".to_string());
                let result = self.cli_quiet(&args).await?;
                if result.exit_code != 0 {
                    return Ok(None);
                }
                Ok(first_running_pod(&result.json()?, Some(&regex)))
            }
        }
    }

    /// `kubectl exec` argv for a resolved pod.
    pub(crate) fn build_exec_args(pod: &str, opts: &K8sOptions, command: &Command) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if opts.stdin || command.stdin.is_present() {
            args.push("-i".to_string());
        }
        if opts.tty {
            args.push("-t".to_string());
        }
        args.extend(Self::global_flags(opts));
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.extend(opts.exec_flags.iter().cloned());
        args.push(pod.to_string());
        args.push("--".to_string());
        match &command.shell {
            Shell::Never => args.extend(command.argv_raw()),
            Shell::Default => {
                args.push("sh".to_string());
                args.push("-c".to_string());
                args.push(command.render_line(&PosixQuoter));
            }
            Shell::Program(shell) => {
                args.push(shell.clone());
                args.push("-c".to_string());
                args.push(command.render_line(&PosixQuoter));
            }
        }
        args
    }

    /// Spawn a `kubectl port-forward` child and return its handle.
    ///
    /// `local_port = 0` asks the kernel for a free port; the bound port is
    /// parsed from kubectl's "Forwarding from" line.
    pub async fn port_forward(
        &self,
        opts: &K8sOptions,
        local_port: u16,
        remote_port: u16,
    ) -> Result<PortForwardHandle> {
        let pod = self
            .resolve_pod(opts)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                target: opts.pod.clone(),
                result: None,
            })?;
        let binary = self.binary_path()?;
        forward::start_port_forward(&binary, opts, &pod, local_port, remote_port).await
    }

    /// Stream pod logs line-by-line into `on_line`.
    pub async fn stream_logs(
        &self,
        opts: &K8sOptions,
        on_line: impl Fn(&str) + Send + Sync + 'static,
        stream_opts: LogStreamOptions,
    ) -> Result<LogStreamHandle> {
        let pod = self
            .resolve_pod(opts)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                target: opts.pod.clone(),
                result: None,
            })?;
        let binary = self.binary_path()?;
        Ok(logs::start_log_stream(
            &binary,
            opts,
            &pod,
            Arc::new(on_line),
            stream_opts,
        ))
    }

    /// `kubectl cp` a local path into the pod.
    pub async fn copy_to(
        &self,
        opts: &K8sOptions,
        local: &Path,
        remote: &str,
        container: Option<&str>,
    ) -> Result<ExecResult> {
        let pod = self
            .resolve_pod(opts)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                target: opts.pod.clone(),
                result: None,
            })?;
        validate_remote_path(remote)?;
        let mut args = vec![
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            format!("{}/{}:{}", opts.namespace, pod, remote),
        ];
        if let Some(container) = container {
            validate_k8s_name(container)?;
            args.push("-c".to_string());
            args.push(container.to_string());
        }
        self.cli_quiet(&args).await
    }

    /// `kubectl cp` a pod path to a local destination.
    pub async fn copy_from(
        &self,
        opts: &K8sOptions,
        remote: &str,
        local: &Path,
        container: Option<&str>,
    ) -> Result<ExecResult> {
        let pod = self
            .resolve_pod(opts)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                target: opts.pod.clone(),
                result: None,
            })?;
        validate_remote_path(remote)?;
        let mut args = vec![
            "cp".to_string(),
            format!("{}/{}:{}", opts.namespace, pod, remote),
            local.to_string_lossy().into_owned(),
        ];
        if let Some(container) = container {
            validate_k8s_name(container)?;
            args.push("-c".to_string());
            args.push(container.to_string());
        }
        self.cli_quiet(&args).await
    }
}

fn validate_remote_path(path: &str) -> Result<()> {
    if path.split('/').any(|seg| seg == "..") {
        return Err(Error::InvalidArgument(format!(
            "path traversal in pod path: {:?}",
            path
        )));
    }
    Ok(())
}

/// Pick the first `Running` pod from a `kubectl get pods -o json` document,
/// optionally filtered by a name regex.
fn first_running_pod(doc: &serde_json::Value, pattern: Option<&Regex>) -> Option<String> {
    doc.get("items")?.as_array()?.iter().find_map(|item| {
        let name = item.get("metadata")?.get("name")?.as_str()?;
        if let Some(pattern) = pattern {
            if !pattern.is_match(name) {
                return None;
            }
        }
        let phase = item.get("status")?.get("phase")?.as_str()?;
        (phase == "Running").then(|| name.to_string())
    })
}

#[async_trait]
impl Adapter for K8sAdapter {
    fn name(&self) -> &'static str {
        "k8s"
    }

    async fn is_available(&self) -> bool {
        self.discover().is_some()
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let Target::Kubernetes(opts) = command.target_ref() else {
            return Err(Error::InvalidArgument(
                "k8s adapter invoked with a non-kubernetes target".to_string(),
            ));
        };
        let binary = self.binary_path()?;

        let Some(pod) = self.resolve_pod(opts).await? else {
            return Ok(ResultBuilder::new(self.name(), command.display_line())
                .container(opts.pod.clone())
                .finish(
                    CapturedStream::default(),
                    CapturedStream::new(
                        format!(
                            "Error from server (NotFound): pods {:?} not found\n",
                            opts.pod
                        )
                        .into_bytes(),
                    ),
                    EXIT_TARGET_NOT_FOUND,
                    None,
                ));
        };

        debug!(pod = %pod, namespace = %opts.namespace, "kubectl exec");
        ctx.emitter.emit(Event::K8sExec {
            pod: pod.clone(),
            namespace: opts.namespace.clone(),
        });

        let args = Self::build_exec_args(&pod, opts, command);
        let max_buffer = command.max_buffer.unwrap_or(ctx.max_buffer);
        let spec = ProcSpec {
            program: binary.to_string_lossy().into_owned(),
            args,
            cwd: command.cwd.clone(),
            env: HashMap::new(),
            stdin: command.stdin.clone(),
            stdout: command.stdout.clone(),
            stderr: command.stderr.clone(),
            max_buffer,
            kill_grace: ctx.kill_grace,
            progress: command.progress.clone(),
        };

        let outcome = run_process(spec, &ctx.cancel, &ctx.emitter).await?;
        let result = ResultBuilder::new(self.name(), command.display_line())
            .container(pod)
            .finish(
                outcome.stdout,
                outcome.stderr,
                outcome.exit_code,
                outcome.signal,
            );

        if outcome.overflowed {
            return Err(Error::BufferExceeded {
                limit: max_buffer,
                result: Some(Box::new(result)),
            });
        }
        Ok(result)
    }
}
