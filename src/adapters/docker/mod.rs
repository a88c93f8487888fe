//! Docker CLI adapter
//!
//! Drives the `docker` binary (discovered once by probing a fixed path list)
//! rather than the daemon API, so `DOCKER_HOST` and the rest of the user's
//! environment flow through untouched. Two modes: `exec` into an existing
//! container, or `run` an ephemeral one from an image.

pub mod ops;
pub mod temp;

pub use temp::{TempContainer, TempContainerRegistry, TempOwner, MANAGED_LABEL};

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::proc::{run_process, ProcSpec};
use super::{Adapter, Emitter, ExecContext};
use crate::command::{Command, DockerOptions, PosixQuoter, RunMode, Shell, Target};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::result::{CapturedStream, ExecResult, ResultBuilder, EXIT_TARGET_NOT_FOUND};

/// Fixed probe list for the docker binary; `XEC_DOCKER_BIN` overrides.
const PROBE_PATHS: &[&str] = &[
    "/usr/local/bin/docker",
    "/usr/bin/docker",
    "/opt/homebrew/bin/docker",
];

/// Auto-creation of helper containers for missing exec targets.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AutoCreateConfig {
    pub enabled: bool,
    pub image: String,
}

impl Default for AutoCreateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:3.20".to_string(),
        }
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("container name pattern"))
}

/// Validate a container name against docker's charset, rejecting shell
/// metacharacters and path traversal.
pub(crate) fn validate_container_name(name: &str) -> Result<()> {
    if !name_pattern().is_match(name) || name.contains("..") {
        return Err(Error::InvalidArgument(format!(
            "invalid container name: {:?}",
            name
        )));
    }
    Ok(())
}

/// The command tail appended after the container/image: either the raw argv
/// or a `sh -c <line>` wrapper.
fn command_tail(command: &Command) -> Vec<String> {
    match &command.shell {
        Shell::Never => command.argv_raw(),
        Shell::Default => vec![
            "sh".to_string(),
            "-c".to_string(),
            command.render_line(&PosixQuoter),
        ],
        Shell::Program(shell) => vec![
            shell.clone(),
            "-c".to_string(),
            command.render_line(&PosixQuoter),
        ],
    }
}

fn env_pairs(command: &Command, opts: &DockerOptions) -> Vec<String> {
    // Command env wins over target env; keys sorted for deterministic argv.
    let mut merged: std::collections::BTreeMap<&String, &String> = opts.env.iter().collect();
    merged.extend(command.env.iter());
    merged
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// `docker exec` argv for an existing container.
pub(crate) fn build_exec_args(
    container: &str,
    opts: &DockerOptions,
    command: &Command,
    tty: bool,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if command.stdin.is_present() {
        args.push("-i".to_string());
    }
    if tty {
        args.push("-t".to_string());
    }
    if let Some(user) = &opts.user {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    if let Some(workdir) = &opts.workdir {
        args.push("-w".to_string());
        args.push(workdir.clone());
    }
    for pair in env_pairs(command, opts) {
        args.push("-e".to_string());
        args.push(pair);
    }
    args.push(container.to_string());
    args.extend(command_tail(command));
    args
}

/// `docker run` argv for an ephemeral container.
pub(crate) fn build_run_args(
    image: &str,
    opts: &DockerOptions,
    command: &Command,
    tty: bool,
) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if opts.auto_remove {
        args.push("--rm".to_string());
    }
    if command.stdin.is_present() {
        args.push("-i".to_string());
    }
    if tty {
        args.push("-t".to_string());
    }
    for volume in &opts.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    for port in &opts.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    for pair in env_pairs(command, opts) {
        args.push("-e".to_string());
        args.push(pair);
    }
    if let Some(network) = &opts.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(user) = &opts.user {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    if let Some(workdir) = &opts.workdir {
        args.push("-w".to_string());
        args.push(workdir.clone());
    }

    match &command.shell {
        Shell::Never => {
            args.push(image.to_string());
            args.extend(command.argv_raw());
        }
        shell => {
            let program = match shell {
                Shell::Program(p) => p.clone(),
                _ => "sh".to_string(),
            };
            args.push("--entrypoint".to_string());
            args.push(program);
            args.push(image.to_string());
            args.push("-c".to_string());
            args.push(command.render_line(&PosixQuoter));
        }
    }
    args
}

/// Detached helper container spawned for a missing exec target.
pub(crate) fn build_temp_run_args(name: &str, image: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
        image.to_string(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]
}

/// Generate a unique helper container name.
pub(crate) fn temp_container_name() -> String {
    format!("xec-tmp-{}", Uuid::new_v4().simple())
}

enum ExecutionPlan {
    Exec { container: String, create: bool },
    Run { image: String },
    Missing { container: String },
}

pub struct DockerAdapter {
    binary: OnceLock<Option<PathBuf>>,
    temp: TempContainerRegistry,
    auto_create: AutoCreateConfig,
    emitter: Emitter,
    kill_grace: Duration,
    max_buffer: usize,
    tty_warned: AtomicBool,
}

impl DockerAdapter {
    pub fn new(
        auto_create: AutoCreateConfig,
        emitter: Emitter,
        kill_grace: Duration,
        max_buffer: usize,
    ) -> Self {
        Self {
            binary: OnceLock::new(),
            temp: TempContainerRegistry::new(),
            auto_create,
            emitter,
            kill_grace,
            max_buffer,
            tty_warned: AtomicBool::new(false),
        }
    }

    /// Discover the docker binary once; result is cached for the adapter's
    /// lifetime.
    fn discover(&self) -> Option<PathBuf> {
        self.binary
            .get_or_init(|| {
                if let Ok(explicit) = std::env::var("XEC_DOCKER_BIN") {
                    return Some(PathBuf::from(explicit));
                }
                for candidate in PROBE_PATHS {
                    if Path::new(candidate).is_file() {
                        return Some(PathBuf::from(candidate));
                    }
                }
                if let Some(paths) = std::env::var_os("PATH") {
                    for dir in std::env::split_paths(&paths) {
                        let candidate = dir.join("docker");
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
            adapter: "docker".to_string(),
            reason: "docker binary not found".to_string(),
        })
    }

    /// TTY is granted only when requested and all three standard streams are
    /// terminals; otherwise it is silently disabled with a single warning.
    fn effective_tty(&self, requested: bool) -> bool {
        if !requested {
            return false;
        }
        let interactive = std::io::stdin().is_terminal()
            && std::io::stdout().is_terminal()
            && std::io::stderr().is_terminal();
        if !interactive && !self.tty_warned.swap(true, Ordering::Relaxed) {
            warn!("TTY requested but the calling process has no interactive terminal; disabling");
        }
        interactive
    }

    /// Quiet internal CLI invocation, used for probes and cleanup.
    pub(crate) async fn cli_quiet(&self, args: &[String]) -> Result<ExecResult> {
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
            // Suppress output events entirely for internal invocations.
            crate::events::EventBus::new(),
            std::sync::Arc::new(crate::mask::Masker::disabled()),
            0,
            true,
        );
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = run_process(spec, &token, &quiet_emitter).await?;
        Ok(
            ResultBuilder::new("docker", format!("docker {}", args.join(" "))).finish(
                outcome.stdout,
                outcome.stderr,
                outcome.exit_code,
                outcome.signal,
            ),
        )
    }

    pub(crate) async fn container_exists(&self, name: &str) -> Result<bool> {
        let result = self
            .cli_quiet(&[
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                name.to_string(),
            ])
            .await?;
        Ok(result.exit_code == 0)
    }

    /// Spawn and register a detached helper container.
    pub(crate) async fn create_temp_container(&self, name: &str) -> Result<()> {
        let args = build_temp_run_args(name, &self.auto_create.image);
        let result = self.cli_quiet(&args).await?;
        if result.exit_code != 0 {
            return Err(Error::Internal(anyhow::anyhow!(
                "helper container creation failed: {}",
                result.stderr.as_text().trim()
            )));
        }
        self.temp.insert(TempContainer {
            name: name.to_string(),
            created_at: chrono::Utc::now(),
            owner: TempOwner::Local,
            remove_on_dispose: true,
        });
        debug!(container = name, "created helper container");
        self.emitter.emit(Event::DockerRun {
            image: self.auto_create.image.clone(),
        });
        Ok(())
    }

    async fn plan(&self, opts: &DockerOptions) -> Result<ExecutionPlan> {
        match opts.run_mode {
            RunMode::Run => {
                let image = opts.image.clone().ok_or_else(|| {
                    Error::InvalidArgument("run mode requires an image".to_string())
                })?;
                Ok(ExecutionPlan::Run { image })
            }
            RunMode::Exec => {
                let container = opts.container.clone().ok_or_else(|| {
                    Error::InvalidArgument("exec mode requires a container".to_string())
                })?;
                validate_container_name(&container)?;
                if self.container_exists(&container).await? {
                    Ok(ExecutionPlan::Exec {
                        container,
                        create: false,
                    })
                } else if self.auto_create.enabled {
                    Ok(ExecutionPlan::Exec {
                        container,
                        create: true,
                    })
                } else {
                    Ok(ExecutionPlan::Missing { container })
                }
            }
            RunMode::Auto => match (&opts.container, &opts.image) {
                (Some(container), image) => {
                    validate_container_name(container)?;
                    if self.container_exists(container).await? {
                        Ok(ExecutionPlan::Exec {
                            container: container.clone(),
                            create: false,
                        })
                    } else if let Some(image) = image {
                        Ok(ExecutionPlan::Run {
                            image: image.clone(),
                        })
                    } else if self.auto_create.enabled {
                        Ok(ExecutionPlan::Exec {
                            container: container.clone(),
                            create: true,
                        })
                    } else {
                        Ok(ExecutionPlan::Missing {
                            container: container.clone(),
                        })
                    }
                }
                (None, Some(image)) => Ok(ExecutionPlan::Run {
                    image: image.clone(),
                }),
                (None, None) => Err(Error::InvalidArgument(
                    "docker target needs a container or an image".to_string(),
                )),
            },
        }
    }

    /// A 125 result for a missing target, mirroring the docker CLI's own
    /// error text.
    fn missing_result(&self, command: &Command, container: &str) -> ExecResult {
        ResultBuilder::new("docker", command.display_line())
            .container(container.to_string())
            .finish(
                CapturedStream::default(),
                CapturedStream::new(
                    format!("Error response from daemon: No such container: {}\n", container)
                        .into_bytes(),
                ),
                EXIT_TARGET_NOT_FOUND,
                None,
            )
    }

    /// The set of helper containers this adapter currently owns.
    pub fn temp_registry(&self) -> &TempContainerRegistry {
        &self.temp
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        self.discover().is_some()
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let Target::Docker(opts) = command.target_ref() else {
            return Err(Error::InvalidArgument(
                "docker adapter invoked with a non-docker target".to_string(),
            ));
        };
        let binary = self.binary_path()?;
        let tty = self.effective_tty(opts.tty);

        let (args, container_label) = match self.plan(opts).await? {
            ExecutionPlan::Missing { container } => {
                return Ok(self.missing_result(command, &container));
            }
            ExecutionPlan::Exec { container, create } => {
                if create {
                    self.create_temp_container(&container).await?;
                }
                ctx.emitter.emit(Event::DockerExec {
                    container: container.clone(),
                });
                (
                    build_exec_args(&container, opts, command, tty),
                    Some(container),
                )
            }
            ExecutionPlan::Run { image } => {
                ctx.emitter.emit(Event::DockerRun {
                    image: image.clone(),
                });
                let mut args = build_run_args(&image, opts, command, tty);
                let mut label = None;
                if !opts.auto_remove {
                    // Without --rm the container would outlive the command
                    // anonymously; name it and own its cleanup.
                    let name = temp_container_name();
                    args.splice(
                        1..1,
                        [
                            "--name".to_string(),
                            name.clone(),
                            "--label".to_string(),
                            MANAGED_LABEL.to_string(),
                        ],
                    );
                    self.temp.insert(TempContainer {
                        name: name.clone(),
                        created_at: chrono::Utc::now(),
                        owner: TempOwner::Local,
                        remove_on_dispose: true,
                    });
                    label = Some(name);
                }
                (args, label)
            }
        };

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

        let mut builder = ResultBuilder::new(self.name(), command.display_line());
        if let Some(container) = container_label {
            builder = builder.container(container);
        }
        let result = builder.finish(
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

    /// Remove every owned helper container; errors are swallowed and
    /// reported as `temp:cleanup` events.
    async fn dispose(&self) -> Result<()> {
        for container in self.temp.drain_removable() {
            if !matches!(container.owner, TempOwner::Local) {
                continue;
            }
            let removed = match self
                .cli_quiet(&[
                    "rm".to_string(),
                    "-f".to_string(),
                    container.name.clone(),
                ])
                .await
            {
                Ok(result) => result.exit_code == 0,
                Err(e) => {
                    warn!(container = %container.name, "temp container removal failed: {}", e);
                    false
                }
            };
            self.emitter.emit(Event::TempCleanup {
                container: container.name,
                success: removed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Template;

    fn exec_opts(container: &str) -> DockerOptions {
        DockerOptions::container(container)
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_container_name("web-1").is_ok());
        assert!(validate_container_name("app_2.0").is_ok());
        assert!(validate_container_name("A9").is_ok());

        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name("a;b").is_err());
        assert!(validate_container_name("$(boom)").is_err());
        assert!(validate_container_name("a/../b").is_err());
        assert!(validate_container_name("a..b").is_err());
    }

    #[test]
    fn test_exec_args_shape() {
        let mut opts = exec_opts("web");
        opts.user = Some("app".to_string());
        opts.workdir = Some("/srv".to_string());

        let cmd = Template::new()
            .lit("echo ")
            .val("hi there")
            .build()
            .unwrap()
            .stdin("input");
        let args = build_exec_args("web", &opts, &cmd, false);
        assert_eq!(
            args,
            vec![
                "exec", "-i", "-u", "app", "-w", "/srv", "web", "sh", "-c", "echo 'hi there'"
            ]
        );
    }

    #[test]
    fn test_exec_args_direct_argv() {
        let cmd = Command::new("ls").arg("-la").shell(false);
        let args = build_exec_args("web", &exec_opts("web"), &cmd, false);
        assert_eq!(args, vec!["exec", "web", "ls", "-la"]);
    }

    #[test]
    fn test_exec_args_env_sorted() {
        let cmd = Command::new("env")
            .shell(false)
            .env("B", "2")
            .env("A", "1");
        let args = build_exec_args("web", &exec_opts("web"), &cmd, false);
        assert_eq!(
            args,
            vec!["exec", "-e", "A=1", "-e", "B=2", "web", "env"]
        );
    }

    #[test]
    fn test_run_args_shape() {
        let mut opts = DockerOptions::image("alpine:3.20");
        opts.volumes.push("/data:/data".to_string());
        opts.ports.push("8080:80".to_string());
        opts.network = Some("backend".to_string());

        let cmd = Template::new().lit("echo hi").build().unwrap();
        let args = build_run_args("alpine:3.20", &opts, &cmd, false);
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "-v",
                "/data:/data",
                "-p",
                "8080:80",
                "--network",
                "backend",
                "--entrypoint",
                "sh",
                "alpine:3.20",
                "-c",
                "echo hi"
            ]
        );
    }

    #[test]
    fn test_run_args_direct_argv() {
        let opts = DockerOptions::image("alpine:3.20");
        let cmd = Command::new("uname").arg("-a").shell(false);
        let args = build_run_args("alpine:3.20", &opts, &cmd, false);
        assert_eq!(args, vec!["run", "--rm", "alpine:3.20", "uname", "-a"]);
    }

    #[test]
    fn test_temp_run_args_carry_label() {
        let args = build_temp_run_args("xec-tmp-1", "alpine:3.20");
        assert!(args.contains(&"--label".to_string()));
        assert!(args.contains(&MANAGED_LABEL.to_string()));
        assert!(args.windows(2).any(|w| w[0] == "sleep" && w[1] == "infinity"));
    }

    #[test]
    fn test_run_args_without_rm() {
        let mut opts = DockerOptions::image("alpine:3.20");
        opts.auto_remove = false;
        let cmd = Command::new("true").shell(false);
        let args = build_run_args("alpine:3.20", &opts, &cmd, false);
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[test]
    fn test_temp_names_unique() {
        let a = temp_container_name();
        let b = temp_container_name();
        assert_ne!(a, b);
        assert!(a.starts_with("xec-tmp-"));
        assert!(validate_container_name(&a).is_ok());
    }
}
