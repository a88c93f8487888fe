//! Remote Docker adapter
//!
//! Composes SSH and Docker: the docker argv is built exactly as for the
//! local CLI, shell-joined once more, and issued over the pooled SSH session
//! to the remote daemon. Temp containers live on the remote daemon and are
//! removed over the same session on disposal.
//!
//! No PTY is allocated on the exec channel, so a requested TTY is disabled
//! with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::docker::{
    build_exec_args, build_run_args, build_temp_run_args, validate_container_name,
    AutoCreateConfig, TempContainer, TempContainerRegistry, TempOwner,
};
use super::ssh::SshAdapter;
use super::{Adapter, Emitter, ExecContext};
use crate::command::{Command, DockerOptions, RunMode, SshOptions, StdinSource, Target};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::result::{CapturedStream, ExecResult, ResultBuilder, EXIT_TARGET_NOT_FOUND};

pub struct RemoteDockerAdapter {
    ssh: Arc<SshAdapter>,
    temp: TempContainerRegistry,
    auto_create: AutoCreateConfig,
    emitter: Emitter,
    kill_grace: Duration,
    max_buffer: usize,
    tty_warned: AtomicBool,
}

enum ExecutionPlan {
    Exec { container: String, create: bool },
    Run { image: String },
    Missing { container: String },
}

impl RemoteDockerAdapter {
    pub fn new(
        ssh: Arc<SshAdapter>,
        auto_create: AutoCreateConfig,
        emitter: Emitter,
        kill_grace: Duration,
        max_buffer: usize,
    ) -> Self {
        Self {
            ssh,
            temp: TempContainerRegistry::new(),
            auto_create,
            emitter,
            kill_grace,
            max_buffer,
            tty_warned: AtomicBool::new(false),
        }
    }

    fn internal_ctx(&self) -> ExecContext {
        ExecContext {
            id: 0,
            cancel: tokio_util::sync::CancellationToken::new(),
            emitter: Emitter::new(
                crate::events::EventBus::new(),
                Arc::new(crate::mask::Masker::disabled()),
                0,
                true,
            ),
            kill_grace: self.kill_grace,
            max_buffer: self.max_buffer,
        }
    }

    /// Run one docker CLI line on the remote host, quietly.
    async fn remote_cli(&self, ssh: &SshOptions, args: &[String]) -> Result<ExecResult> {
        let line = format!("docker {}", shell_words::join(args));
        let ctx = self.internal_ctx();
        self.ssh
            .run_line(ssh, &line, &line, &StdinSource::Null, self.max_buffer, &ctx, None)
            .await
    }

    async fn container_exists(&self, ssh: &SshOptions, name: &str) -> Result<bool> {
        let result = self
            .remote_cli(
                ssh,
                &[
                    "inspect".to_string(),
                    "--type".to_string(),
                    "container".to_string(),
                    name.to_string(),
                ],
            )
            .await?;
        Ok(result.exit_code == 0)
    }

    async fn create_temp_container(&self, ssh: &SshOptions, name: &str) -> Result<()> {
        let args = build_temp_run_args(name, &self.auto_create.image);
        let result = self.remote_cli(ssh, &args).await?;
        if result.exit_code != 0 {
            return Err(Error::Internal(anyhow::anyhow!(
                "remote helper container creation failed: {}",
                result.stderr.as_text().trim()
            )));
        }
        self.temp.insert(TempContainer {
            name: name.to_string(),
            created_at: chrono::Utc::now(),
            owner: TempOwner::Remote(ssh.clone()),
            remove_on_dispose: true,
        });
        debug!(container = name, host = %ssh.host, "created remote helper container");
        Ok(())
    }

    async fn plan(&self, ssh: &SshOptions, opts: &DockerOptions) -> Result<ExecutionPlan> {
        match opts.run_mode {
            RunMode::Run => {
                let image = opts.image.clone().ok_or_else(|| {
                    Error::InvalidArgument("run mode requires an image".to_string())
                })?;
                Ok(ExecutionPlan::Run { image })
            }
            RunMode::Exec | RunMode::Auto => {
                let Some(container) = opts.container.clone() else {
                    return match &opts.image {
                        Some(image) => Ok(ExecutionPlan::Run {
                            image: image.clone(),
                        }),
                        None => Err(Error::InvalidArgument(
                            "remote docker target needs a container or an image".to_string(),
                        )),
                    };
                };
                validate_container_name(&container)?;
                if self.container_exists(ssh, &container).await? {
                    Ok(ExecutionPlan::Exec {
                        container,
                        create: false,
                    })
                } else if opts.run_mode == RunMode::Auto && opts.image.is_some() {
                    Ok(ExecutionPlan::Run {
                        image: opts.image.clone().unwrap_or_default(),
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
        }
    }
}

#[async_trait]
impl Adapter for RemoteDockerAdapter {
    fn name(&self) -> &'static str {
        "remote-docker"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let Target::RemoteDocker { ssh, docker } = command.target_ref() else {
            return Err(Error::InvalidArgument(
                "remote-docker adapter invoked with a wrong target".to_string(),
            ));
        };

        if docker.tty && !self.tty_warned.swap(true, Ordering::Relaxed) {
            warn!("TTY is not supported over remote-docker exec channels; disabling");
        }

        let (args, container_label) = match self.plan(ssh, docker).await? {
            ExecutionPlan::Missing { container } => {
                return Ok(ResultBuilder::new(self.name(), command.display_line())
                    .host(ssh.host.clone())
                    .container(container.clone())
                    .finish(
                        CapturedStream::default(),
                        CapturedStream::new(
                            format!(
                                "Error response from daemon: No such container: {}\n",
                                container
                            )
                            .into_bytes(),
                        ),
                        EXIT_TARGET_NOT_FOUND,
                        None,
                    ));
            }
            ExecutionPlan::Exec { container, create } => {
                if create {
                    self.create_temp_container(ssh, &container).await?;
                }
                ctx.emitter.emit(Event::DockerExec {
                    container: container.clone(),
                });
                (
                    build_exec_args(&container, docker, command, false),
                    Some(container),
                )
            }
            ExecutionPlan::Run { image } => {
                ctx.emitter.emit(Event::DockerRun {
                    image: image.clone(),
                });
                (build_run_args(&image, docker, command, false), None)
            }
        };

        let line = format!("docker {}", shell_words::join(&args));
        let max_buffer = command.max_buffer.unwrap_or(ctx.max_buffer);
        self.ssh
            .run_line(
                ssh,
                &line,
                &command.display_line(),
                &command.stdin,
                max_buffer,
                ctx,
                container_label,
            )
            .await
    }

    async fn dispose(&self) -> Result<()> {
        for container in self.temp.drain_removable() {
            let TempOwner::Remote(ssh) = &container.owner else {
                continue;
            };
            let removed = match self
                .remote_cli(
                    ssh,
                    &["rm".to_string(), "-f".to_string(), container.name.clone()],
                )
                .await
            {
                Ok(result) => result.exit_code == 0,
                Err(e) => {
                    warn!(container = %container.name, "remote temp container removal failed: {}", e);
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
