//! SSH adapter
//!
//! One persistent client per `{host, port, user, auth}` fingerprint (see
//! [`pool`]); each command opens a fresh channel and issues an exec request.
//!
//! Shell semantics: the remote side always hands the exec request to the
//! user's login shell, so `shell = Never` sends the joined argv line as-is,
//! while `shell = Default` additionally wraps it in `sh -c '…'` to pin POSIX
//! word splitting regardless of the remote login shell.

pub mod pool;
mod sftp;

pub use pool::{fingerprint, SshPool};
pub use sftp::TransferResult;

use std::sync::Arc;

use async_trait::async_trait;
use russh::ChannelMsg;
use tracing::debug;

use super::{Adapter, ExecContext};
use crate::command::{Command, PosixQuoter, Quoter, Shell, SshOptions, StdinSource, SudoMethod, Target};
use crate::error::{Error, Result};
use crate::result::{CapturedStream, ExecResult, ResultBuilder, EXIT_KILLED};

pub struct SshAdapter {
    pub(crate) pool: Arc<SshPool>,
}

impl SshAdapter {
    pub fn new(pool: Arc<SshPool>) -> Self {
        Self { pool }
    }

    /// Compose the remote command line: env assignments and `cd` prefix
    /// first, then the shell wrapper, then the sudo prefix outermost.
    pub(crate) fn build_remote_line(command: &Command, opts: &SshOptions) -> String {
        let quoter = PosixQuoter;
        let mut inner = match command.shell {
            Shell::Never => shell_words::join(command.argv_raw()),
            _ => command.render_line(&quoter),
        };

        if !command.env.is_empty() {
            let mut keys: Vec<&String> = command.env.keys().collect();
            keys.sort();
            let assignments: Vec<String> = keys
                .iter()
                .map(|k| format!("{}={}", k, quoter.quote(&command.env[*k])))
                .collect();
            inner = format!("{} {}", assignments.join(" "), inner);
        }

        if let Some(cwd) = &command.cwd {
            inner = format!("cd {} && {}", quoter.quote(&cwd.to_string_lossy()), inner);
        }

        let mut line = match &command.shell {
            Shell::Never => inner,
            Shell::Default => format!("sh -c {}", quoter.quote(&inner)),
            Shell::Program(shell) => format!("{} -c {}", shell, quoter.quote(&inner)),
        };

        if let Some(sudo) = &opts.sudo {
            line = match sudo.method {
                SudoMethod::Stdin => format!("sudo -S -p '' {}", line),
                SudoMethod::Askpass => format!("sudo -A {}", line),
            };
        }

        line
    }

    /// Run one already-composed line over the pooled connection.
    ///
    /// Shared with the remote-docker adapter, which builds its own line.
    pub(crate) async fn run_line(
        &self,
        opts: &SshOptions,
        line: &str,
        display: &str,
        stdin: &StdinSource,
        max_buffer: usize,
        ctx: &ExecContext,
        container: Option<String>,
    ) -> Result<ExecResult> {
        let acquired = self.pool.acquire(opts).await?;
        let outcome = self
            .run_on_channel(&acquired, opts, line, display, stdin, max_buffer, ctx, container)
            .await;
        self.pool.release(&acquired.key).await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_on_channel(
        &self,
        acquired: &pool::AcquiredClient,
        opts: &SshOptions,
        line: &str,
        display: &str,
        stdin: &StdinSource,
        max_buffer: usize,
        ctx: &ExecContext,
        container: Option<String>,
    ) -> Result<ExecResult> {
        // Channel gate: serialises channels unless multiplexing raised the cap.
        let _permit = acquired
            .channels
            .acquire()
            .await
            .map_err(|_| Error::Connection("connection closed while waiting for channel".into()))?;

        let mut channel = {
            let handle = acquired.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(Error::from)?
        };

        debug!(host = %opts.host, "exec over SSH channel");
        channel.exec(true, line).await.map_err(Error::from)?;

        // Sudo password goes first and is never echoed anywhere.
        if let Some(sudo) = &opts.sudo {
            if sudo.method == SudoMethod::Stdin {
                if let Some(password) = &sudo.password {
                    let feed = format!("{}\n", password);
                    channel.data(feed.as_bytes()).await.map_err(Error::from)?;
                }
            }
        }

        match stdin {
            StdinSource::Bytes(bytes) => {
                channel.data(&bytes[..]).await.map_err(Error::from)?;
            }
            StdinSource::Reader(shared) => {
                if let Some(reader) = shared.lock().await.take() {
                    channel.data(reader).await.map_err(Error::from)?;
                }
            }
            StdinSource::Null | StdinSource::Inherit => {}
        }
        channel.eof().await.map_err(Error::from)?;

        let builder = match container {
            Some(name) => ResultBuilder::new("remote-docker", display)
                .host(opts.host.clone())
                .container(name),
            None => ResultBuilder::new("ssh", display).host(opts.host.clone()),
        };

        let mut stdout = CapturedStream::default();
        let mut stderr = CapturedStream::default();
        let mut exit_code: Option<i32> = None;
        let mut exit_signal: Option<String> = None;
        let mut killed = false;
        let mut overflowed = false;

        let mut append = |captured: &mut CapturedStream, data: &[u8]| -> bool {
            let room = max_buffer.saturating_sub(captured.bytes.len());
            if room >= data.len() {
                captured.bytes.extend_from_slice(data);
                true
            } else {
                captured.bytes.extend_from_slice(&data[..room]);
                captured.truncated = true;
                false
            }
        };

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ChannelMsg::Data { ref data } => {
                            ctx.emitter.output(crate::events::StreamKind::Stdout, data);
                            if !append(&mut stdout, data) {
                                overflowed = true;
                                let _ = channel.signal(russh::Sig::TERM).await;
                                break;
                            }
                        }
                        ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                            ctx.emitter.output(crate::events::StreamKind::Stderr, data);
                            if !append(&mut stderr, data) {
                                overflowed = true;
                                let _ = channel.signal(russh::Sig::TERM).await;
                                break;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            exit_code = Some(exit_status as i32);
                        }
                        ChannelMsg::ExitSignal { signal_name, .. } => {
                            exit_signal = Some(sig_name(&signal_name));
                        }
                        _ => {}
                    }
                }
                _ = ctx.cancel.cancelled() => {
                    killed = true;
                    let _ = channel.signal(russh::Sig::TERM).await;
                    // Drain what the remote still sends inside the grace
                    // window, then escalate and stop.
                    let deadline = tokio::time::sleep(ctx.kill_grace);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            msg = channel.wait() => {
                                match msg {
                                    None => break,
                                    Some(ChannelMsg::Data { ref data }) => {
                                        append(&mut stdout, data);
                                    }
                                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                                        exit_code = Some(exit_status as i32);
                                    }
                                    Some(_) => {}
                                }
                            }
                            _ = &mut deadline => {
                                let _ = channel.signal(russh::Sig::KILL).await;
                                break;
                            }
                        }
                    }
                    break;
                }
            }
        }

        let _ = channel.close().await;

        let (exit_code, signal) = if killed {
            (EXIT_KILLED, Some("SIGTERM".to_string()))
        } else if let Some(code) = exit_code {
            (code, exit_signal)
        } else {
            (EXIT_KILLED, exit_signal)
        };

        let result = builder.finish(stdout, stderr, exit_code, signal);
        if overflowed {
            return Err(Error::BufferExceeded {
                limit: max_buffer,
                result: Some(Box::new(result)),
            });
        }
        Ok(result)
    }

    /// Run the pool's idle sweep; called opportunistically by the engine.
    pub async fn sweep_idle(&self) {
        self.pool.sweep_idle().await;
    }
}

fn sig_name(sig: &russh::Sig) -> String {
    match sig {
        russh::Sig::Custom(name) => {
            if name.starts_with("SIG") {
                name.clone()
            } else {
                format!("SIG{}", name)
            }
        }
        other => format!("SIG{:?}", other),
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let Target::Ssh(opts) = command.target_ref() else {
            return Err(Error::InvalidArgument(
                "ssh adapter invoked with a non-SSH target".to_string(),
            ));
        };

        let line = Self::build_remote_line(command, opts);
        let max_buffer = command.max_buffer.unwrap_or(ctx.max_buffer);
        self.run_line(
            opts,
            &line,
            &command.display_line(),
            &command.stdin,
            max_buffer,
            ctx,
            None,
        )
        .await
    }

    async fn dispose(&self) -> Result<()> {
        self.pool.dispose().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{SshAuth, SudoOptions, Template};

    fn opts() -> SshOptions {
        SshOptions::new("build1", "deploy", SshAuth::Agent)
    }

    #[test]
    fn test_remote_line_wraps_shell() {
        let cmd = Template::new()
            .lit("echo ")
            .val("hello world")
            .build()
            .unwrap();
        let line = SshAdapter::build_remote_line(&cmd, &opts());
        assert_eq!(line, "sh -c 'echo '\\''hello world'\\'''");
    }

    #[test]
    fn test_remote_line_without_shell_joins_argv() {
        let cmd = Command::new("ls").arg("-la").shell(false);
        let line = SshAdapter::build_remote_line(&cmd, &opts());
        assert_eq!(line, "ls -la");
    }

    #[test]
    fn test_remote_line_env_and_cwd() {
        let cmd = Command::new("make")
            .arg("test")
            .env("CI", "1")
            .cwd("/srv/app")
            .shell(false);
        let line = SshAdapter::build_remote_line(&cmd, &opts());
        assert_eq!(line, "cd /srv/app && CI=1 make test");
    }

    #[test]
    fn test_sudo_stdin_prefix() {
        let mut o = opts();
        o.sudo = Some(SudoOptions {
            password: Some("pw".to_string()),
            method: SudoMethod::Stdin,
        });
        let cmd = Command::new("systemctl").args(["restart", "app"]).shell(false);
        let line = SshAdapter::build_remote_line(&cmd, &o);
        assert_eq!(line, "sudo -S -p '' systemctl restart app");
        // The password itself never appears on the line.
        assert!(!line.contains("pw"));
    }

    #[test]
    fn test_sudo_askpass_prefix() {
        let mut o = opts();
        o.sudo = Some(SudoOptions {
            password: None,
            method: SudoMethod::Askpass,
        });
        let cmd = Command::new("whoami").shell(false);
        let line = SshAdapter::build_remote_line(&cmd, &o);
        assert_eq!(line, "sudo -A whoami");
    }

    #[test]
    fn test_sig_names() {
        assert_eq!(sig_name(&russh::Sig::TERM), "SIGTERM");
        assert_eq!(sig_name(&russh::Sig::KILL), "SIGKILL");
        assert_eq!(sig_name(&russh::Sig::Custom("USR1".into())), "SIGUSR1");
    }
}
