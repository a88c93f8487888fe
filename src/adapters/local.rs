//! Local subprocess adapter
//!
//! Wraps an OS process spawn. `shell = Default` runs the rendered line under
//! `/bin/sh -c`; `shell = Never` execs the raw argv directly (`nice` is only
//! honoured on shell runs, where it is prefixed onto the line). The command
//! environment is merged over the process environment, command entries
//! winning.

use async_trait::async_trait;

use super::proc::{run_process, signal_name, ProcSpec};
use super::{Adapter, ExecContext};
use crate::command::{Command, PosixQuoter, Shell, StdinSource};
use crate::error::{Error, Result};
use crate::result::{CapturedStream, ExecResult, ResultBuilder, EXIT_KILLED};

pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the command into a program + argv for the OS.
    fn resolve(command: &Command) -> Result<(String, Vec<String>)> {
        if command.argv.is_empty() {
            return Err(Error::InvalidArgument("empty command".to_string()));
        }

        match &command.shell {
            Shell::Never => {
                let argv = command.argv_raw();
                Ok((argv[0].clone(), argv[1..].to_vec()))
            }
            Shell::Default => Ok((
                "/bin/sh".to_string(),
                vec!["-c".to_string(), command.render_line(&PosixQuoter)],
            )),
            Shell::Program(shell) => Ok((
                shell.clone(),
                vec!["-c".to_string(), command.render_line(&PosixQuoter)],
            )),
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult> {
        let (program, args) = Self::resolve(command)?;
        let max_buffer = command.max_buffer.unwrap_or(ctx.max_buffer);

        let spec = ProcSpec {
            program,
            args,
            cwd: command.cwd.clone(),
            env: command.env.clone(),
            stdin: command.stdin.clone(),
            stdout: command.stdout.clone(),
            stderr: command.stderr.clone(),
            max_buffer,
            kill_grace: ctx.kill_grace,
            progress: command.progress.clone(),
        };

        let outcome = run_process(spec, &ctx.cancel, &ctx.emitter).await?;
        let builder = ResultBuilder::new(self.name(), command.display_line());
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

    /// Blocking execution path for `run_sync`.
    ///
    /// The sync path captures streams in full and truncates afterwards;
    /// timeouts and cancellation are not enforced here.
    fn execute_sync(&self, command: &Command) -> Result<ExecResult> {
        use std::io::Write;
        use std::process::Stdio;

        let (program, args) = Self::resolve(command)?;

        let mut std_command = std::process::Command::new(&program);
        std_command.args(&args);
        if let Some(cwd) = &command.cwd {
            std_command.current_dir(cwd);
        }
        for (key, value) in &command.env {
            std_command.env(key, value);
        }
        std_command.stdin(match &command.stdin {
            StdinSource::Null => Stdio::null(),
            StdinSource::Inherit => Stdio::inherit(),
            _ => Stdio::piped(),
        });
        std_command.stdout(Stdio::piped());
        std_command.stderr(Stdio::piped());

        let mut child = std_command.spawn().map_err(Error::from)?;

        if let (StdinSource::Bytes(bytes), Some(mut stdin)) = (&command.stdin, child.stdin.take())
        {
            let _ = stdin.write_all(bytes);
        }

        let output = child.wait_with_output().map_err(Error::from)?;

        let max_buffer = command.max_buffer.unwrap_or(usize::MAX);
        let truncate = |mut bytes: Vec<u8>| -> CapturedStream {
            let truncated = bytes.len() > max_buffer;
            bytes.truncate(max_buffer);
            CapturedStream { bytes, truncated }
        };

        let (exit_code, signal) = if let Some(code) = output.status.code() {
            (code, None)
        } else {
            use std::os::unix::process::ExitStatusExt;
            (EXIT_KILLED, output.status.signal().map(signal_name))
        };

        Ok(ResultBuilder::new(self.name(), command.display_line()).finish(
            truncate(output.stdout),
            truncate(output.stderr),
            exit_code,
            signal,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Emitter;
    use crate::events::EventBus;
    use crate::mask::Masker;
    use crate::command::Template;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecContext {
        ExecContext {
            id: 1,
            cancel: CancellationToken::new(),
            emitter: Emitter::detached(EventBus::new(), Arc::new(Masker::new())),
            kill_grace: Duration::from_millis(500),
            max_buffer: 10 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_echo_with_interpolation() {
        let cmd = Template::new()
            .lit("echo ")
            .val("hello world")
            .build()
            .unwrap();
        let adapter = LocalAdapter::new();
        let result = adapter.execute(&cmd, &ctx()).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.bytes, b"hello world\n");
        assert!(result.stderr.bytes.is_empty());
        assert_eq!(result.adapter, "local");
    }

    #[tokio::test]
    async fn test_injection_neutralised() {
        let hostile = "'; rm -rf /";
        let cmd = Template::new().lit("echo ").val(hostile).build().unwrap();
        let result = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.as_text(), format!("{}\n", hostile));
    }

    #[tokio::test]
    async fn test_direct_exec_without_shell() {
        let cmd = Command::new("echo").arg("no shell").shell(false);
        let result = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap();
        assert_eq!(result.stdout.bytes, b"no shell\n");
    }

    #[tokio::test]
    async fn test_env_merge_command_wins() {
        std::env::set_var("XEC_TEST_MERGE", "process");
        let cmd = Command::new("sh")
            .args(["-c", "echo $XEC_TEST_MERGE"])
            .shell(false)
            .env("XEC_TEST_MERGE", "command");
        let result = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap();
        assert_eq!(result.stdout.as_text().trim(), "command");
    }

    #[tokio::test]
    async fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::new("pwd").cwd(dir.path());
        let result = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap();
        let reported = result.text();
        // Allow for symlinked temp dirs on some platforms.
        assert!(
            reported.ends_with(
                dir.path()
                    .file_name()
                    .unwrap()
                    .to_str()
                    .unwrap()
            ),
            "reported cwd: {}",
            reported
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result_here() {
        // The throw policy lives in the engine; the adapter just reports.
        let cmd = Command::new("sh").args(["-c", "exit 3"]).shell(false);
        let result = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.fails());
    }

    #[tokio::test]
    async fn test_buffer_exceeded() {
        let cmd = Command::new("sh")
            .args(["-c", "yes overflow | head -c 50000"])
            .shell(false)
            .max_buffer(1024);
        let err = LocalAdapter::new().execute(&cmd, &ctx()).await.unwrap_err();
        match err {
            Error::BufferExceeded { limit, result } => {
                assert_eq!(limit, 1024);
                let partial = result.unwrap();
                assert!(partial.stdout.truncated);
                assert_eq!(partial.stdout.bytes.len(), 1024);
            }
            other => panic!("expected BufferExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_sync() {
        let cmd = Command::new("echo").arg("sync path");
        let result = LocalAdapter::new().execute_sync(&cmd).unwrap();
        assert_eq!(result.stdout.bytes, b"sync path\n");
        assert!(result.ok());
    }

    #[test]
    fn test_execute_sync_stdin() {
        let cmd = Command::new("cat").stdin("from stdin");
        let result = LocalAdapter::new().execute_sync(&cmd).unwrap();
        assert_eq!(result.stdout.bytes, b"from stdin");
    }
}
