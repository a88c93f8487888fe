//! Shared subprocess driver
//!
//! Spawns a child process, feeds stdin, pumps stdout/stderr with
//! `max_buffer` enforcement and per-chunk event emission, and runs the
//! SIGTERM-then-SIGKILL escalation when the cancellation token fires or a
//! stream overflows. Used by the local adapter and by every CLI-driving
//! adapter (docker, kubectl).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Emitter;
use crate::command::{OutputSink, Progress, ProgressUpdate, StdinSource};
use crate::error::{Error, Result};
use crate::events::StreamKind;
use crate::result::{CapturedStream, EXIT_KILLED};

const READ_CHUNK: usize = 8192;

/// Everything needed to spawn and supervise one child process.
pub(crate) struct ProcSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Merged over the inherited process environment; entries win.
    pub env: HashMap<String, String>,
    pub stdin: StdinSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    pub max_buffer: usize,
    pub kill_grace: Duration,
    pub progress: Option<Progress>,
}

/// Raw outcome, before adapter-specific result mapping.
#[derive(Debug)]
pub(crate) struct ProcOutcome {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: i32,
    pub signal: Option<String>,
    /// The cancellation kill path ran.
    pub killed: bool,
    /// A stream hit `max_buffer` and the child was killed.
    pub overflowed: bool,
}

/// Map a raw signal number to its conventional name.
pub(crate) fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        other => format!("SIG{}", other),
    }
}

struct ProgressState {
    progress: Progress,
    stdout_bytes: std::sync::atomic::AtomicU64,
    stderr_bytes: std::sync::atomic::AtomicU64,
    started: Instant,
    last_update: parking_lot::Mutex<Instant>,
}

impl ProgressState {
    fn new(progress: Progress) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            progress,
            stdout_bytes: std::sync::atomic::AtomicU64::new(0),
            stderr_bytes: std::sync::atomic::AtomicU64::new(0),
            started: now,
            last_update: parking_lot::Mutex::new(now),
        })
    }

    fn record(&self, stream: StreamKind, len: usize) {
        use std::sync::atomic::Ordering;

        if !self.progress.enabled {
            return;
        }
        match stream {
            StreamKind::Stdout => self.stdout_bytes.fetch_add(len as u64, Ordering::Relaxed),
            StreamKind::Stderr => self.stderr_bytes.fetch_add(len as u64, Ordering::Relaxed),
        };

        let mut last = self.last_update.lock();
        if last.elapsed() >= self.progress.interval {
            *last = Instant::now();
            (self.progress.handler)(ProgressUpdate {
                stdout_bytes: self.stdout_bytes.load(Ordering::Relaxed),
                stderr_bytes: self.stderr_bytes.load(Ordering::Relaxed),
                elapsed: self.started.elapsed(),
            });
        }
    }
}

fn stdio_for(sink: &OutputSink) -> Stdio {
    match sink {
        OutputSink::Pipe | OutputSink::Channel(_) => Stdio::piped(),
        OutputSink::Inherit => Stdio::inherit(),
        OutputSink::Ignore => Stdio::null(),
    }
}

fn channel_of(sink: &OutputSink) -> Option<mpsc::Sender<Bytes>> {
    match sink {
        OutputSink::Channel(tx) => Some(tx.clone()),
        _ => None,
    }
}

/// Pump one output stream to completion (EOF, overflow, or task drop).
#[allow(clippy::too_many_arguments)]
async fn pump(
    mut reader: impl AsyncRead + Unpin,
    stream: StreamKind,
    forward: Option<mpsc::Sender<Bytes>>,
    max_buffer: usize,
    emitter: Emitter,
    overflow: CancellationToken,
    progress: Option<Arc<ProgressState>>,
) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let mut buf = vec![0_u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];

        emitter.output(stream, chunk);
        if let Some(tx) = &forward {
            // Backpressure from the consumer is intentional here.
            if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                // Consumer went away; keep capturing.
            }
        }
        if let Some(progress) = &progress {
            progress.record(stream, n);
        }

        let room = max_buffer.saturating_sub(captured.bytes.len());
        if room >= n {
            captured.bytes.extend_from_slice(chunk);
        } else {
            captured.bytes.extend_from_slice(&chunk[..room]);
            captured.truncated = true;
            overflow.cancel();
            break;
        }
    }

    captured
}

/// Spawn and supervise one child process to completion.
pub(crate) async fn run_process(
    spec: ProcSpec,
    cancel: &CancellationToken,
    emitter: &Emitter,
) -> Result<ProcOutcome> {
    let mut command = TokioCommand::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.stdin(match &spec.stdin {
        StdinSource::Null => Stdio::null(),
        StdinSource::Inherit => Stdio::inherit(),
        _ => Stdio::piped(),
    });
    command.stdout(stdio_for(&spec.stdout));
    command.stderr(stdio_for(&spec.stderr));
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(Error::from)?;
    debug!(program = %spec.program, pid = child.id(), "spawned child process");

    // Feed stdin from its source, then close it.
    let writer = match (&spec.stdin, child.stdin.take()) {
        (StdinSource::Bytes(bytes), Some(mut stdin)) => {
            let data = bytes.clone();
            Some(tokio::spawn(async move {
                let _ = stdin.write_all(&data).await;
                let _ = stdin.shutdown().await;
            }))
        }
        (StdinSource::Reader(shared), Some(mut stdin)) => {
            let shared = shared.clone();
            Some(tokio::spawn(async move {
                if let Some(mut reader) = shared.lock().await.take() {
                    let _ = tokio::io::copy(&mut reader, &mut stdin).await;
                }
                let _ = stdin.shutdown().await;
            }))
        }
        _ => None,
    };

    let overflow = CancellationToken::new();
    let progress = spec.progress.clone().map(ProgressState::new);

    let stdout_task = child.stdout.take().map(|reader| {
        tokio::spawn(pump(
            reader,
            StreamKind::Stdout,
            channel_of(&spec.stdout),
            spec.max_buffer,
            emitter.clone(),
            overflow.clone(),
            progress.clone(),
        ))
    });
    let stderr_task = child.stderr.take().map(|reader| {
        tokio::spawn(pump(
            reader,
            StreamKind::Stderr,
            channel_of(&spec.stderr),
            spec.max_buffer,
            emitter.clone(),
            overflow.clone(),
            progress.clone(),
        ))
    });

    let mut killed = false;
    let mut overflowed = false;

    let status = tokio::select! {
        status = child.wait() => Some(status.map_err(Error::from)?),
        _ = cancel.cancelled() => {
            killed = true;
            None
        }
        _ = overflow.cancelled() => {
            overflowed = true;
            None
        }
    };

    let status = match status {
        Some(status) => status,
        None => {
            // Graceful escalation: SIGTERM, wait out the grace, then SIGKILL.
            if let Some(pid) = child.id() {
                debug!(pid, "sending SIGTERM");
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(spec.kill_grace, child.wait()).await {
                Ok(status) => status.map_err(Error::from)?,
                Err(_) => {
                    debug!("grace expired, sending SIGKILL");
                    let _ = child.kill().await;
                    child.wait().await.map_err(Error::from)?
                }
            }
        }
    };

    if let Some(writer) = writer {
        writer.abort();
    }

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => CapturedStream::default(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => CapturedStream::default(),
    };

    let (exit_code, signal) = if killed || overflowed {
        (EXIT_KILLED, Some("SIGTERM".to_string()))
    } else if let Some(code) = status.code() {
        (code, None)
    } else {
        use std::os::unix::process::ExitStatusExt;
        (EXIT_KILLED, status.signal().map(signal_name))
    };

    Ok(ProcOutcome {
        stdout,
        stderr,
        exit_code,
        signal,
        killed,
        overflowed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::mask::Masker;

    fn test_emitter() -> Emitter {
        Emitter::detached(EventBus::new(), Arc::new(Masker::new()))
    }

    fn spec(program: &str, args: &[&str]) -> ProcSpec {
        ProcSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            stdin: StdinSource::Null,
            stdout: OutputSink::Pipe,
            stderr: OutputSink::Pipe,
            max_buffer: 1024 * 1024,
            kill_grace: Duration::from_millis(500),
            progress: None,
        }
    }

    #[tokio::test]
    async fn test_capture_stdout() {
        let outcome = run_process(spec("echo", &["hello"]), &CancellationToken::new(), &test_emitter())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.bytes, b"hello\n");
        assert!(!outcome.stdout.truncated);
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let outcome = run_process(
            spec("sh", &["-c", "exit 7"]),
            &CancellationToken::new(),
            &test_emitter(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn test_stdin_bytes() {
        let mut s = spec("cat", &[]);
        s.stdin = StdinSource::Bytes(b"piped input".to_vec());
        let outcome = run_process(s, &CancellationToken::new(), &test_emitter())
            .await
            .unwrap();
        assert_eq!(outcome.stdout.bytes, b"piped input");
    }

    #[tokio::test]
    async fn test_cancellation_kills() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let outcome = run_process(spec("sleep", &["10"]), &cancel, &test_emitter())
            .await
            .unwrap();
        assert!(outcome.killed);
        assert_eq!(outcome.exit_code, EXIT_KILLED);
        assert_eq!(outcome.signal.as_deref(), Some("SIGTERM"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_overflow_truncates_and_kills() {
        let mut s = spec("sh", &["-c", "yes x | head -c 100000; sleep 5"]);
        s.max_buffer = 4096;
        let start = Instant::now();
        let outcome = run_process(s, &CancellationToken::new(), &test_emitter())
            .await
            .unwrap();
        assert!(outcome.overflowed);
        assert!(outcome.stdout.truncated);
        assert_eq!(outcome.stdout.bytes.len(), 4096);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(42), "SIG42");
    }
}
