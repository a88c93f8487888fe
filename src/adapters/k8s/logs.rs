//! Log streaming
//!
//! Spawns `kubectl logs` and delivers output line-by-line. Follow-mode
//! streams reconnect on transient drops with exponential backoff, by
//! default 250 ms base doubling to a 5 s cap with at most 5 consecutive
//! failures; [`LogStreamOptions`] overrides all three. The failure counter
//! resets after any successfully read line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::K8sAdapter;
use crate::command::K8sOptions;

/// Options for one log stream.
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub tail: Option<u32>,
    /// `--since` duration string, e.g. `10m`.
    pub since: Option<String>,
    pub container: Option<String>,
    pub timestamps: bool,
    /// First reconnect delay after a dropped follow stream.
    pub backoff_base: Duration,
    /// Ceiling for the doubling reconnect delay.
    pub backoff_cap: Duration,
    /// Consecutive failed reconnects before the stream gives up. The counter
    /// resets after any successfully read line.
    pub max_reconnects: u32,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: None,
            since: None,
            container: None,
            timestamps: false,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(5),
            max_reconnects: 5,
        }
    }
}

/// Handle to a running log stream.
pub struct LogStreamHandle {
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl LogStreamHandle {
    /// Stop the stream: the child gets SIGTERM and remaining buffered lines
    /// are drained before the task ends.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

fn build_args(opts: &K8sOptions, pod: &str, stream: &LogStreamOptions) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    args.extend(K8sAdapter::global_flags(opts));
    if stream.follow {
        args.push("-f".to_string());
    }
    if let Some(tail) = stream.tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    if let Some(since) = &stream.since {
        args.push("--since".to_string());
        args.push(since.clone());
    }
    if let Some(container) = &stream.container {
        args.push("-c".to_string());
        args.push(container.clone());
    }
    if stream.timestamps {
        args.push("--timestamps".to_string());
    }
    args.push(pod.to_string());
    args
}

pub(crate) fn start_log_stream(
    binary: &Path,
    opts: &K8sOptions,
    pod: &str,
    on_line: Arc<dyn Fn(&str) + Send + Sync>,
    stream_opts: LogStreamOptions,
) -> LogStreamHandle {
    let stop = CancellationToken::new();
    let stop_task = stop.clone();
    let binary: PathBuf = binary.to_path_buf();
    let opts = opts.clone();
    let pod = pod.to_string();

    let task = tokio::spawn(async move {
        let mut reconnects = 0_u32;

        'outer: loop {
            let args = build_args(&opts, &pod, &stream_opts);
            let mut child = match TokioCommand::new(&binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(pod = %pod, "kubectl logs spawn failed: {}", e);
                    break;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                break;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            reconnects = 0;
                            on_line(&line);
                        }
                        Ok(None) | Err(_) => break,
                    },
                    _ = stop_task.cancelled() => {
                        if let Some(pid) = child.id() {
                            unsafe { libc::kill(pid as i32, libc::SIGTERM); }
                        }
                        // Drain whatever the child flushed before dying.
                        while let Ok(Ok(Some(line))) = tokio::time::timeout(
                            Duration::from_millis(200),
                            lines.next_line(),
                        )
                        .await
                        {
                            on_line(&line);
                        }
                        let _ = child.wait().await;
                        break 'outer;
                    }
                }
            }

            let _ = child.wait().await;

            if !stream_opts.follow {
                break;
            }
            if reconnects >= stream_opts.max_reconnects {
                warn!(pod = %pod, "log stream gave up after {} reconnects", reconnects);
                break;
            }
            let delay = stream_opts
                .backoff_base
                .saturating_mul(2_u32.saturating_pow(reconnects))
                .min(stream_opts.backoff_cap);
            reconnects += 1;
            debug!(pod = %pod, attempt = reconnects, ?delay, "log stream dropped, reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_task.cancelled() => break,
            }
        }
    });

    LogStreamHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_full_set() {
        let mut opts = K8sOptions::pod("api-1");
        opts.namespace = "prod".to_string();
        let stream = LogStreamOptions {
            follow: true,
            tail: Some(100),
            since: Some("10m".to_string()),
            container: Some("app".to_string()),
            timestamps: true,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(5),
            max_reconnects: 5,
        };
        let args = build_args(&opts, "api-1", &stream);
        assert_eq!(
            args,
            vec![
                "logs", "-n", "prod", "-f", "--tail", "100", "--since", "10m", "-c", "app",
                "--timestamps", "api-1"
            ]
        );
    }

    #[test]
    fn test_args_minimal() {
        let opts = K8sOptions::pod("api-1");
        let args = build_args(&opts, "api-1", &LogStreamOptions::default());
        assert_eq!(args, vec!["logs", "-n", "default", "api-1"]);
    }

    #[test]
    fn test_backoff_progression() {
        let opts = LogStreamOptions::default();
        let delays: Vec<Duration> = (0..6)
            .map(|n| {
                opts.backoff_base
                    .saturating_mul(2_u32.saturating_pow(n))
                    .min(opts.backoff_cap)
            })
            .collect();
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[1], Duration::from_millis(500));
        assert_eq!(delays[4], Duration::from_secs(4));
        assert_eq!(delays[5], opts.backoff_cap);
    }

    #[test]
    fn test_reconnect_policy_is_overridable() {
        let opts = LogStreamOptions {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
            max_reconnects: 2,
            ..Default::default()
        };
        assert_eq!(opts.max_reconnects, 2);
        let delay = opts
            .backoff_base
            .saturating_mul(2_u32.saturating_pow(5))
            .min(opts.backoff_cap);
        assert_eq!(delay, Duration::from_secs(1));
    }
}
