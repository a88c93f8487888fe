//! Port forwarding
//!
//! Spawns `kubectl port-forward` as a long-lived child, parses the
//! "Forwarding from 127.0.0.1:N" line to learn the bound port (needed when
//! the caller asked for port 0), and hands back a handle that kills the
//! child on close.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tracing::{debug, warn};

use super::K8sAdapter;
use crate::command::K8sOptions;
use crate::error::{Error, Result};

/// Budget for kubectl to report the bound port.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn forwarding_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+)").expect("forwarding pattern")
    })
}

/// Handle to a live port-forward. Closing terminates the subprocess.
pub struct PortForwardHandle {
    local_port: u16,
    child: Child,
    open: Arc<AtomicBool>,
}

impl PortForwardHandle {
    /// The locally bound port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the forward is still believed to be up.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Terminate the forward.
    pub async fn close(mut self) {
        self.open.store(false, Ordering::Relaxed);
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
        debug!(port = self.local_port, "port-forward closed");
    }
}

pub(crate) async fn start_port_forward(
    binary: &Path,
    opts: &K8sOptions,
    pod: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<PortForwardHandle> {
    let mut args = vec!["port-forward".to_string()];
    args.extend(K8sAdapter::global_flags(opts));
    args.push(pod.to_string());
    args.push(format!("{}:{}", local_port, remote_port));

    let mut child = TokioCommand::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(Error::from)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("port-forward stdout unavailable")))?;
    let mut lines = BufReader::new(stdout).lines();

    // Wait for kubectl to announce the bound address.
    let bound_port = tokio::time::timeout(READY_TIMEOUT, async {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(captures) = forwarding_pattern().captures(&line) {
                if let Ok(port) = captures[1].parse::<u16>() {
                    return Some(port);
                }
            }
        }
        None
    })
    .await
    .map_err(|_| Error::Connection(format!("port-forward to {} did not become ready", pod)))?
    .ok_or_else(|| Error::Connection(format!("port-forward to {} exited before binding", pod)))?;

    let open = Arc::new(AtomicBool::new(true));

    // Keep draining kubectl's chatter; flip the flag if the stream ends.
    let open_flag = open.clone();
    tokio::spawn(async move {
        while let Ok(Some(_)) = lines.next_line().await {}
        if open_flag.swap(false, Ordering::Relaxed) {
            warn!("port-forward subprocess output ended");
        }
    });

    debug!(pod, local = bound_port, remote = remote_port, "port-forward established");
    Ok(PortForwardHandle {
        local_port: bound_port,
        child,
        open,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_line_parses() {
        let captures = forwarding_pattern()
            .captures("Forwarding from 127.0.0.1:41837 -> 5432")
            .unwrap();
        assert_eq!(&captures[1], "41837");
    }

    #[test]
    fn test_non_matching_lines_ignored() {
        assert!(forwarding_pattern()
            .captures("Forwarding from [::1]:41837 -> 5432")
            .is_none());
        assert!(forwarding_pattern().captures("Handling connection").is_none());
    }
}
