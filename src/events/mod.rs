//! Command lifecycle events
//!
//! The engine publishes every observable step of a command's life on a
//! process-wide bus: start, output chunks, completion or error, plus
//! transport-level notifications (SSH connects, docker exec/run, temp
//! container cleanup). Payloads carrying command text or output are masked
//! before they reach the bus.

mod bus;

pub use bus::{EventBus, Selector, Subscription};

use crate::error::ErrorKind;

/// Which of the two output streams a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Event discriminant used for subscription filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    CommandStart,
    CommandOutput,
    CommandComplete,
    CommandError,
    SshConnect,
    SshClose,
    DockerExec,
    DockerRun,
    K8sExec,
    TempCleanup,
    InternalError,
    Custom(String),
}

/// Events published on the shared bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A command entered execution.
    CommandStart {
        id: u64,
        /// Masked command line.
        command: String,
        adapter: &'static str,
    },

    /// A chunk of output was captured. Chunks are masked individually.
    CommandOutput {
        id: u64,
        stream: StreamKind,
        chunk: Vec<u8>,
    },

    /// A command finished and produced a result (including non-zero exits
    /// under `nothrow`).
    CommandComplete {
        id: u64,
        command: String,
        adapter: &'static str,
        exit_code: i32,
        duration_ms: u64,
    },

    /// A command failed and the engine is raising an error.
    CommandError {
        id: u64,
        command: String,
        adapter: &'static str,
        kind: ErrorKind,
        message: String,
    },

    /// A new SSH connection was established.
    SshConnect { host: String, port: u16, user: String },

    /// An SSH connection was closed.
    SshClose { host: String, port: u16, user: String },

    /// A `docker exec` was issued.
    DockerExec { container: String },

    /// A `docker run` was issued.
    DockerRun { image: String },

    /// A `kubectl exec` was issued.
    K8sExec { pod: String, namespace: String },

    /// A temp container was removed (or removal failed and was swallowed).
    TempCleanup { container: String, success: bool },

    /// A subscriber handler failed; execution was not affected.
    InternalError { message: String },

    /// User-defined event.
    Custom {
        kind: String,
        payload: serde_json::Value,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CommandStart { .. } => EventKind::CommandStart,
            Event::CommandOutput { .. } => EventKind::CommandOutput,
            Event::CommandComplete { .. } => EventKind::CommandComplete,
            Event::CommandError { .. } => EventKind::CommandError,
            Event::SshConnect { .. } => EventKind::SshConnect,
            Event::SshClose { .. } => EventKind::SshClose,
            Event::DockerExec { .. } => EventKind::DockerExec,
            Event::DockerRun { .. } => EventKind::DockerRun,
            Event::K8sExec { .. } => EventKind::K8sExec,
            Event::TempCleanup { .. } => EventKind::TempCleanup,
            Event::InternalError { .. } => EventKind::InternalError,
            Event::Custom { kind, .. } => EventKind::Custom(kind.clone()),
        }
    }

    /// Adapter name attached to the event, when one applies.
    pub fn adapter(&self) -> Option<&str> {
        match self {
            Event::CommandStart { adapter, .. }
            | Event::CommandComplete { adapter, .. }
            | Event::CommandError { adapter, .. } => Some(adapter),
            _ => None,
        }
    }

    /// Masked command line attached to the event, when one applies.
    pub fn command(&self) -> Option<&str> {
        match self {
            Event::CommandStart { command, .. }
            | Event::CommandComplete { command, .. }
            | Event::CommandError { command, .. } => Some(command),
            _ => None,
        }
    }
}
