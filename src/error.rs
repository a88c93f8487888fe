//! Error taxonomy for the execution engine
//!
//! Every failure surfaced by the engine or an adapter maps onto one of the
//! variants below. Variants that relate to a specific command carry the
//! masked command string and, where one was constructed, the partial
//! [`ExecResult`](crate::result::ExecResult).

use thiserror::Error;

use crate::result::ExecResult;

/// Classification of an [`Error`] without its payload.
///
/// Used by the retry policy (`retry_on`) and by event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CommandFailed,
    Timeout,
    Cancelled,
    AdapterUnavailable,
    ConnectionError,
    AuthError,
    TargetNotFound,
    BufferExceeded,
    InvalidArgument,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AdapterUnavailable => "adapter_unavailable",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::TargetNotFound => "target_not_found",
            ErrorKind::BufferExceeded => "buffer_exceeded",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error type for engine and adapter operations.
///
/// Messages never contain raw secrets: any command string embedded here has
/// already passed through the masker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("command exited with code {exit_code}: {command}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        result: Box<ExecResult>,
    },

    #[error("command timed out after {timeout_ms}ms: {command}")]
    Timeout {
        command: String,
        timeout_ms: u64,
        result: Option<Box<ExecResult>>,
    },

    #[error("command cancelled: {command}")]
    Cancelled {
        command: String,
        result: Option<Box<ExecResult>>,
    },

    #[error("adapter '{adapter}' unavailable: {reason}")]
    AdapterUnavailable { adapter: String, reason: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("target not found: {target}")]
    TargetNotFound {
        target: String,
        result: Option<Box<ExecResult>>,
    },

    #[error("captured output exceeded {limit} bytes")]
    BufferExceeded {
        limit: usize,
        result: Option<Box<ExecResult>>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CommandFailed { .. } => ErrorKind::CommandFailed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::AdapterUnavailable { .. } => ErrorKind::AdapterUnavailable,
            Error::Connection(_) => ErrorKind::ConnectionError,
            Error::Auth(_) => ErrorKind::AuthError,
            Error::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Error::BufferExceeded { .. } => ErrorKind::BufferExceeded,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The partial result constructed before the failure, if any.
    pub fn partial_result(&self) -> Option<&ExecResult> {
        match self {
            Error::CommandFailed { result, .. } => Some(result),
            Error::Timeout { result, .. }
            | Error::Cancelled { result, .. }
            | Error::TargetNotFound { result, .. }
            | Error::BufferExceeded { result, .. } => result.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Internal(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::TimedOut => Error::Connection(err.to_string()),
            _ => Error::internal(err),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::NotAuthenticated => Error::Auth("not authenticated".to_string()),
            russh::Error::ConnectionTimeout => Error::Connection("connection timeout".to_string()),
            russh::Error::Disconnect => Error::Connection("remote disconnected".to_string()),
            russh::Error::IO(io) => Error::from(io),
            other => Error::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::InvalidArgument("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Error::Connection("refused".into()).kind(),
            ErrorKind::ConnectionError
        );
        assert_eq!(Error::Auth("denied".into()).kind(), ErrorKind::AuthError);
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from(refused).kind(), ErrorKind::ConnectionError);

        let perm = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Error::from(perm).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_display_contains_command() {
        let err = Error::Timeout {
            command: "sleep 5".to_string(),
            timeout_ms: 200,
            result: None,
        };
        let text = err.to_string();
        assert!(text.contains("200ms"));
        assert!(text.contains("sleep 5"));
    }
}
