//! Xec — universal command execution engine
//!
//! One programming interface to run commands against the local host, remote
//! hosts over SSH, Docker containers (local or remote) and Kubernetes pods,
//! with identical semantics for piping, capture, timeouts, cancellation,
//! environment, working directory and failure reporting.
//!
//! ```no_run
//! use xec::{engine, Template};
//!
//! # async fn demo() -> xec::Result<()> {
//! let cmd = Template::new().lit("echo ").val("hello world").build()?;
//! let result = engine().run(&cmd).await?;
//! assert_eq!(result.text(), "hello world");
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod command;
pub mod engine;
pub mod error;
pub mod events;
pub mod mask;
pub mod result;

// Re-export commonly used types
pub use command::{
    Command, DockerOptions, FlagValue, K8sOptions, OutputSink, PosixQuoter, Quoter, RetryPolicy,
    RunMode, Shell, SshAuth, SshOptions, StdinSource, SudoMethod, SudoOptions, Target, Template,
    TemplateValue,
};
pub use engine::{Engine, EngineConfig, Limiter, ScopedBuilder};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventBus, EventKind, Selector, StreamKind, Subscription};
pub use mask::{MaskRule, Masker, REDACTED};
pub use result::{CapturedStream, ExecResult};

use std::sync::OnceLock;

/// The lazily-constructed global engine with default configuration.
///
/// Callers wanting their own configuration construct an [`Engine`] directly
/// and ignore this.
pub fn engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(Engine::default)
}

/// Opt-in tracing setup honouring `XEC_LOG_LEVEL` (falling back to
/// `RUST_LOG`). The library itself never installs a subscriber.
pub fn init_tracing() {
    let filter = std::env::var("XEC_LOG_LEVEL")
        .map(|level| tracing_subscriber::EnvFilter::new(format!("xec={}", level)))
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xec=info"))
        });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_engine_is_shared() {
        let a = engine() as *const Engine;
        let b = engine() as *const Engine;
        assert_eq!(a, b);
    }
}
