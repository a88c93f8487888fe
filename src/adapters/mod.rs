//! Execution adapters
//!
//! One [`Adapter`] per environment, all behind the same contract: take a
//! prepared [`Command`], honour its stdio/timeout/cancellation semantics, and
//! report a uniform [`ExecResult`]. Adapters never interpolate or re-quote
//! argument values; that happened in the builder.

pub mod docker;
pub mod k8s;
pub mod local;
pub mod mock;
pub(crate) mod proc;
pub mod remote_docker;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::error::Result;
use crate::events::{Event, EventBus, StreamKind};
use crate::mask::Masker;
use crate::result::ExecResult;

/// Per-execution emit seam handed to adapters.
///
/// Output chunks are masked before they reach the bus; `quiet` commands emit
/// no output events at all.
#[derive(Clone)]
pub struct Emitter {
    bus: EventBus,
    masker: Arc<Masker>,
    command_id: u64,
    quiet: bool,
}

impl Emitter {
    pub(crate) fn new(bus: EventBus, masker: Arc<Masker>, command_id: u64, quiet: bool) -> Self {
        Self {
            bus,
            masker,
            command_id,
            quiet,
        }
    }

    /// A detached emitter for adapter-internal events outside any command
    /// (pool lifecycle, temp cleanup).
    pub(crate) fn detached(bus: EventBus, masker: Arc<Masker>) -> Self {
        Self::new(bus, masker, 0, false)
    }

    pub fn command_id(&self) -> u64 {
        self.command_id
    }

    pub fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    /// Emit one captured output chunk, masked.
    pub fn output(&self, stream: StreamKind, chunk: &[u8]) {
        if self.quiet {
            return;
        }
        self.bus.emit(Event::CommandOutput {
            id: self.command_id,
            stream,
            chunk: self.masker.mask_bytes(chunk),
        });
    }
}

/// Everything an adapter needs for one execution beyond the command itself.
pub struct ExecContext {
    /// Unique id of this execution, shared with its events.
    pub id: u64,

    /// Cancellation handle; the engine cancels it on timeout or external
    /// cancel, and the adapter must then run its kill path and return a
    /// partial result with `exit_code = -1`, `signal = "SIGTERM"`.
    pub cancel: CancellationToken,

    pub emitter: Emitter,

    /// Grace between SIGTERM and SIGKILL.
    pub kill_grace: Duration,

    /// Resolved capture limit per stream.
    pub max_buffer: usize,
}

/// The adapter contract.
///
/// Implementations must be safe for concurrent `execute` calls; any
/// per-command state lives on the stack of the call.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable adapter name, matching [`Target::adapter_name`](crate::command::Target::adapter_name).
    fn name(&self) -> &'static str;

    /// Whether the backing environment is usable at all (binary present,
    /// transport reachable). Cheap; cached where probing is expensive.
    async fn is_available(&self) -> bool;

    /// Execute one command to completion.
    async fn execute(&self, command: &Command, ctx: &ExecContext) -> Result<ExecResult>;

    /// Synchronous execution, for adapters that support it (local, mock).
    fn execute_sync(&self, _command: &Command) -> Result<ExecResult> {
        Err(crate::error::Error::InvalidArgument(format!(
            "adapter '{}' does not support synchronous execution",
            self.name()
        )))
    }

    /// Release owned external resources. Idempotent.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
