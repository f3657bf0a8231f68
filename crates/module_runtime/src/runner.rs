//! Deadline-bound module execution. A module runs on its own thread with
//! a wall-clock budget; overrunning it yields a synthesized timeout and a
//! panicking module is reported as failed, never crashing the agent.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use core_models::ResultEnvelope;
use serde_json::Value;
use tracing::warn;

use crate::{Module, ModuleContext};

/// Outcome of one bounded module invocation.
#[derive(Debug)]
pub enum RunOutcome {
    Done(ResultEnvelope),
    TimedOut,
    Panicked(String),
}

/// Run a module with a hard wall-clock deadline. A timed-out worker
/// thread is detached, not aborted; its eventual result is discarded.
pub fn run_with_deadline(
    module: Arc<dyn Module>,
    params: Value,
    ctx: ModuleContext,
    deadline: Duration,
) -> RunOutcome {
    let (tx, rx) = mpsc::channel();
    let name = module.name();
    thread::Builder::new()
        .name(format!("module-{name}"))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| module.run(&params, &ctx)));
            // the receiver may be gone if the deadline already passed
            let _ = tx.send(result);
        })
        .expect("spawning a module worker thread");

    match rx.recv_timeout(deadline) {
        Ok(Ok(envelope)) => RunOutcome::Done(envelope),
        Ok(Err(panic_payload)) => {
            let msg = panic_payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "module panicked".to_string());
            warn!(module = name, "module panicked: {msg}");
            RunOutcome::Panicked(msg)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(module = name, timeout_secs = deadline.as_secs(), "module timed out");
            RunOutcome::TimedOut
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            RunOutcome::Panicked("module worker vanished".to_string())
        }
    }
}
