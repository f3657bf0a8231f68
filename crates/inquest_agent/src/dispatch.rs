//! Command dispatch: the trust gate and the parallel, deadline-bound
//! execution of a command's operations.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use core_models::{Command, CommandStatus, ResultEnvelope};
use module_runtime::{
    run_with_deadline, ModuleContext, Registry, RunOutcome, AGENT_DESTROY_MODULE,
};
use tracing::{info, warn};
use trust_kernel::{Acl, Keyring};

/// What the agent should do with a processed command.
#[derive(Debug)]
pub enum Disposition {
    /// Publish this reply and keep running.
    Reply(Command),
    /// Publish this reply, then shut down: an authorized destroy order.
    Destroy(Command),
}

pub struct Dispatcher {
    pub acl: Acl,
    pub keyring: Keyring,
    pub registry: Arc<Registry>,
    pub module_timeout: Duration,
    pub epm: bool,
}

impl Dispatcher {
    /// Process one delivered command: verify every signature, evaluate
    /// the ACL per operation, then run the operations in parallel. Any
    /// trust failure produces a `failed` reply without running anything.
    pub fn process(&self, command: &Command) -> Disposition {
        let frozen = command.frozen_action();
        if let Err(e) = trust_kernel::authorize_action(&frozen, &self.acl, &self.keyring) {
            warn!(command = %command.id, "refusing command: {e}");
            return Disposition::Reply(self.reply_all_failed(command, &format!("refused: {e}")));
        }

        // an authorized destroy order short-circuits normal dispatch
        if command.operations.iter().any(|op| op.module == AGENT_DESTROY_MODULE) {
            info!(command = %command.id, "authorized destroy order received");
            return Disposition::Destroy(self.destroy_reply(command));
        }

        let mut handles = Vec::with_capacity(command.operations.len());
        for op in &command.operations {
            let ctx = ModuleContext { epm: self.epm };
            let timeout = self.module_timeout;
            match self.registry.get(&op.module) {
                Ok(module) => {
                    let params = op.parameters.clone();
                    handles.push(OpHandle::Running(thread::spawn(move || {
                        run_with_deadline(module, params, ctx, timeout)
                    })));
                }
                Err(e) => handles.push(OpHandle::Unknown(e.to_string())),
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut any_timeout = false;
        let mut any_failed = false;
        for handle in handles {
            match handle {
                OpHandle::Unknown(msg) => {
                    any_failed = true;
                    results.push(ResultEnvelope::from_error(msg));
                }
                OpHandle::Running(join) => match join.join() {
                    Ok(RunOutcome::Done(envelope)) => results.push(envelope),
                    Ok(RunOutcome::TimedOut) => {
                        any_timeout = true;
                        results.push(ResultEnvelope::from_error(format!(
                            "module timed out after {}s",
                            self.module_timeout.as_secs()
                        )));
                    }
                    Ok(RunOutcome::Panicked(msg)) => {
                        any_failed = true;
                        results.push(ResultEnvelope::from_error(format!("module failed: {msg}")));
                    }
                    Err(_) => {
                        any_failed = true;
                        results.push(ResultEnvelope::from_error("module worker vanished"));
                    }
                },
            }
        }

        let status = if any_timeout {
            CommandStatus::Timeout
        } else if any_failed {
            CommandStatus::Failed
        } else {
            CommandStatus::Success
        };
        Disposition::Reply(self.reply(command, status, results))
    }

    fn reply(
        &self,
        command: &Command,
        status: CommandStatus,
        results: Vec<ResultEnvelope>,
    ) -> Command {
        let mut reply = command.clone();
        reply.status = status;
        reply.results = results;
        reply.finish_time = Some(Utc::now());
        reply
    }

    fn reply_all_failed(&self, command: &Command, msg: &str) -> Command {
        let results = command
            .operations
            .iter()
            .map(|_| ResultEnvelope::from_error(msg))
            .collect();
        self.reply(command, CommandStatus::Failed, results)
    }

    fn destroy_reply(&self, command: &Command) -> Command {
        let results = command
            .operations
            .iter()
            .map(|op| {
                if op.module == AGENT_DESTROY_MODULE {
                    ResultEnvelope {
                        found_anything: true,
                        elements: serde_json::json!({"destroyed": true}),
                        statistics: serde_json::Value::Null,
                        errors: vec![],
                    }
                } else {
                    ResultEnvelope::from_error("skipped: agent is shutting down")
                }
            })
            .collect();
        self.reply(command, CommandStatus::Success, results)
    }
}

enum OpHandle {
    Running(thread::JoinHandle<RunOutcome>),
    Unknown(String),
}
