//! The action → commands → results pipeline stages.
//!
//! Each stage is a plain function over the store, the spool and the
//! relay, so the whole flow is testable without a broker; the binary
//! wires them to worker threads and bounded channels.

use std::sync::Arc;

use chrono::Utc;
use core_models::{Action, ActionStatus, Agent, Command, CommandStatus};
use inquest_db::InquestDb;
use relay_queue::RelayBus;
use spool_repo::{SpoolRepo, Stage};
use tracing::{info, warn};
use trust_kernel::{Acl, Keyring, TrustError};

use crate::Result;

/// Relay operations the pipeline needs; the test suite substitutes a
/// recording implementation.
pub trait CommandPublisher: Send + Sync {
    fn publish_command(&self, queue_location: &str, command: &Command) -> relay_queue::Result<()>;
    fn publish_event(&self, topic: &str, payload: &serde_json::Value) -> relay_queue::Result<()>;
    fn delete_agent_queue(&self, queue_location: &str) -> relay_queue::Result<()>;
}

/// Production publisher backed by the relay bus.
pub struct RelayPublisher(pub Arc<RelayBus>);

impl CommandPublisher for RelayPublisher {
    fn publish_command(&self, queue_location: &str, command: &Command) -> relay_queue::Result<()> {
        let inbox = self.0.config().agent_inbox(queue_location);
        self.0.publish_retrying(&inbox, command)
    }

    fn publish_event(&self, topic: &str, payload: &serde_json::Value) -> relay_queue::Result<()> {
        let stream = self.0.config().event_stream(topic);
        // event streams are advisory; a drop is not worth blocking on
        self.0.publish(&stream, payload)
    }

    fn delete_agent_queue(&self, queue_location: &str) -> relay_queue::Result<()> {
        let inbox = self.0.config().agent_inbox(queue_location);
        self.0.delete_queue(&inbox)
    }
}

/// Trust material the pipeline authorizes against.
pub struct TrustContext {
    pub acl: Acl,
    pub keyring: Keyring,
}

/// Short reason written to the `.reason` sidecar of a rejected action.
pub fn reason_tag(err: &TrustError) -> &'static str {
    match err {
        TrustError::NoSignatures => "NoSignatures",
        TrustError::SignatureMalformed(_) => "SignatureMalformed",
        TrustError::SignatureInvalid => "SignatureInvalid",
        TrustError::UnknownSigner => "UnknownSigner",
        TrustError::WeightBelowThreshold { .. } => "WeightBelowThreshold",
        TrustError::NoRuleForModule(_) => "NoRuleForModule",
        _ => "TrustRejected",
    }
}

/// Stage 1 half of the spool inspector: parse every file in
/// `action/new`, register well-formed actions as pending rows and move
/// the rejects to `action/invalid` with a reason sidecar. Files already
/// registered (restart re-scan) are left alone for the claim step.
pub fn ingest_new_actions(db: &InquestDb, spool: &dyn SpoolRepo) -> Result<()> {
    for file_id in spool.list(Stage::ActionNew)? {
        let blob = spool.read(Stage::ActionNew, &file_id)?;
        let mut action: Action = match serde_json::from_slice(&blob) {
            Ok(a) => a,
            Err(e) => {
                warn!(file = %file_id, "unparseable action: {e}");
                spool.move_entry(Stage::ActionNew, Stage::ActionInvalid, &file_id)?;
                spool.write_sidecar(Stage::ActionInvalid, &file_id, &format!("Malformed: {e}"))?;
                continue;
            }
        };
        let now = Utc::now();
        if let Err(e) = action.validate(now) {
            warn!(file = %file_id, "invalid action: {e}");
            spool.move_entry(Stage::ActionNew, Stage::ActionInvalid, &file_id)?;
            spool.write_sidecar(Stage::ActionInvalid, &file_id, &e.to_string())?;
            continue;
        }
        if action.id == 0 {
            // ingest assigns the id; rename the spool entry to match
            action.id = core_models::gen_action_id(now);
            action.status = Some(ActionStatus::Pending);
            spool.enqueue(Stage::ActionNew, &action.id.to_string(), &serde_json::to_vec(&action)?)?;
            spool.remove(Stage::ActionNew, &file_id)?;
            db.insert_action(&action)?;
            info!(action = action.id, name = %action.name, "action ingested");
            continue;
        }
        if db.action_by_id(action.id)?.is_none() {
            action.status = Some(ActionStatus::Pending);
            db.insert_action(&action)?;
            info!(action = action.id, name = %action.name, "action re-registered from spool");
        }
    }
    Ok(())
}

/// Restart recovery for actions that were claimed but never fanned out:
/// a `scheduled` row whose file still sits in `action/new` and that has
/// no commands was lost mid-pipeline. Returns those rows for
/// reprocessing. Actions that already emitted commands are not replayed;
/// replaying them would duplicate commands.
pub fn recover_claimed_actions(db: &InquestDb, spool: &dyn SpoolRepo) -> Result<Vec<Action>> {
    let mut recovered = Vec::new();
    for file_id in spool.list(Stage::ActionNew)? {
        let id: i64 = match file_id.parse() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let action = match db.action_by_id(id)? {
            Some(a) => a,
            None => continue,
        };
        if action.status == Some(ActionStatus::Scheduled)
            && db.aggregate_counters(id)?.sent == 0
        {
            info!(action = id, "recovering claimed action lost before fan-out");
            recovered.push(action);
        }
    }
    Ok(recovered)
}

/// Stage 2: authorize a claimed action, resolve its targets and emit one
/// command per agent. Returns the ids of commands staged in
/// `command/ready`. A zero-target action completes on the spot.
pub fn process_new_action(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    trust: &TrustContext,
    action: &Action,
) -> Result<Vec<String>> {
    let file_id = action.id.to_string();

    // only a claimed action may fan out; a duplicate hand-off (recovery
    // racing the claim) is dropped here
    if db.action_status(action.id)? != Some(ActionStatus::Scheduled) {
        return Ok(Vec::new());
    }

    if let Err(e) = trust_kernel::authorize_action(action, &trust.acl, &trust.keyring) {
        warn!(action = action.id, "authorization refused: {e}");
        db.update_action_status(action.id, ActionStatus::Invalid)?;
        spool.move_entry(Stage::ActionNew, Stage::ActionInvalid, &file_id)?;
        spool.write_sidecar(Stage::ActionInvalid, &file_id, reason_tag(&e))?;
        return Ok(Vec::new());
    }

    db.update_action_status(action.id, ActionStatus::Preparing)?;
    let agents = db.list_agents_by_target(&action.target)?;
    if agents.is_empty() {
        info!(action = action.id, "no agents match target; action completes empty");
        db.update_action_status(action.id, ActionStatus::Completed)?;
        spool.move_entry(Stage::ActionNew, Stage::ActionDone, &file_id)?;
        return Ok(Vec::new());
    }

    let mut command_ids = Vec::with_capacity(agents.len());
    for agent in &agents {
        let command = command_for_agent(action, agent);
        db.insert_command(&command)?;
        spool.enqueue(Stage::CommandReady, &command.id, &serde_json::to_vec(&command)?)?;
        command_ids.push(command.id);
    }
    spool.move_entry(Stage::ActionNew, Stage::ActionInflight, &file_id)?;
    info!(action = action.id, commands = command_ids.len(), "action fanned out");
    Ok(command_ids)
}

/// Freeze an action into a command bound to one agent.
fn command_for_agent(action: &Action, agent: &Agent) -> Command {
    Command {
        id: core_models::gen_command_id(),
        action_id: action.id,
        action_name: action.name.clone(),
        action_target: action.target.clone(),
        agent_id: agent.id,
        agent_name: agent.name.clone(),
        agent_queue_location: agent.queue_location.clone(),
        operations: action.operations.clone(),
        signatures: action.signatures.clone(),
        valid_from: action.valid_from,
        expire_after: action.expire_after,
        status: CommandStatus::Sent,
        start_time: None,
        finish_time: None,
        results: Vec::new(),
    }
}

/// Stage 3: publish a staged command to its agent's inbox and move it
/// in-flight. Returns the parent action id.
pub fn send_command(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    publisher: &dyn CommandPublisher,
    command_id: &str,
) -> Result<i64> {
    let blob = spool.read(Stage::CommandReady, command_id)?;
    let command: Command = serde_json::from_slice(&blob)?;

    publisher.publish_command(&command.agent_queue_location, &command)?;
    db.mark_command_sent(command_id, Utc::now())?;
    spool.move_entry(Stage::CommandReady, Stage::CommandInflight, command_id)?;

    if db.action_status(command.action_id)? == Some(ActionStatus::Preparing) {
        db.update_action_status(command.action_id, ActionStatus::Inflight)?;
    }
    Ok(command.action_id)
}

/// Durable hand-off for an arriving result: stage it in
/// `command/returned` before the broker delivery is acknowledged.
pub fn record_returned(spool: &dyn SpoolRepo, command: &Command) -> Result<()> {
    spool.enqueue(Stage::CommandReturned, &command.id, &serde_json::to_vec(command)?)?;
    Ok(())
}

/// Stage 4: fold an agent's result into the command row. Terminal
/// commands ignore late redeliveries; results for cancelled actions are
/// discarded. Returns the action id to recount, when anything changed.
pub fn terminate_command(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    command_id: &str,
) -> Result<Option<i64>> {
    let blob = spool.read(Stage::CommandReturned, command_id)?;
    let returned: Command = serde_json::from_slice(&blob)?;

    if db.action_status(returned.action_id)? == Some(ActionStatus::Cancelled) {
        info!(command = %command_id, "discarding result of cancelled action");
        spool.remove(Stage::CommandReturned, command_id)?;
        return Ok(None);
    }

    let status = if returned.status.is_terminal() {
        returned.status
    } else {
        // an agent reply that claims a non-terminal status is a failure
        CommandStatus::Failed
    };
    let updated =
        db.update_command_result(&returned.id, status, &returned.results, Utc::now())?;
    if !updated {
        info!(command = %command_id, "late result for terminal command ignored");
    }

    // a missing in-flight file just means this is a redelivery whose
    // first pass already moved it
    if let Err(e) = spool.move_entry(Stage::CommandInflight, Stage::CommandDone, command_id) {
        if !matches!(e, spool_repo::SpoolError::NotFound { .. }) {
            return Err(e.into());
        }
    }
    spool.remove(Stage::CommandReturned, command_id)?;
    Ok(Some(returned.action_id))
}

/// Stage 5: recompute an action's counters and finish it once every
/// command is terminal. Returns true when the action just terminated.
pub fn update_action(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    publisher: &dyn CommandPublisher,
    action_id: i64,
) -> Result<bool> {
    let status = match db.action_status(action_id)? {
        Some(s) => s,
        None => return Ok(false),
    };
    if status.is_terminal() {
        return Ok(false);
    }
    let counters = db.aggregate_counters(action_id)?;
    if counters.sent == 0 || !counters.all_terminal() {
        return Ok(false);
    }

    db.update_action_status(action_id, ActionStatus::Completed)?;
    let file_id = action_id.to_string();
    if let Err(e) = spool.move_entry(Stage::ActionInflight, Stage::ActionDone, &file_id) {
        // already finished by an earlier pass
        warn!(action = action_id, "spool move on completion: {e}");
    }
    let payload = serde_json::json!({ "actionId": action_id, "counters": counters });
    if let Err(e) = publisher.publish_event("action.done", &payload) {
        warn!(action = action_id, "event publication failed: {e}");
    }
    info!(
        action = action_id,
        success = counters.success,
        failed = counters.failed,
        timeout = counters.timeout,
        "action completed"
    );
    Ok(true)
}
