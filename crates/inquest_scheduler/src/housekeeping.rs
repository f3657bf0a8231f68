//! Periodic scheduler duties: stale-agent demotion with relay queue
//! cleanup, command and action expiry, and duplicate-agent resolution.

use chrono::{DateTime, Utc};
use core_models::Agent;
use inquest_db::InquestDb;
use spool_repo::{SpoolRepo, Stage};
use tracing::{info, warn};

use crate::identity::SchedulerIdentity;
use crate::pipeline::{send_command, CommandPublisher};
use crate::{Result, SchedulerConfig};

/// What one housekeeping cycle did; the caller feeds the touched action
/// ids back into the update stage.
#[derive(Debug, Default)]
pub struct HousekeepingReport {
    pub idle_marked: usize,
    pub offline_marked: usize,
    pub expired_actions: Vec<i64>,
    pub touched_actions: Vec<i64>,
    pub destroy_commands_sent: usize,
}

pub fn run_cycle(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    publisher: &dyn CommandPublisher,
    identity: &SchedulerIdentity,
    cfg: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<HousekeepingReport> {
    let mut report = HousekeepingReport::default();

    report.idle_marked = db.mark_idle_agents(cfg.idle_threshold(), now)?;

    let offline = db.mark_offline_agents(cfg.offline_threshold(), now)?;
    report.offline_marked = offline.len();
    for queue_location in &offline {
        // bound relay resource use: an offline agent's inbox is deleted
        if let Err(e) = publisher.delete_agent_queue(queue_location) {
            warn!(queue = %queue_location, "queue cleanup failed: {e}");
        } else {
            info!(queue = %queue_location, "offline agent queue deleted");
        }
    }

    report.touched_actions = db.expire_commands_past_deadline(now)?;
    report.expired_actions = db.expire_stale_actions(now)?;
    for id in &report.expired_actions {
        // best effort: an expired action may still sit in action/new
        let _ = spool.move_entry(Stage::ActionNew, Stage::ActionDone, &id.to_string());
    }

    report.destroy_commands_sent = resolve_duplicate_agents(db, spool, publisher, identity)?;
    Ok(report)
}

/// When several live agents share a hostname, keep the youngest and send
/// each elder a destroy command signed with the scheduler identity.
pub fn resolve_duplicate_agents(
    db: &InquestDb,
    spool: &dyn SpoolRepo,
    publisher: &dyn CommandPublisher,
    identity: &SchedulerIdentity,
) -> Result<usize> {
    let mut sent = 0;
    for group in db.list_duplicate_agents()? {
        let mut doomed = group.into_iter();
        let survivor: Option<Agent> = doomed.next();
        if let Some(survivor) = survivor {
            info!(
                host = %survivor.name,
                survivor = %survivor.queue_location,
                "duplicate agents detected"
            );
        }
        for agent in doomed {
            let (action, command) = identity.destroy_action_for(&agent)?;
            db.insert_action(&action)?;
            db.insert_command(&command)?;
            spool.enqueue(Stage::CommandReady, &command.id, &serde_json::to_vec(&command)?)?;
            send_command(db, spool, publisher, &command.id)?;
            warn!(
                agent = %agent.queue_location,
                action = action.id,
                "destroy command issued to duplicate agent"
            );
            sent += 1;
        }
    }
    Ok(sent)
}
