use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use core_models::{Action, Command, Heartbeat};
use inquest_db::InquestDb;
use inquest_scheduler::housekeeping;
use inquest_scheduler::identity::SchedulerIdentity;
use inquest_scheduler::pipeline::{self, CommandPublisher, RelayPublisher, TrustContext};
use inquest_scheduler::{SchedulerConfig, SchedulerError};
use relay_queue::{Backoff, RelayBus};
use spool_repo::{FsSpool, SpoolRepo, Stage};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inquest-scheduler", about = "Endpoint investigation scheduler", version)]
struct Cli {
    /// Path to the scheduler configuration file (JSON).
    #[arg(short, long, default_value = "./scheduler.json")]
    config: PathBuf,

    /// Override the spool directory from the configuration.
    #[arg(long)]
    spool: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = SchedulerConfig::load(&cli.config).context("loading configuration")?;
    if let Some(spool) = cli.spool {
        cfg.spool_dir = spool;
    }

    let spool: Arc<dyn SpoolRepo> =
        Arc::new(FsSpool::open(&cfg.spool_dir).context("opening spool")?);
    let db = InquestDb::open(&cfg.db_path).context("opening store")?;

    let identity = SchedulerIdentity::bootstrap(&cfg, &db).context("bootstrapping identity")?;
    let mut acl = trust_kernel::Acl::load(&cfg.acl).context("loading ACL")?;
    identity.splice_into_acl(&mut acl);
    let keyring = trust_kernel::Keyring::load_dir(&cfg.agent_keys).context("loading keyring")?;
    let trust = Arc::new(TrustContext { acl, keyring });
    drop(db);

    let bus = Arc::new(
        RelayBus::connect_verified(cfg.relay.clone(), None).context("connecting to relay")?,
    );
    let publisher: Arc<dyn CommandPublisher> = Arc::new(RelayPublisher(bus.clone()));
    info!(relay = %cfg.relay.url, "scheduler starting");

    // bounded stage channels; backpressure is the flow control
    let (tx_new, rx_new) = sync_channel::<Action>(64);
    let (tx_ready, rx_ready) = sync_channel::<String>(256);
    let (tx_returned, rx_returned) = sync_channel::<String>(256);
    let (tx_update, rx_update) = sync_channel::<i64>(256);

    let mut handles = Vec::new();
    handles.push(spawn_spool_inspector(
        cfg.clone(),
        spool.clone(),
        tx_new,
        tx_ready.clone(),
        tx_returned.clone(),
    ));
    handles.push(spawn_action_processor(
        cfg.clone(),
        spool.clone(),
        trust,
        rx_new,
        tx_ready,
        tx_update.clone(),
    ));
    handles.push(spawn_command_sender(cfg.clone(), spool.clone(), publisher.clone(), rx_ready));
    handles.push(spawn_result_consumer(bus.clone(), spool.clone(), tx_returned));
    handles.push(spawn_command_terminator(
        cfg.clone(),
        spool.clone(),
        rx_returned,
        tx_update.clone(),
    ));
    handles.push(spawn_action_updater(cfg.clone(), spool.clone(), publisher.clone(), rx_update));
    handles.push(spawn_heartbeat_consumer(cfg.clone(), bus));
    handles.push(spawn_housekeeper(cfg, spool, publisher, identity, tx_update));

    info!("all pipeline workers started");
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Worker 1: the spool inspector. Periodically ingests `action/new`,
/// claims runnable actions and re-drains staged commands left behind by
/// a previous incarnation.
fn spawn_spool_inspector(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    tx_new: SyncSender<Action>,
    tx_ready: SyncSender<String>,
    tx_returned: SyncSender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("spool inspector cannot open store: {e}"),
        };
        loop {
            if let Err(e) = pipeline::ingest_new_actions(&db, spool.as_ref()) {
                warn!("action ingest pass failed: {e}");
            }
            match db.claim_runnable_actions(Utc::now()) {
                Ok(actions) => {
                    for action in actions {
                        if tx_new.send(action).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("claim pass failed: {e}"),
            }
            match pipeline::recover_claimed_actions(&db, spool.as_ref()) {
                Ok(recovered) => {
                    for action in recovered {
                        if tx_new.send(action).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("claimed-action recovery failed: {e}"),
            }
            for stage_drain in [
                (Stage::CommandReady, &tx_ready),
                (Stage::CommandReturned, &tx_returned),
            ] {
                let (stage, tx) = stage_drain;
                match spool.list(stage) {
                    Ok(ids) => {
                        for id in ids {
                            if tx.send(id).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("spool scan of {stage:?} failed: {e}"),
                }
            }
            thread::sleep(cfg.spool_inspect_freq());
        }
    })
}

/// Worker 2: verify, resolve targets and fan out each claimed action.
fn spawn_action_processor(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    trust: Arc<TrustContext>,
    rx_new: Receiver<Action>,
    tx_ready: SyncSender<String>,
    tx_update: SyncSender<i64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("action processor cannot open store: {e}"),
        };
        for action in rx_new {
            match pipeline::process_new_action(&db, spool.as_ref(), &trust, &action) {
                Ok(command_ids) => {
                    if command_ids.is_empty() {
                        // invalid or zero-target: nothing to send, but the
                        // updater may still need to notice terminal state
                        let _ = tx_update.send(action.id);
                        continue;
                    }
                    for id in command_ids {
                        if tx_ready.send(id).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!(action = action.id, "processing failed: {e}"),
            }
        }
    })
}

/// Worker 3: drain `command/ready`, publish to per-agent inboxes.
fn spawn_command_sender(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    publisher: Arc<dyn CommandPublisher>,
    rx_ready: Receiver<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("command sender cannot open store: {e}"),
        };
        for command_id in rx_ready {
            match pipeline::send_command(&db, spool.as_ref(), publisher.as_ref(), &command_id) {
                Ok(action_id) => {
                    info!(command = %command_id, action = action_id, "command published")
                }
                // a re-scan can race the first delivery; a missing file
                // just means the command already went out
                Err(SchedulerError::Spool(spool_repo::SpoolError::NotFound { .. })) => {}
                Err(e) => error!(command = %command_id, "send failed: {e}"),
            }
        }
    })
}

/// Result consumer: move arriving results into `command/returned` before
/// acknowledging the relay delivery, then hand them to the terminator.
fn spawn_result_consumer(
    bus: Arc<RelayBus>,
    spool: Arc<dyn SpoolRepo>,
    tx_returned: SyncSender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let queue = bus.config().results_queue();
        match bus.recover_pending::<Command>(&queue) {
            Ok(pending) => {
                for delivery in pending {
                    if pipeline::record_returned(spool.as_ref(), &delivery.payload).is_ok() {
                        let _ = bus.ack(&queue, &delivery);
                        let _ = tx_returned.send(delivery.payload.id.clone());
                    }
                }
            }
            Err(e) => warn!("result recovery failed: {e}"),
        }
        let mut backoff = Backoff::new();
        loop {
            match bus.consume::<Command>(&queue, Duration::from_secs(5)) {
                Ok(None) => {}
                Ok(Some(delivery)) => {
                    backoff = Backoff::new();
                    match pipeline::record_returned(spool.as_ref(), &delivery.payload) {
                        Ok(()) => {
                            if let Err(e) = bus.ack(&queue, &delivery) {
                                warn!("result ack failed: {e}");
                            }
                            if tx_returned.send(delivery.payload.id.clone()).is_err() {
                                return;
                            }
                        }
                        // not acked: the relay will redeliver
                        Err(e) => warn!("result staging failed: {e}"),
                    }
                }
                Err(e) => {
                    warn!("result consumption failed: {e}");
                    backoff.wait();
                }
            }
        }
    })
}

/// Worker 4: fold staged results into command rows.
fn spawn_command_terminator(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    rx_returned: Receiver<String>,
    tx_update: SyncSender<i64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("command terminator cannot open store: {e}"),
        };
        for command_id in rx_returned {
            match pipeline::terminate_command(&db, spool.as_ref(), &command_id) {
                Ok(Some(action_id)) => {
                    if tx_update.send(action_id).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(SchedulerError::Spool(spool_repo::SpoolError::NotFound { .. })) => {}
                Err(e) => error!(command = %command_id, "termination failed: {e}"),
            }
        }
    })
}

/// Worker 5: recompute counters and finish terminal actions.
fn spawn_action_updater(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    publisher: Arc<dyn CommandPublisher>,
    rx_update: Receiver<i64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("action updater cannot open store: {e}"),
        };
        for action_id in rx_update {
            if let Err(e) =
                pipeline::update_action(&db, spool.as_ref(), publisher.as_ref(), action_id)
            {
                error!(action = action_id, "update failed: {e}");
            }
        }
    })
}

/// Heartbeat consumer: registrations, refreshes and destroyed-agent
/// notices.
fn spawn_heartbeat_consumer(cfg: SchedulerConfig, bus: Arc<RelayBus>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("heartbeat consumer cannot open store: {e}"),
        };
        let queue = bus.config().heartbeats_queue();
        if let Ok(pending) = bus.recover_pending::<Heartbeat>(&queue) {
            for delivery in pending {
                if db.upsert_heartbeat(&delivery.payload).is_ok() {
                    let _ = bus.ack(&queue, &delivery);
                }
            }
        }
        let mut backoff = Backoff::new();
        loop {
            match bus.consume::<Heartbeat>(&queue, Duration::from_secs(5)) {
                Ok(None) => {}
                Ok(Some(delivery)) => {
                    backoff = Backoff::new();
                    let hb = &delivery.payload;
                    match db.upsert_heartbeat(hb) {
                        Ok(is_new) => {
                            if is_new {
                                info!(agent = %hb.queue_location, "new agent registered");
                                let _ = bus.publish(
                                    &bus.config().event_stream("agent.new"),
                                    &serde_json::json!({"queueLocation": hb.queue_location}),
                                );
                            }
                            if hb.destroyed {
                                info!(agent = %hb.queue_location, "agent destroyed");
                                let _ = bus.publish(
                                    &bus.config().event_stream("agent.destroyed"),
                                    &serde_json::json!({"queueLocation": hb.queue_location}),
                                );
                            }
                            let _ = bus.ack(&queue, &delivery);
                        }
                        Err(e) => warn!("heartbeat persist failed, leaving unacked: {e}"),
                    }
                }
                Err(e) => {
                    warn!("heartbeat consumption failed: {e}");
                    backoff.wait();
                }
            }
        }
    })
}

/// Housekeeping timer: idle/offline marking, expiry, duplicate agents.
fn spawn_housekeeper(
    cfg: SchedulerConfig,
    spool: Arc<dyn SpoolRepo>,
    publisher: Arc<dyn CommandPublisher>,
    identity: SchedulerIdentity,
    tx_update: SyncSender<i64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let db = match InquestDb::open(&cfg.db_path) {
            Ok(db) => db,
            Err(e) => return error!("housekeeper cannot open store: {e}"),
        };
        loop {
            thread::sleep(cfg.housekeeping_freq());
            match housekeeping::run_cycle(
                &db,
                spool.as_ref(),
                publisher.as_ref(),
                &identity,
                &cfg,
                Utc::now(),
            ) {
                Ok(report) => {
                    for action_id in &report.touched_actions {
                        if tx_update.send(*action_id).is_err() {
                            return;
                        }
                    }
                    if report.idle_marked > 0
                        || report.offline_marked > 0
                        || report.destroy_commands_sent > 0
                    {
                        info!(
                            idle = report.idle_marked,
                            offline = report.offline_marked,
                            destroyed = report.destroy_commands_sent,
                            "housekeeping cycle"
                        );
                    }
                }
                Err(e) => warn!("housekeeping cycle failed: {e}"),
            }
        }
    })
}
