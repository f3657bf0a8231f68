//! End-to-end pipeline scenarios over the in-memory spool and store,
//! with a recording publisher standing in for the relay.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use core_models::{
    Action, ActionStatus, AgentEnvironment, Command, CommandStatus, Heartbeat, Operation,
    ResultEnvelope,
};
use inquest_db::InquestDb;
use inquest_scheduler::housekeeping;
use inquest_scheduler::identity::SchedulerIdentity;
use inquest_scheduler::pipeline::{self, CommandPublisher, TrustContext};
use inquest_scheduler::SchedulerConfig;
use relay_queue::RelayConfig;
use spool_repo::{MemSpool, SpoolRepo, Stage};
use trust_kernel::{Acl, AclInvestigator, Keyring, Keystore};

#[derive(Default)]
struct RecordingPublisher {
    commands: Mutex<Vec<(String, Command)>>,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    deleted_queues: Mutex<Vec<String>>,
}

impl CommandPublisher for RecordingPublisher {
    fn publish_command(&self, queue_location: &str, command: &Command) -> relay_queue::Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push((queue_location.to_string(), command.clone()));
        Ok(())
    }

    fn publish_event(&self, topic: &str, payload: &serde_json::Value) -> relay_queue::Result<()> {
        self.events.lock().unwrap().push((topic.to_string(), payload.clone()));
        Ok(())
    }

    fn delete_agent_queue(&self, queue_location: &str) -> relay_queue::Result<()> {
        self.deleted_queues.lock().unwrap().push(queue_location.to_string());
        Ok(())
    }
}

struct Harness {
    db: InquestDb,
    spool: MemSpool,
    publisher: RecordingPublisher,
    trust: TrustContext,
    keystore: Keystore,
    _dir: tempfile::TempDir,
}

fn harness(min_weight: u32, extra_signer: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut keystore = Keystore::create(dir.path().join("ks.json")).unwrap();
    let bob = keystore.generate("bob").unwrap();

    let mut keyring = Keyring::empty();
    keyring.add_armored(&keystore.public_key_armored("bob").unwrap()).unwrap();

    let mut investigators = vec![AclInvestigator { fingerprint: bob, weight: 1 }];
    if let Some(name) = extra_signer {
        let fp = keystore.generate(name).unwrap();
        keyring.add_armored(&keystore.public_key_armored(name).unwrap()).unwrap();
        investigators.push(AclInvestigator { fingerprint: fp, weight: 1 });
    }
    let acl = Acl::single_default(min_weight, investigators);

    Harness {
        db: InquestDb::open_in_memory().unwrap(),
        spool: MemSpool::new(),
        publisher: RecordingPublisher::default(),
        trust: TrustContext { acl, keyring },
        keystore,
        _dir: dir,
    }
}

fn online_agent(db: &InquestDb, name: &str, queue_location: &str) {
    let hb = Heartbeat {
        name: name.into(),
        queue_location: queue_location.into(),
        version: "0.3.0".into(),
        pid: 100,
        start_time: Utc::now(),
        heartbeat_time: Utc::now(),
        environment: AgentEnvironment { os: "linux".into(), ..Default::default() },
        tags: BTreeMap::new(),
        destroyed: false,
    };
    db.upsert_heartbeat(&hb).unwrap();
}

fn signed_action(h: &Harness, signers: &[&str]) -> Action {
    let now = Utc::now();
    let mut action = Action {
        id: 0,
        name: "ls etc".into(),
        target: r#"status == "online""#.into(),
        description: None,
        threat: None,
        valid_from: now - Duration::seconds(5),
        expire_after: now + Duration::seconds(60),
        operations: vec![Operation {
            module: "file".into(),
            parameters: serde_json::json!({"path": "/etc", "name": "^passwd$"}),
        }],
        signatures: vec![],
        syntax_version: core_models::SYNTAX_VERSION,
        status: None,
        last_update_time: None,
        counters: None,
    };
    let canonical = trust_kernel::canonical_action_string(&action).unwrap();
    for signer in signers {
        action
            .signatures
            .push(trust_kernel::sign(&canonical, signer, &h.keystore).unwrap());
    }
    action
}

/// Push an action file through ingest + claim, returning the claimed row.
fn ingest_and_claim(h: &Harness, action: &Action) -> Vec<Action> {
    h.spool
        .enqueue(Stage::ActionNew, "submitted", &serde_json::to_vec(action).unwrap())
        .unwrap();
    pipeline::ingest_new_actions(&h.db, &h.spool).unwrap();
    h.db.claim_runnable_actions(Utc::now()).unwrap()
}

fn agent_reply(command: &Command, status: CommandStatus, envelope: ResultEnvelope) -> Command {
    let mut reply = command.clone();
    reply.status = status;
    reply.results = vec![envelope];
    reply.finish_time = Some(Utc::now());
    reply
}

#[test]
fn happy_path_single_agent() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);

    let claimed = ingest_and_claim(&h, &action);
    assert_eq!(claimed.len(), 1);
    let action = &claimed[0];
    assert_eq!(action.status, Some(ActionStatus::Scheduled));

    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, action).unwrap();
    assert_eq!(ready.len(), 1);

    let action_id =
        pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();
    assert_eq!(action_id, action.id);
    assert_eq!(h.db.action_status(action.id).unwrap(), Some(ActionStatus::Inflight));

    let published = h.publisher.commands.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "linux.host1.abc");

    // the agent answers with a successful envelope
    let reply = agent_reply(
        &published[0].1,
        CommandStatus::Success,
        ResultEnvelope { found_anything: true, ..Default::default() },
    );
    pipeline::record_returned(&h.spool, &reply).unwrap();
    let touched = pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();
    assert_eq!(touched, Some(action.id));

    assert!(pipeline::update_action(&h.db, &h.spool, &h.publisher, action.id).unwrap());
    assert_eq!(h.db.action_status(action.id).unwrap(), Some(ActionStatus::Completed));

    let counters = h.db.aggregate_counters(action.id).unwrap();
    assert_eq!(counters.sent, 1);
    assert_eq!(counters.returned, 1);
    assert_eq!(counters.success, 1);
    assert_eq!(counters.done, 1);
    assert_eq!(counters.inflight, 0);

    let events = h.publisher.events.lock().unwrap();
    assert!(events.iter().any(|(topic, _)| topic == "action.done"));
}

#[test]
fn unsigned_action_is_rejected_without_commands() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let mut action = signed_action(&h, &[]);
    action.signatures.clear();

    let claimed = ingest_and_claim(&h, &action);
    assert_eq!(claimed.len(), 1);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    assert!(ready.is_empty());

    let id = claimed[0].id.to_string();
    assert_eq!(h.spool.sidecar(Stage::ActionInvalid, &id).as_deref(), Some("NoSignatures"));
    assert_eq!(h.spool.list(Stage::ActionInvalid).unwrap(), vec![id]);
    assert_eq!(h.db.action_status(claimed[0].id).unwrap(), Some(ActionStatus::Invalid));
    assert_eq!(h.db.aggregate_counters(claimed[0].id).unwrap().sent, 0);
    assert!(h.publisher.commands.lock().unwrap().is_empty());
}

#[test]
fn insufficient_signature_weight_is_rejected() {
    // default rule wants weight 2 from {bob, carol}; only bob signs
    let h = harness(2, Some("carol"));
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);

    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    assert!(ready.is_empty());
    assert_eq!(
        h.spool.sidecar(Stage::ActionInvalid, &claimed[0].id.to_string()).as_deref(),
        Some("WeightBelowThreshold")
    );

    // both signatures clear the threshold
    let action = signed_action(&h, &["bob", "carol"]);
    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    assert_eq!(ready.len(), 1);
}

#[test]
fn module_timeout_counts_without_failing_the_action() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);

    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();

    let published = h.publisher.commands.lock().unwrap()[0].1.clone();
    let reply = agent_reply(
        &published,
        CommandStatus::Timeout,
        ResultEnvelope::from_error("module timed out after 300s"),
    );
    pipeline::record_returned(&h.spool, &reply).unwrap();
    pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();
    assert!(pipeline::update_action(&h.db, &h.spool, &h.publisher, claimed[0].id).unwrap());

    let counters = h.db.aggregate_counters(claimed[0].id).unwrap();
    assert_eq!(counters.timeout, 1);
    assert_eq!(counters.done, 1);
    assert_eq!(counters.sent, 1);
    assert_eq!(
        h.db.action_status(claimed[0].id).unwrap(),
        Some(ActionStatus::Completed)
    );
}

#[test]
fn zero_target_action_completes_immediately() {
    let h = harness(1, None);
    // no agents registered at all
    let action = signed_action(&h, &["bob"]);
    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    assert!(ready.is_empty());
    assert_eq!(
        h.db.action_status(claimed[0].id).unwrap(),
        Some(ActionStatus::Completed)
    );
    let counters = h.db.aggregate_counters(claimed[0].id).unwrap();
    assert_eq!(counters.sent, 0);
    assert_eq!(counters.done, 0);
}

#[test]
fn duplicate_result_delivery_is_idempotent() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);
    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();
    let published = h.publisher.commands.lock().unwrap()[0].1.clone();

    let reply = agent_reply(
        &published,
        CommandStatus::Success,
        ResultEnvelope { found_anything: true, ..Default::default() },
    );
    pipeline::record_returned(&h.spool, &reply).unwrap();
    pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();

    // the relay redelivers: same result again, then a contradictory one
    pipeline::record_returned(&h.spool, &reply).unwrap();
    pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();
    let contradictory = agent_reply(&published, CommandStatus::Failed, ResultEnvelope::default());
    pipeline::record_returned(&h.spool, &contradictory).unwrap();
    pipeline::terminate_command(&h.db, &h.spool, &contradictory.id).unwrap();

    let command = h.db.command_by_id(&published.id).unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Success);
    let counters = h.db.aggregate_counters(claimed[0].id).unwrap();
    assert_eq!(counters.sent, 1);
    assert_eq!(counters.done, 1);
}

#[test]
fn restart_replays_spool_without_duplicating_commands() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);
    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();
    assert_eq!(h.spool.list(Stage::CommandInflight).unwrap().len(), 1);

    // "restart": the inspector re-scans; the action is already in the
    // store, so nothing becomes claimable again
    pipeline::ingest_new_actions(&h.db, &h.spool).unwrap();
    assert!(h.db.claim_runnable_actions(Utc::now()).unwrap().is_empty());

    // the late result still matches the original command
    let published = h.publisher.commands.lock().unwrap()[0].1.clone();
    let reply = agent_reply(
        &published,
        CommandStatus::Success,
        ResultEnvelope { found_anything: true, ..Default::default() },
    );
    pipeline::record_returned(&h.spool, &reply).unwrap();
    pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();
    pipeline::update_action(&h.db, &h.spool, &h.publisher, claimed[0].id).unwrap();

    let counters = h.db.aggregate_counters(claimed[0].id).unwrap();
    assert_eq!(counters.sent, 1, "no duplicate commands after restart");
    assert_eq!(counters.success, 1);
}

#[test]
fn expired_commands_complete_the_action_via_housekeeping() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");

    let mut action = signed_action(&h, &["bob"]);
    // short expiry: sign over the real window
    let now = Utc::now();
    action.valid_from = now - Duration::seconds(5);
    action.expire_after = now + Duration::milliseconds(10);
    let canonical = trust_kernel::canonical_action_string(&action).unwrap();
    action.signatures = vec![trust_kernel::sign(&canonical, "bob", &h.keystore).unwrap()];

    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();

    // no result ever arrives; expiry housekeeping flips the command
    let later = Utc::now() + Duration::seconds(5);
    let touched = h.db.expire_commands_past_deadline(later).unwrap();
    assert_eq!(touched, vec![claimed[0].id]);
    assert!(pipeline::update_action(&h.db, &h.spool, &h.publisher, claimed[0].id).unwrap());

    let counters = h.db.aggregate_counters(claimed[0].id).unwrap();
    assert_eq!(counters.expired, 1);
    assert_eq!(counters.done, 1);
}

#[test]
fn duplicate_agents_get_signed_destroy_commands() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SchedulerConfig {
        relay: RelayConfig::new("redis://127.0.0.1/"),
        db_path: dir.path().join("db.sqlite").to_string_lossy().into_owned(),
        spool_dir: dir.path().join("spool"),
        keystore_path: dir.path().join("keystore.json"),
        agent_keys: dir.path().join("keys"),
        acl: dir.path().join("acl.json"),
        spool_inspect_freq_secs: 7,
        housekeeping_freq_secs: 60,
        idle_threshold_secs: 300,
        offline_threshold_secs: 1800,
    };
    let db = InquestDb::open_in_memory().unwrap();
    let spool = MemSpool::new();
    let publisher = RecordingPublisher::default();
    let identity = SchedulerIdentity::bootstrap(&cfg, &db).unwrap();

    // two live agents on the same hostname; the older one must go
    let old_start = Utc::now() - Duration::seconds(120);
    let mut old_hb = Heartbeat {
        name: "host1".into(),
        queue_location: "linux.host1.old".into(),
        version: "0.3.0".into(),
        pid: 100,
        start_time: old_start,
        heartbeat_time: Utc::now(),
        environment: Default::default(),
        tags: BTreeMap::new(),
        destroyed: false,
    };
    db.upsert_heartbeat(&old_hb).unwrap();
    old_hb.queue_location = "linux.host1.new".into();
    old_hb.start_time = Utc::now();
    old_hb.pid = 200;
    db.upsert_heartbeat(&old_hb).unwrap();

    let sent =
        housekeeping::resolve_duplicate_agents(&db, &spool, &publisher, &identity).unwrap();
    assert_eq!(sent, 1);

    let published = publisher.commands.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    let (queue_location, command) = &published[0];
    assert_eq!(queue_location, "linux.host1.old");
    assert_eq!(command.operations[0].module, "agentdestroy");

    // the destroy command verifies under the exported scheduler key
    let mut keyring = Keyring::empty();
    keyring
        .add_armored(&std::fs::read_to_string(cfg.agent_keys.join("scheduler.pub")).unwrap())
        .unwrap();
    let mut acl = Acl::single_default(
        1,
        vec![AclInvestigator { fingerprint: "OPERATOR".into(), weight: 1 }],
    );
    identity.splice_into_acl(&mut acl);
    let action = db.action_by_id(command.action_id).unwrap().unwrap();
    trust_kernel::authorize_action(&action, &acl, &keyring).unwrap();

    // the survivor is untouched and a second pass finds nothing new
    assert!(db
        .agent_by_queue_location("linux.host1.new")
        .unwrap()
        .is_some());
    let again =
        housekeeping::resolve_duplicate_agents(&db, &spool, &publisher, &identity).unwrap();
    // both agents still heartbeat as online, so resolution fires again
    // until the doomed agent actually obeys; idempotence lives in the
    // agent's destroy handling, not here
    assert_eq!(again, 1);
}

#[test]
fn cancelled_action_discards_late_results() {
    let h = harness(1, None);
    online_agent(&h.db, "host1", "linux.host1.abc");
    let action = signed_action(&h, &["bob"]);
    let claimed = ingest_and_claim(&h, &action);
    let ready = pipeline::process_new_action(&h.db, &h.spool, &h.trust, &claimed[0]).unwrap();
    pipeline::send_command(&h.db, &h.spool, &h.publisher, &ready[0]).unwrap();

    h.db.update_action_status(claimed[0].id, ActionStatus::Cancelled).unwrap();

    let published = h.publisher.commands.lock().unwrap()[0].1.clone();
    let reply = agent_reply(
        &published,
        CommandStatus::Success,
        ResultEnvelope { found_anything: true, ..Default::default() },
    );
    pipeline::record_returned(&h.spool, &reply).unwrap();
    let touched = pipeline::terminate_command(&h.db, &h.spool, &reply.id).unwrap();
    assert_eq!(touched, None);

    let command = h.db.command_by_id(&published.id).unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Sent, "result was discarded");
}
