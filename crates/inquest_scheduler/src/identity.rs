//! The scheduler's own signing identity. Generated on first start,
//! registered as an investigator with no user-facing permissions, and
//! used solely to sign `agentdestroy` actions during duplicate-agent
//! resolution.

use chrono::{Duration, Utc};
use core_models::{
    Action, ActionStatus, Agent, Command, CommandStatus, Investigator, InvestigatorPerms,
    InvestigatorStatus,
};
use inquest_db::InquestDb;
use tracing::{info, warn};
use trust_kernel::{Acl, Keystore};

use crate::{Result, SchedulerConfig, SCHEDULER_KEY_ID};

pub struct SchedulerIdentity {
    pub fingerprint: String,
    keystore: Keystore,
}

impl SchedulerIdentity {
    /// Load or create the scheduler key, export its public half into the
    /// investigator key directory and register the investigator row.
    pub fn bootstrap(cfg: &SchedulerConfig, db: &InquestDb) -> Result<SchedulerIdentity> {
        let mut keystore = Keystore::open_or_create(&cfg.keystore_path)?;
        if !keystore.contains(SCHEDULER_KEY_ID) {
            let fp = keystore.generate(SCHEDULER_KEY_ID)?;
            info!(fingerprint = %fp, "generated scheduler signing identity");
        }
        let fingerprint = keystore.fingerprint_of(SCHEDULER_KEY_ID)?;
        let public_key = keystore.public_key_armored(SCHEDULER_KEY_ID)?;

        // agents verifying destroy commands read the same key directory
        std::fs::create_dir_all(&cfg.agent_keys)
            .map_err(trust_kernel::TrustError::from)?;
        let exported = cfg.agent_keys.join("scheduler.pub");
        if !exported.exists() {
            std::fs::write(&exported, &public_key).map_err(trust_kernel::TrustError::from)?;
        }

        if db.investigator_by_fingerprint(&fingerprint)?.is_none() {
            db.insert_investigator(&Investigator {
                id: 0,
                name: SCHEDULER_KEY_ID.to_string(),
                public_key,
                fingerprint: fingerprint.clone(),
                status: InvestigatorStatus::Active,
                permissions: InvestigatorPerms::default(),
            })?;
        }

        Ok(SchedulerIdentity { fingerprint, keystore })
    }

    /// Make sure the ACL authorizes this identity for `agentdestroy`;
    /// without that rule duplicate-agent resolution cannot work.
    pub fn splice_into_acl(&self, acl: &mut Acl) {
        let already = acl
            .rule(module_runtime::AGENT_DESTROY_MODULE)
            .map(|r| r.investigators.iter().any(|i| i.fingerprint == self.fingerprint))
            .unwrap_or(false);
        if !already {
            warn!(
                "ACL file does not authorize the scheduler for {}; splicing it in",
                module_runtime::AGENT_DESTROY_MODULE
            );
            acl.ensure_investigator(module_runtime::AGENT_DESTROY_MODULE, &self.fingerprint, 1);
        }
    }

    /// Build a signed `agentdestroy` action plus its single command for
    /// one doomed agent.
    pub fn destroy_action_for(&self, agent: &Agent) -> Result<(Action, Command)> {
        let now = Utc::now();
        let mut action = Action {
            id: core_models::gen_action_id(now),
            name: "agentdestroy".into(),
            target: format!("queueloc == \"{}\"", agent.queue_location),
            description: None,
            threat: None,
            valid_from: now,
            expire_after: now + Duration::seconds(600),
            operations: vec![core_models::Operation {
                module: module_runtime::AGENT_DESTROY_MODULE.into(),
                parameters: serde_json::json!({
                    "pid": agent.pid,
                    "queueloc": agent.queue_location,
                }),
            }],
            signatures: Vec::new(),
            syntax_version: core_models::SYNTAX_VERSION,
            status: Some(ActionStatus::Inflight),
            last_update_time: Some(now),
            counters: None,
        };
        let canonical = trust_kernel::canonical_action_string(&action)?;
        action.signatures =
            vec![trust_kernel::sign(&canonical, SCHEDULER_KEY_ID, &self.keystore)?];

        let command = Command {
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
        };
        Ok((action, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_queue::RelayConfig;

    fn test_config(dir: &std::path::Path) -> SchedulerConfig {
        SchedulerConfig {
            relay: RelayConfig::new("redis://127.0.0.1/"),
            db_path: dir.join("db.sqlite").to_string_lossy().into_owned(),
            spool_dir: dir.join("spool"),
            keystore_path: dir.join("keystore.json"),
            agent_keys: dir.join("keys"),
            acl: dir.join("acl.json"),
            spool_inspect_freq_secs: 7,
            housekeeping_freq_secs: 60,
            idle_threshold_secs: 300,
            offline_threshold_secs: 1800,
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let db = InquestDb::open_in_memory().unwrap();

        let first = SchedulerIdentity::bootstrap(&cfg, &db).unwrap();
        let second = SchedulerIdentity::bootstrap(&cfg, &db).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(cfg.agent_keys.join("scheduler.pub").exists());
        assert!(db
            .investigator_by_fingerprint(&first.fingerprint)
            .unwrap()
            .is_some());
    }

    #[test]
    fn destroy_action_verifies_under_spliced_acl() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let db = InquestDb::open_in_memory().unwrap();
        let identity = SchedulerIdentity::bootstrap(&cfg, &db).unwrap();

        let mut acl = Acl::single_default(
            1,
            vec![trust_kernel::AclInvestigator { fingerprint: "OPERATOR".into(), weight: 1 }],
        );
        identity.splice_into_acl(&mut acl);

        let agent = Agent {
            id: 1,
            name: "host1".into(),
            queue_location: "linux.host1.abc".into(),
            version: "0.3.0".into(),
            pid: 99,
            start_time: Utc::now(),
            heartbeat_time: Utc::now(),
            destruction_time: None,
            environment: Default::default(),
            tags: Default::default(),
            status: core_models::AgentStatus::Online,
        };
        let (action, command) = identity.destroy_action_for(&agent).unwrap();
        assert_eq!(command.action_id, action.id);
        assert_eq!(command.operations[0].module, "agentdestroy");

        let mut keyring = trust_kernel::Keyring::empty();
        keyring
            .add_armored(&std::fs::read_to_string(cfg.agent_keys.join("scheduler.pub")).unwrap())
            .unwrap();
        let signers = trust_kernel::authorize_action(&action, &acl, &keyring).unwrap();
        assert_eq!(signers, vec![identity.fingerprint.clone()]);
    }
}
