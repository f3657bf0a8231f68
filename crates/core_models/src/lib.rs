//! Shared data model for the inquest platform: actions authored by
//! investigators, commands bound to agents, agent registrations and the
//! counters that tie them together.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Only action syntax understood by this release.
pub const SYNTAX_VERSION: u16 = 2;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("unsupported syntax version {0}, expected {SYNTAX_VERSION}")]
    UnsupportedVersion(u16),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Lifecycle of an action, owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Scheduled,
    Preparing,
    Inflight,
    Completed,
    Expired,
    Cancelled,
    Invalid,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::Preparing => "preparing",
            ActionStatus::Inflight => "inflight",
            ActionStatus::Completed => "completed",
            ActionStatus::Expired => "expired",
            ActionStatus::Cancelled => "cancelled",
            ActionStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "scheduled" => Ok(ActionStatus::Scheduled),
            "preparing" => Ok(ActionStatus::Preparing),
            "inflight" => Ok(ActionStatus::Inflight),
            "completed" => Ok(ActionStatus::Completed),
            "expired" => Ok(ActionStatus::Expired),
            "cancelled" => Ok(ActionStatus::Cancelled),
            "invalid" => Ok(ActionStatus::Invalid),
            other => Err(ModelError::Malformed(format!("unknown action status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Expired
                | ActionStatus::Cancelled
                | ActionStatus::Invalid
        )
    }
}

/// Status of a command. Everything except `sent` is terminal; once a
/// command reaches a terminal status it is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Success,
    Cancelled,
    Expired,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Sent => "sent",
            CommandStatus::Success => "success",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Expired => "expired",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(CommandStatus::Sent),
            "success" => Ok(CommandStatus::Success),
            "cancelled" => Ok(CommandStatus::Cancelled),
            "expired" => Ok(CommandStatus::Expired),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            other => Err(ModelError::Malformed(format!("unknown command status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Sent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Idle,
    Offline,
    Destroyed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Idle => "idle",
            AgentStatus::Offline => "offline",
            AgentStatus::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "idle" => Ok(AgentStatus::Idle),
            "offline" => Ok(AgentStatus::Offline),
            "destroyed" => Ok(AgentStatus::Destroyed),
            other => Err(ModelError::Malformed(format!("unknown agent status '{other}'"))),
        }
    }
}

/// One unit of module work inside an action. Parameter format is owned by
/// the module named here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub module: String,
    pub parameters: serde_json::Value,
}

/// Free-form authorship block carried along for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub revision: f64,
}

/// Threat classification attached by the investigator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// Completion counters for an action, derived from its command rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub returned: i64,
    #[serde(default)]
    pub done: i64,
    #[serde(default)]
    pub cancelled: i64,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub expired: i64,
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub inflight: i64,
}

impl Counters {
    /// Build counters from a per-status command tally. `sent` counts every
    /// command ever emitted, `done` every terminal one.
    pub fn from_tally(tally: &BTreeMap<CommandStatus, i64>) -> Self {
        let get = |s: CommandStatus| tally.get(&s).copied().unwrap_or(0);
        let success = get(CommandStatus::Success);
        let cancelled = get(CommandStatus::Cancelled);
        let expired = get(CommandStatus::Expired);
        let failed = get(CommandStatus::Failed);
        let timeout = get(CommandStatus::Timeout);
        let inflight = get(CommandStatus::Sent);
        let done = success + cancelled + expired + failed + timeout;
        Counters {
            sent: done + inflight,
            returned: success + failed + timeout,
            done,
            cancelled,
            failed,
            timeout,
            expired,
            success,
            inflight,
        }
    }

    /// True once every emitted command reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.inflight == 0
    }
}

/// An investigation request, authored and signed by one or more
/// investigators. This is the unit operators submit; the scheduler fans it
/// out as one command per targeted agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat: Option<Threat>,
    pub valid_from: DateTime<Utc>,
    pub expire_after: DateTime<Utc>,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default = "default_syntax_version")]
    pub syntax_version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
}

fn default_syntax_version() -> u16 {
    SYNTAX_VERSION
}

impl Action {
    /// Check structural validity of a submitted action. Signature and ACL
    /// checks are a separate, later stage.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.name.is_empty() {
            return Err(ModelError::Malformed("action name is empty".into()));
        }
        if self.target.is_empty() {
            return Err(ModelError::Malformed("action target is empty".into()));
        }
        if self.syntax_version != SYNTAX_VERSION {
            return Err(ModelError::UnsupportedVersion(self.syntax_version));
        }
        if self.valid_from >= self.expire_after {
            return Err(ModelError::Malformed(
                "expireAfter is not later than validFrom".into(),
            ));
        }
        if self.expire_after <= now {
            return Err(ModelError::Malformed("action has already expired".into()));
        }
        if self.operations.is_empty() {
            return Err(ModelError::Malformed("action carries no operations".into()));
        }
        Ok(())
    }
}

/// Generate a 64-bit action id: high 32 bits are the unix seconds of
/// ingestion, low 32 bits a hash over the nanosecond timestamp and fresh
/// entropy. Sorting by id sorts by ingest time.
pub fn gen_action_id(now: DateTime<Utc>) -> i64 {
    let nanos = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let salt: u64 = rand::thread_rng().gen();
    let mut hasher = Sha256::new();
    hasher.update(nanos.as_bytes());
    hasher.update(salt.to_be_bytes());
    let digest = hasher.finalize();
    let low = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    ((now.timestamp() as i64) << 32) | low as i64
}

/// Generate a command id.
pub fn gen_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Uniform result of one module invocation. `elements` and `statistics`
/// are module-specific; the platform only routes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    #[serde(default)]
    pub found_anything: bool,
    #[serde(default)]
    pub elements: serde_json::Value,
    #[serde(default)]
    pub statistics: serde_json::Value,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEnvelope {
    /// Envelope for a run that never produced module output.
    pub fn from_error(msg: impl Into<String>) -> Self {
        ResultEnvelope {
            found_anything: false,
            elements: serde_json::Value::Null,
            statistics: serde_json::Value::Null,
            errors: vec![msg.into()],
        }
    }
}

/// An action instantiated for a single agent. The signed header fields
/// and the operations are frozen copies taken at emission, so the agent
/// can re-verify every signature from the command alone; the action row
/// never embeds its commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub action_id: i64,
    pub action_name: String,
    pub action_target: String,
    #[serde(default)]
    pub agent_id: i64,
    pub agent_name: String,
    pub agent_queue_location: String,
    pub operations: Vec<Operation>,
    pub signatures: Vec<String>,
    pub valid_from: DateTime<Utc>,
    pub expire_after: DateTime<Utc>,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<ResultEnvelope>,
}

impl Command {
    /// Reconstruct the signed view of the parent action from the frozen
    /// fields. Exactly the fields covered by the canonical string are
    /// meaningful here.
    pub fn frozen_action(&self) -> Action {
        Action {
            id: self.action_id,
            name: self.action_name.clone(),
            target: self.action_target.clone(),
            description: None,
            threat: None,
            valid_from: self.valid_from,
            expire_after: self.expire_after,
            operations: self.operations.clone(),
            signatures: self.signatures.clone(),
            syntax_version: SYNTAX_VERSION,
            status: None,
            last_update_time: None,
            counters: None,
        }
    }
}

/// Environment discovered by an agent at startup and advertised in every
/// heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnvironment {
    #[serde(default)]
    pub init: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub is_proxied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// An endpoint registration, created by the first heartbeat received from
/// a queue location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub queue_location: String,
    pub version: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub heartbeat_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub environment: AgentEnvironment,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: AgentStatus,
}

/// Periodic liveness message published by agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub name: String,
    pub queue_location: String,
    pub version: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub heartbeat_time: DateTime<Utc>,
    #[serde(default)]
    pub environment: AgentEnvironment,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Set on the final heartbeat of an agent obeying a destroy command.
    #[serde(default)]
    pub destroyed: bool,
}

/// Permission flags of an investigator account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigatorPerms {
    #[serde(default)]
    pub default_set: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub loader: bool,
    #[serde(default)]
    pub manifest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigatorStatus {
    Active,
    Disabled,
}

impl InvestigatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigatorStatus::Active => "active",
            InvestigatorStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(InvestigatorStatus::Active),
            "disabled" => Ok(InvestigatorStatus::Disabled),
            other => Err(ModelError::Malformed(format!(
                "unknown investigator status '{other}'"
            ))),
        }
    }
}

/// A trust principal identified by its signing-key fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investigator {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub public_key: String,
    pub fingerprint: String,
    pub status: InvestigatorStatus,
    #[serde(default)]
    pub permissions: InvestigatorPerms,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_action(now: DateTime<Utc>) -> Action {
        Action {
            id: 0,
            name: "ls etc".into(),
            target: "status == \"online\"".into(),
            description: None,
            threat: None,
            valid_from: now,
            expire_after: now + Duration::seconds(60),
            operations: vec![Operation {
                module: "file".into(),
                parameters: serde_json::json!({"path": "/etc", "name": "^passwd$"}),
            }],
            signatures: vec!["sig".into()],
            syntax_version: SYNTAX_VERSION,
            status: None,
            last_update_time: None,
            counters: None,
        }
    }

    #[test]
    fn action_id_embeds_ingest_seconds() {
        let now = Utc::now();
        let id = gen_action_id(now);
        assert_eq!(id >> 32, now.timestamp());
        let id2 = gen_action_id(now);
        assert_ne!(id, id2, "low bits must differ across generations");
    }

    #[test]
    fn validate_accepts_well_formed_action() {
        let now = Utc::now();
        assert!(sample_action(now).validate(now).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_syntax_version() {
        let now = Utc::now();
        let mut a = sample_action(now);
        a.syntax_version = 1;
        assert!(matches!(
            a.validate(now),
            Err(ModelError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn validate_rejects_expired_and_inverted_windows() {
        let now = Utc::now();
        let mut a = sample_action(now);
        a.expire_after = now - Duration::seconds(1);
        assert!(a.validate(now).is_err());

        let mut b = sample_action(now);
        b.valid_from = b.expire_after + Duration::seconds(1);
        assert!(b.validate(now).is_err());
    }

    #[test]
    fn validate_rejects_empty_operations() {
        let now = Utc::now();
        let mut a = sample_action(now);
        a.operations.clear();
        assert!(a.validate(now).is_err());
    }

    #[test]
    fn counters_done_is_sum_of_terminals() {
        let mut tally = BTreeMap::new();
        tally.insert(CommandStatus::Success, 3);
        tally.insert(CommandStatus::Failed, 1);
        tally.insert(CommandStatus::Timeout, 2);
        tally.insert(CommandStatus::Expired, 1);
        tally.insert(CommandStatus::Cancelled, 1);
        tally.insert(CommandStatus::Sent, 2);

        let c = Counters::from_tally(&tally);
        assert_eq!(
            c.done,
            c.success + c.cancelled + c.expired + c.failed + c.timeout
        );
        assert_eq!(c.sent, 10);
        assert_eq!(c.returned, 6);
        assert_eq!(c.inflight, 2);
        assert!(!c.all_terminal());
    }

    #[test]
    fn action_json_ignores_unknown_fields() {
        let now = Utc::now();
        let mut v = serde_json::to_value(sample_action(now)).unwrap();
        v.as_object_mut()
            .unwrap()
            .insert("futureField".into(), serde_json::json!(42));
        let back: Action = serde_json::from_value(v).unwrap();
        assert_eq!(back.name, "ls etc");
    }

    #[test]
    fn command_status_terminal_set() {
        assert!(!CommandStatus::Sent.is_terminal());
        for s in [
            CommandStatus::Success,
            CommandStatus::Cancelled,
            CommandStatus::Expired,
            CommandStatus::Failed,
            CommandStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn frozen_action_preserves_signed_fields() {
        let now = Utc::now();
        let action = sample_action(now);
        let command = Command {
            id: gen_command_id(),
            action_id: action.id,
            action_name: action.name.clone(),
            action_target: action.target.clone(),
            agent_id: 1,
            agent_name: "host1".into(),
            agent_queue_location: "linux.host1.abc".into(),
            operations: action.operations.clone(),
            signatures: action.signatures.clone(),
            valid_from: action.valid_from,
            expire_after: action.expire_after,
            status: CommandStatus::Sent,
            start_time: None,
            finish_time: None,
            results: vec![],
        };
        let frozen = command.frozen_action();
        assert_eq!(frozen.name, action.name);
        assert_eq!(frozen.target, action.target);
        assert_eq!(frozen.valid_from, action.valid_from);
        assert_eq!(frozen.expire_after, action.expire_after);
        assert_eq!(frozen.operations, action.operations);
        assert_eq!(frozen.signatures, action.signatures);
    }

    #[test]
    fn envelope_from_error_carries_message() {
        let env = ResultEnvelope::from_error("module exploded");
        assert!(!env.found_anything);
        assert_eq!(env.errors, vec!["module exploded".to_string()]);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["pending", "scheduled", "preparing", "inflight", "completed"] {
            assert_eq!(ActionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ActionStatus::parse("bogus").is_err());
    }
}
