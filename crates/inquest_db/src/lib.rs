//! Store adapter: the single durable source of truth for actions,
//! commands, agents and investigators.
//!
//! SQLite with JSON columns for nested structures. Instants are stored
//! as epoch nanoseconds so an action read back from the store
//! re-canonicalizes to the exact bytes its signatures cover.

use chrono::{DateTime, Duration, Utc};
use core_models::{
    Action, ActionStatus, Agent, AgentStatus, Command, CommandStatus, Counters, Heartbeat,
    Investigator, InvestigatorStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model error: {0}")]
    Model(#[from] core_models::ModelError),
    #[error("target error: {0}")]
    Target(#[from] target_query::TargetError),
}

pub type Result<T> = std::result::Result<T, DbError>;

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

fn dt(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

pub struct InquestDb {
    conn: Connection,
}

impl InquestDb {
    /// Open or create the store at the given path and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // concurrent schedulers serialize on the write lock
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = InquestDb { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = InquestDb { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                description JSON,
                threat JSON,
                valid_from INTEGER NOT NULL,
                expire_after INTEGER NOT NULL,
                operations JSON NOT NULL,
                signatures JSON NOT NULL,
                syntax_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_update_time INTEGER NOT NULL,
                claim_token TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status);

            CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                action_id INTEGER NOT NULL,
                action_name TEXT NOT NULL,
                action_target TEXT NOT NULL,
                agent_id INTEGER NOT NULL,
                agent_name TEXT NOT NULL,
                agent_queue_location TEXT NOT NULL,
                operations JSON NOT NULL,
                signatures JSON NOT NULL,
                valid_from INTEGER NOT NULL,
                expire_after INTEGER NOT NULL,
                status TEXT NOT NULL,
                start_time INTEGER,
                finish_time INTEGER,
                results JSON NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_commands_action ON commands(action_id);
            CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                queue_location TEXT NOT NULL UNIQUE,
                version TEXT NOT NULL,
                pid INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                heartbeat_time INTEGER NOT NULL,
                destruction_time INTEGER,
                environment JSON NOT NULL,
                tags JSON NOT NULL,
                status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
            CREATE INDEX IF NOT EXISTS idx_agents_name ON agents(name);

            CREATE TABLE IF NOT EXISTS investigators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                perm_default INTEGER NOT NULL DEFAULT 0,
                perm_admin INTEGER NOT NULL DEFAULT 0,
                perm_loader INTEGER NOT NULL DEFAULT 0,
                perm_manifest INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    // ---- actions ----

    pub fn insert_action(&self, action: &Action) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO actions
               (id, name, target, description, threat, valid_from, expire_after,
                operations, signatures, syntax_version, status, last_update_time)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                action.id,
                action.name,
                action.target,
                serde_json::to_string(&action.description)?,
                serde_json::to_string(&action.threat)?,
                ts(action.valid_from),
                ts(action.expire_after),
                serde_json::to_string(&action.operations)?,
                serde_json::to_string(&action.signatures)?,
                action.syntax_version,
                action.status.unwrap_or(ActionStatus::Pending).as_str(),
                ts(action.last_update_time.unwrap_or_else(Utc::now)),
            ],
        )?;
        Ok(())
    }

    pub fn insert_or_update_action(&self, action: &Action) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO actions
               (id, name, target, description, threat, valid_from, expire_after,
                operations, signatures, syntax_version, status, last_update_time)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 last_update_time = excluded.last_update_time"#,
            params![
                action.id,
                action.name,
                action.target,
                serde_json::to_string(&action.description)?,
                serde_json::to_string(&action.threat)?,
                ts(action.valid_from),
                ts(action.expire_after),
                serde_json::to_string(&action.operations)?,
                serde_json::to_string(&action.signatures)?,
                action.syntax_version,
                action.status.unwrap_or(ActionStatus::Pending).as_str(),
                ts(action.last_update_time.unwrap_or_else(Utc::now)),
            ],
        )?;
        Ok(())
    }

    pub fn action_by_id(&self, id: i64) -> Result<Option<Action>> {
        self.conn
            .query_row(
                r#"SELECT id, name, target, description, threat, valid_from, expire_after,
                          operations, signatures, syntax_version, status, last_update_time
                   FROM actions WHERE id = ?1"#,
                params![id],
                row_to_action,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Atomically claim every runnable pending action: flip it to
    /// `scheduled` under a fresh claim token and return the claimed rows.
    /// Two schedulers claiming concurrently receive disjoint sets.
    pub fn claim_runnable_actions(&self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        let token = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            r#"UPDATE actions
               SET status = 'scheduled', claim_token = ?1, last_update_time = ?2
               WHERE status = 'pending' AND valid_from < ?3 AND expire_after > ?3"#,
            params![token, ts(now), ts(now)],
        )?;
        let mut stmt = self.conn.prepare(
            r#"SELECT id, name, target, description, threat, valid_from, expire_after,
                      operations, signatures, syntax_version, status, last_update_time
               FROM actions WHERE claim_token = ?1"#,
        )?;
        let rows = stmt.query_map(params![token], row_to_action)?;
        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }

    pub fn update_action_status(&self, id: i64, status: ActionStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE actions SET status = ?1, last_update_time = ?2 WHERE id = ?3",
            params![status.as_str(), ts(Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn action_status(&self, id: i64) -> Result<Option<ActionStatus>> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM actions WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        Ok(match status {
            Some(s) => Some(ActionStatus::parse(&s)?),
            None => None,
        })
    }

    /// Expire actions that aged out before any command was emitted.
    /// Actions with commands in flight terminate through command expiry
    /// instead. Returns the expired ids.
    pub fn expire_stale_actions(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id FROM actions
               WHERE status IN ('pending', 'scheduled') AND expire_after < ?1"#,
        )?;
        let rows = stmt.query_map(params![ts(now)], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        if !ids.is_empty() {
            self.conn.execute(
                r#"UPDATE actions SET status = 'expired', last_update_time = ?1
                   WHERE status IN ('pending', 'scheduled') AND expire_after < ?1"#,
                params![ts(now)],
            )?;
        }
        Ok(ids)
    }

    /// Per-action counters, derived from the command rows.
    pub fn aggregate_counters(&self, action_id: i64) -> Result<Counters> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM commands WHERE action_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![action_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut tally = std::collections::BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            tally.insert(CommandStatus::parse(&status)?, count);
        }
        Ok(Counters::from_tally(&tally))
    }

    // ---- commands ----

    pub fn insert_command(&self, command: &Command) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO commands
               (id, action_id, action_name, action_target, agent_id, agent_name,
                agent_queue_location, operations, signatures, valid_from,
                expire_after, status, start_time, finish_time, results)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                command.id,
                command.action_id,
                command.action_name,
                command.action_target,
                command.agent_id,
                command.agent_name,
                command.agent_queue_location,
                serde_json::to_string(&command.operations)?,
                serde_json::to_string(&command.signatures)?,
                ts(command.valid_from),
                ts(command.expire_after),
                command.status.as_str(),
                command.start_time.map(ts),
                command.finish_time.map(ts),
                serde_json::to_string(&command.results)?,
            ],
        )?;
        Ok(())
    }

    pub fn command_by_id(&self, id: &str) -> Result<Option<Command>> {
        self.conn
            .query_row(
                r#"SELECT id, action_id, action_name, action_target, agent_id,
                          agent_name, agent_queue_location, operations, signatures,
                          valid_from, expire_after, status, start_time, finish_time,
                          results
                   FROM commands WHERE id = ?1"#,
                params![id],
                row_to_command,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Record a command result. Only a command still in `sent` is
    /// updated; a terminal command ignores further results so broker
    /// redeliveries are harmless. Returns whether a row changed.
    pub fn update_command_result(
        &self,
        id: &str,
        status: CommandStatus,
        results: &[core_models::ResultEnvelope],
        finish_time: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            r#"UPDATE commands
               SET status = ?1, results = ?2, finish_time = ?3
               WHERE id = ?4 AND status = 'sent'"#,
            params![status.as_str(), serde_json::to_string(results)?, ts(finish_time), id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_command_sent(&self, id: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE commands SET start_time = ?1 WHERE id = ?2",
            params![ts(start_time), id],
        )?;
        Ok(())
    }

    /// Expire every non-terminal command whose deadline has passed.
    /// Returns the distinct action ids touched, for counter recomputes.
    pub fn expire_commands_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT action_id FROM commands WHERE status = 'sent' AND expire_after < ?1",
        )?;
        let rows = stmt.query_map(params![ts(now)], |row| row.get::<_, i64>(0))?;
        let mut action_ids = Vec::new();
        for row in rows {
            action_ids.push(row?);
        }
        if !action_ids.is_empty() {
            self.conn.execute(
                r#"UPDATE commands SET status = 'expired', finish_time = ?1
                   WHERE status = 'sent' AND expire_after < ?1"#,
                params![ts(now)],
            )?;
        }
        Ok(action_ids)
    }

    // ---- agents ----

    /// Apply a heartbeat: first one creates the row, later ones refresh
    /// it. Heartbeat times never move backwards, so a redelivered old
    /// heartbeat cannot mask a fresher one.
    pub fn upsert_heartbeat(&self, hb: &Heartbeat) -> Result<bool> {
        let status = if hb.destroyed { AgentStatus::Destroyed } else { AgentStatus::Online };
        let destruction = if hb.destroyed { Some(ts(hb.heartbeat_time)) } else { None };
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM agents WHERE queue_location = ?1",
                params![hb.queue_location],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            None => {
                self.conn.execute(
                    r#"INSERT INTO agents
                       (name, queue_location, version, pid, start_time, heartbeat_time,
                        destruction_time, environment, tags, status)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                    params![
                        hb.name,
                        hb.queue_location,
                        hb.version,
                        hb.pid,
                        ts(hb.start_time),
                        ts(hb.heartbeat_time),
                        destruction,
                        serde_json::to_string(&hb.environment)?,
                        serde_json::to_string(&hb.tags)?,
                        status.as_str(),
                    ],
                )?;
                Ok(true)
            }
            Some(_) => {
                self.conn.execute(
                    r#"UPDATE agents SET
                         name = ?1, version = ?2, pid = ?3, start_time = ?4,
                         heartbeat_time = MAX(heartbeat_time, ?5),
                         destruction_time = COALESCE(?6, destruction_time),
                         environment = ?7, tags = ?8, status = ?9
                       WHERE queue_location = ?10"#,
                    params![
                        hb.name,
                        hb.version,
                        hb.pid,
                        ts(hb.start_time),
                        ts(hb.heartbeat_time),
                        destruction,
                        serde_json::to_string(&hb.environment)?,
                        serde_json::to_string(&hb.tags)?,
                        status.as_str(),
                        hb.queue_location,
                    ],
                )?;
                Ok(false)
            }
        }
    }

    pub fn agent_by_queue_location(&self, queue_location: &str) -> Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("{AGENT_SELECT} WHERE queue_location = ?1"),
                params![queue_location],
                row_to_agent,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Agents matching a target expression, via the compiled predicate.
    pub fn list_agents_by_target(&self, target: &str) -> Result<Vec<Agent>> {
        let predicate = target_query::compile(target)?;
        let sql = format!("{AGENT_SELECT} WHERE {}", predicate.where_clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(predicate.params.iter()),
            row_to_agent,
        )?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Flip online agents with stale heartbeats to idle. Returns the
    /// number of rows changed.
    pub fn mark_idle_agents(&self, threshold: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = ts(now - threshold);
        Ok(self.conn.execute(
            "UPDATE agents SET status = 'idle' WHERE status = 'online' AND heartbeat_time < ?1",
            params![cutoff],
        )?)
    }

    /// Flip idle/online agents past the offline threshold and return
    /// their queue locations so the relay queues can be cleaned up.
    pub fn mark_offline_agents(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let cutoff = ts(now - threshold);
        let mut stmt = self.conn.prepare(
            r#"SELECT queue_location FROM agents
               WHERE status IN ('online', 'idle') AND heartbeat_time < ?1"#,
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        let mut locations = Vec::new();
        for row in rows {
            locations.push(row?);
        }
        if !locations.is_empty() {
            self.conn.execute(
                r#"UPDATE agents SET status = 'offline'
                   WHERE status IN ('online', 'idle') AND heartbeat_time < ?1"#,
                params![cutoff],
            )?;
        }
        Ok(locations)
    }

    pub fn list_idle_agents(&self, since: DateTime<Utc>) -> Result<Vec<Agent>> {
        self.list_agents_with_status("idle", since)
    }

    pub fn list_offline_agents(&self, since: DateTime<Utc>) -> Result<Vec<Agent>> {
        self.list_agents_with_status("offline", since)
    }

    fn list_agents_with_status(&self, status: &str, since: DateTime<Utc>) -> Result<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{AGENT_SELECT} WHERE status = ?1 AND heartbeat_time > ?2"))?;
        let rows = stmt.query_map(params![status, ts(since)], row_to_agent)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Groups of online agents sharing a hostname, each group sorted
    /// youngest-first by start time. Offline agents never count.
    pub fn list_duplicate_agents(&self) -> Result<Vec<Vec<Agent>>> {
        let mut names = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                r#"SELECT name FROM agents WHERE status = 'online'
                   GROUP BY name HAVING COUNT(*) > 1"#,
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                names.push(row?);
            }
        }
        let mut groups = Vec::new();
        for name in names {
            let mut stmt = self.conn.prepare(&format!(
                "{AGENT_SELECT} WHERE status = 'online' AND name = ?1 ORDER BY start_time DESC"
            ))?;
            let rows = stmt.query_map(params![name], row_to_agent)?;
            let mut group = Vec::new();
            for row in rows {
                group.push(row?);
            }
            groups.push(group);
        }
        Ok(groups)
    }

    pub fn mark_agent_destroyed(&self, queue_location: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE agents SET status = 'destroyed', destruction_time = ?1
               WHERE queue_location = ?2"#,
            params![ts(now), queue_location],
        )?;
        Ok(())
    }

    // ---- investigators ----

    pub fn insert_investigator(&self, inv: &Investigator) -> Result<i64> {
        self.conn.execute(
            r#"INSERT INTO investigators
               (name, public_key, fingerprint, status, perm_default, perm_admin,
                perm_loader, perm_manifest)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                inv.name,
                inv.public_key,
                inv.fingerprint,
                inv.status.as_str(),
                inv.permissions.default_set,
                inv.permissions.admin,
                inv.permissions.loader,
                inv.permissions.manifest,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn investigator_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Investigator>> {
        self.conn
            .query_row(
                r#"SELECT id, name, public_key, fingerprint, status, perm_default,
                          perm_admin, perm_loader, perm_manifest
                   FROM investigators WHERE fingerprint = ?1"#,
                params![fingerprint],
                row_to_investigator,
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn list_active_investigators(&self) -> Result<Vec<Investigator>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, name, public_key, fingerprint, status, perm_default,
                      perm_admin, perm_loader, perm_manifest
               FROM investigators WHERE status = 'active'"#,
        )?;
        let rows = stmt.query_map([], row_to_investigator)?;
        let mut investigators = Vec::new();
        for row in rows {
            investigators.push(row?);
        }
        Ok(investigators)
    }
}

const AGENT_SELECT: &str = r#"SELECT id, name, queue_location, version, pid, start_time,
    heartbeat_time, destruction_time, environment, tags, status FROM agents"#;

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_action(row: &Row) -> rusqlite::Result<Action> {
    let status: String = row.get(10)?;
    Ok(Action {
        id: row.get(0)?,
        name: row.get(1)?,
        target: row.get(2)?,
        description: json_col(row, 3)?,
        threat: json_col(row, 4)?,
        valid_from: dt(row.get(5)?),
        expire_after: dt(row.get(6)?),
        operations: json_col(row, 7)?,
        signatures: json_col(row, 8)?,
        syntax_version: row.get(9)?,
        status: ActionStatus::parse(&status).ok(),
        last_update_time: Some(dt(row.get(11)?)),
        counters: None,
    })
}

fn row_to_command(row: &Row) -> rusqlite::Result<Command> {
    let status: String = row.get(11)?;
    Ok(Command {
        id: row.get(0)?,
        action_id: row.get(1)?,
        action_name: row.get(2)?,
        action_target: row.get(3)?,
        agent_id: row.get(4)?,
        agent_name: row.get(5)?,
        agent_queue_location: row.get(6)?,
        operations: json_col(row, 7)?,
        signatures: json_col(row, 8)?,
        valid_from: dt(row.get(9)?),
        expire_after: dt(row.get(10)?),
        status: CommandStatus::parse(&status).unwrap_or(CommandStatus::Failed),
        start_time: row.get::<_, Option<i64>>(12)?.map(dt),
        finish_time: row.get::<_, Option<i64>>(13)?.map(dt),
        results: json_col(row, 14)?,
    })
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    let status: String = row.get(10)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        queue_location: row.get(2)?,
        version: row.get(3)?,
        pid: row.get(4)?,
        start_time: dt(row.get(5)?),
        heartbeat_time: dt(row.get(6)?),
        destruction_time: row.get::<_, Option<i64>>(7)?.map(dt),
        environment: json_col(row, 8)?,
        tags: json_col(row, 9)?,
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Offline),
    })
}

fn row_to_investigator(row: &Row) -> rusqlite::Result<Investigator> {
    let status: String = row.get(4)?;
    Ok(Investigator {
        id: row.get(0)?,
        name: row.get(1)?,
        public_key: row.get(2)?,
        fingerprint: row.get(3)?,
        status: InvestigatorStatus::parse(&status).unwrap_or(InvestigatorStatus::Disabled),
        permissions: core_models::InvestigatorPerms {
            default_set: row.get(5)?,
            admin: row.get(6)?,
            loader: row.get(7)?,
            manifest: row.get(8)?,
        },
    })
}
