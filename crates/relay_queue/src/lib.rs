//! Broker adapter for the platform's message relay.
//!
//! The relay is a Redis instance; a configurable key prefix plays the
//! role of the exchange and Redis lists are the queues:
//!
//! - `<prefix>.agt.<queueLocation>` — one durable inbox per agent,
//! - `<prefix>.agt.results` — results, share-consumed by schedulers,
//! - `<prefix>.agt.heartbeats` — heartbeats, share-consumed likewise,
//! - `<prefix>event.<topic>` — auxiliary event streams for workers.
//!
//! Consumption follows the reliable-queue pattern: `BLMOVE` into a
//! per-queue pending list, `LREM` on acknowledgement, and a re-drain of
//! the pending list after a restart. A delivery is therefore never lost
//! between pop and ack, at the price of possible redelivery; consumers
//! must be idempotent.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{Client, Connection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication to relay refused")]
    AuthFailed,
    #[error("relay channel closed: {0}")]
    ChannelClosed(String),
    #[error("publication dropped: {0}")]
    PublishDropped(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("tls material unreadable: {0}")]
    TlsMaterial(String),
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        use redis::ErrorKind;
        match e.kind() {
            ErrorKind::AuthenticationFailed => RelayError::AuthFailed,
            _ => RelayError::ChannelClosed(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay connection settings. TLS client material is applied when the
/// URL scheme is `rediss`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Upper bound on unacknowledged deliveries a consumer holds.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
}

fn default_prefix() -> String {
    "mig".to_string()
}

fn default_prefetch() -> usize {
    2
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RelayConfig {
            url: url.into(),
            prefix: default_prefix(),
            prefetch: default_prefetch(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }

    pub fn agent_inbox(&self, queue_location: &str) -> String {
        format!("{}.agt.{}", self.prefix, queue_location)
    }

    pub fn results_queue(&self) -> String {
        format!("{}.agt.results", self.prefix)
    }

    pub fn heartbeats_queue(&self) -> String {
        format!("{}.agt.heartbeats", self.prefix)
    }

    pub fn event_stream(&self, topic: &str) -> String {
        format!("{}event.{}", self.prefix, topic)
    }
}

/// Wire envelope: every publication carries its timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    ts: DateTime<Utc>,
    payload: serde_json::Value,
}

/// One consumed message plus the token needed to acknowledge it.
#[derive(Debug)]
pub struct Delivery<T> {
    pub payload: T,
    pub published: DateTime<Utc>,
    raw: String,
}

/// Capped exponential backoff used for every reconnection loop.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    delay: Duration,
}

pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

impl Backoff {
    pub fn new() -> Self {
        Backoff { delay: Duration::from_secs(1) }
    }

    /// Sleep for the current delay, then double it up to the cap.
    pub fn wait(&mut self) {
        std::thread::sleep(self.delay);
        self.delay = (self.delay * 2).min(BACKOFF_CAP);
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

pub struct RelayBus {
    cfg: RelayConfig,
    client: Client,
    conn: Mutex<Option<Connection>>,
}

impl RelayBus {
    /// Open the relay client. The underlying TCP connection is
    /// established lazily and re-established after failures.
    pub fn connect(cfg: RelayConfig) -> Result<Self> {
        let read = |p: &PathBuf| {
            fs::read(p).map_err(|e| RelayError::TlsMaterial(format!("{}: {e}", p.display())))
        };
        let client = match (&cfg.client_cert, cfg.url.starts_with("rediss://")) {
            (Some(cert_path), true) => {
                let client_cert = read(cert_path)?;
                let client_key = cfg
                    .client_key
                    .as_ref()
                    .map(read)
                    .transpose()?
                    .ok_or_else(|| RelayError::TlsMaterial("client_key missing".into()))?;
                let root_cert = cfg.ca_cert.as_ref().map(read).transpose()?;
                Client::build_with_tls(
                    cfg.url.clone(),
                    redis::TlsCertificates {
                        client_tls: Some(redis::ClientTlsConfig { client_cert, client_key }),
                        root_cert,
                    },
                )?
            }
            _ => Client::open(cfg.url.as_str())?,
        };
        Ok(RelayBus { cfg, client, conn: Mutex::new(None) })
    }

    /// Connect and verify reachability, retrying with capped backoff.
    /// With `budget = Some(n)`, gives up after n failed attempts (the
    /// agent's "broker unreachable" exit path); `None` retries forever.
    pub fn connect_verified(cfg: RelayConfig, budget: Option<u32>) -> Result<Self> {
        let bus = Self::connect(cfg)?;
        let mut backoff = Backoff::new();
        let mut attempts = 0u32;
        loop {
            match bus.ping() {
                Ok(()) => return Ok(bus),
                Err(RelayError::AuthFailed) => return Err(RelayError::AuthFailed),
                Err(e) => {
                    attempts += 1;
                    if let Some(max) = budget {
                        if attempts >= max {
                            return Err(e);
                        }
                    }
                    warn!(
                        attempt = attempts,
                        retry_in = ?backoff.current(),
                        "relay unreachable: {e}"
                    );
                    backoff.wait();
                }
            }
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.cfg
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| Ok(redis::cmd("PING").query::<String>(conn).map(|_| ())?))
    }

    /// Run an operation on the shared connection, opening a fresh one
    /// after a failure so the next call starts clean.
    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.client.get_connection()?);
            info!(url = %self.cfg.url, "relay connection established");
        }
        let conn = guard.as_mut().unwrap();
        match op(conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                // drop the broken connection; callers retry through backoff
                *guard = None;
                Err(e)
            }
        }
    }

    /// Publish a message to a queue. Errors map to `PublishDropped`; the
    /// caller decides whether to retry.
    pub fn publish<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let envelope = Envelope {
            ts: Utc::now(),
            payload: serde_json::to_value(message)
                .map_err(|e| RelayError::Serialization(e.to_string()))?,
        };
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        self.with_conn(|conn| {
            redis::cmd("RPUSH")
                .arg(queue)
                .arg(&raw)
                .query::<i64>(conn)
                .map(|_| ())
                .map_err(|e| RelayError::PublishDropped(e.to_string()))
        })
    }

    /// Publish, retrying transient failures forever with capped backoff.
    pub fn publish_retrying<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            match self.publish(queue, message) {
                Ok(()) => return Ok(()),
                Err(RelayError::Serialization(e)) => return Err(RelayError::Serialization(e)),
                Err(e) => {
                    warn!(queue, retry_in = ?backoff.current(), "publish failed: {e}");
                    backoff.wait();
                }
            }
        }
    }

    /// Blocking-pop one message into the queue's pending list. Returns
    /// `None` when `timeout` elapses with nothing to consume. The
    /// delivery stays in the pending list until acknowledged.
    pub fn consume<T: DeserializeOwned>(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery<T>>> {
        let pending = pending_key(queue);
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(redis::cmd("BLMOVE")
                .arg(queue)
                .arg(&pending)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout.as_secs_f64())
                .query(conn)?)
        })?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(decode_delivery(raw)?)),
        }
    }

    /// Acknowledge a delivery: remove it from the pending list. Safe to
    /// call twice; the second removal is a no-op.
    pub fn ack<T>(&self, queue: &str, delivery: &Delivery<T>) -> Result<()> {
        let pending = pending_key(queue);
        self.with_conn(|conn| {
            redis::cmd("LREM")
                .arg(&pending)
                .arg(1)
                .arg(&delivery.raw)
                .query::<i64>(conn)
                .map(|_| ())
                .map_err(RelayError::from)
        })
    }

    /// Deliveries left unacknowledged by a previous incarnation of this
    /// consumer. Called once at startup, before consuming fresh work.
    pub fn recover_pending<T: DeserializeOwned>(&self, queue: &str) -> Result<Vec<Delivery<T>>> {
        let pending = pending_key(queue);
        let raws: Vec<String> = self.with_conn(|conn| {
            Ok(redis::cmd("LRANGE").arg(&pending).arg(0).arg(-1).query(conn)?)
        })?;
        raws.into_iter().map(decode_delivery).collect()
    }

    /// Number of unacknowledged deliveries on a queue; consumers compare
    /// this against `prefetch` before pulling more work.
    pub fn pending_len(&self, queue: &str) -> Result<usize> {
        let pending = pending_key(queue);
        self.with_conn(|conn| Ok(redis::cmd("LLEN").arg(&pending).query::<usize>(conn)?))
    }

    /// Drop an agent's inbox and its pending list. Housekeeping for
    /// agents that went offline.
    pub fn delete_queue(&self, queue: &str) -> Result<()> {
        self.with_conn(|conn| {
            redis::cmd("DEL")
                .arg(queue)
                .arg(pending_key(queue))
                .query::<i64>(conn)
                .map(|_| ())
                .map_err(RelayError::from)
        })
    }

    pub fn queue_len(&self, queue: &str) -> Result<usize> {
        self.with_conn(|conn| Ok(redis::cmd("LLEN").arg(queue).query::<usize>(conn)?))
    }
}

fn pending_key(queue: &str) -> String {
    format!("{queue}.pending")
}

fn decode_delivery<T: DeserializeOwned>(raw: String) -> Result<Delivery<T>> {
    let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|e| RelayError::Serialization(e.to_string()))?;
    let payload = serde_json::from_value(envelope.payload)
        .map_err(|e| RelayError::Serialization(e.to_string()))?;
    Ok(Delivery { payload, published: envelope.ts, raw })
}
