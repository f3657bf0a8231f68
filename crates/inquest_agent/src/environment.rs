//! Startup environment discovery: what this endpoint is and how it is
//! reachable, advertised in every heartbeat.

use std::net::UdpSocket;
use std::time::Duration;

use core_models::AgentEnvironment;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::AgentConfig;

/// Length of the random queue-location suffix.
const SUFFIX_LEN: usize = 24;

pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Derive a fresh private queue location:
/// `<os>.<hostname>.<24-char-random>`. A new suffix on every start keeps
/// a respawned agent from consuming its predecessor's inbox.
pub fn derive_queue_location(host: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}.{}.{}", std::env::consts::OS, host, suffix)
}

fn detect_init() -> String {
    match std::fs::read_to_string("/proc/1/comm") {
        Ok(comm) => match comm.trim() {
            "systemd" => "systemd".to_string(),
            "init" => "sysvinit".to_string(),
            other => other.to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

fn detect_ident() -> String {
    if let Ok(release) = std::fs::read_to_string("/etc/os-release") {
        for line in release.lines() {
            if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
                return value.trim_matches('"').to_string();
            }
        }
    }
    std::env::consts::OS.to_string()
}

/// The primary local address, discovered by the routing table rather
/// than by enumerating interfaces.
fn local_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("203.0.113.1:53").ok()?;
    socket.local_addr().ok().map(|a| a.ip().to_string())
}

/// Ask the public API what address we appear from. Best effort; agents
/// behind locked-down egress simply report none.
fn discover_public_ip(api: &str) -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;
    let url = format!("{}/ip", api.trim_end_matches('/'));
    match client.get(&url).send().and_then(|r| r.text()) {
        Ok(body) => {
            let ip = body.trim().to_string();
            if ip.parse::<std::net::IpAddr>().is_ok() {
                Some(ip)
            } else {
                None
            }
        }
        Err(e) => {
            debug!("public ip discovery failed: {e}");
            None
        }
    }
}

fn proxy_in_use(cfg: &AgentConfig) -> Option<String> {
    cfg.proxies
        .first()
        .cloned()
        .or_else(|| std::env::var("HTTP_PROXY").ok())
}

/// Full environment discovery, run once at startup.
pub fn discover(cfg: &AgentConfig, advertised_modules: Vec<String>) -> AgentEnvironment {
    let proxy_url = proxy_in_use(cfg);
    AgentEnvironment {
        init: detect_init(),
        ident: detect_ident(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        is_proxied: proxy_url.is_some(),
        proxy_url,
        addresses: local_address().into_iter().collect(),
        public_ip: cfg.api.as_deref().and_then(discover_public_ip),
        modules: advertised_modules,
    }
}
