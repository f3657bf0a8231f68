use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use core_models::{Command, Heartbeat};
use inquest_agent::dispatch::{Dispatcher, Disposition};
use inquest_agent::{environment, exit_code, stat, AgentConfig};
use module_runtime::Registry;
use relay_queue::{Backoff, RelayBus};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inquest-agent", about = "Endpoint investigation agent", version)]
struct Cli {
    /// Path to the agent configuration file (JSON).
    #[arg(short, long, default_value = "/etc/inquest/agent.json")]
    config: PathBuf,

    /// Run a single module locally instead of the agent loop, e.g.
    /// `--mode file path=/etc name=^passwd$`.
    #[arg(short, long)]
    mode: Option<String>,

    /// Parameters for `--mode`, as key=value pairs.
    #[arg(trailing_var_arg = true)]
    module_args: Vec<String>,
}

/// Install the subscriber the logging config asks for. `RUST_LOG` still
/// wins over the configured level when set.
fn init_tracing(logging: &inquest_agent::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    if logging.mode == "file" {
        if let Some(path) = &logging.file {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                    return;
                }
                Err(e) => eprintln!("log file {} unusable ({e}), using stdout", path.display()),
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.mode {
        Some(mode) => {
            init_tracing(&inquest_agent::LoggingConfig::default());
            run_module_mode(&mode, &cli.module_args)
        }
        None => run_agent(&cli.config),
    };
    ExitCode::from(code as u8)
}

/// Local module execution: parse parameters, run, print the envelope.
/// The development and packaging test path.
fn run_module_mode(mode: &str, args: &[String]) -> i32 {
    let registry = Registry::standard();
    let module = match registry.get(mode) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            return exit_code::CONFIG;
        }
    };
    let params = if args.is_empty() {
        module.default_params().unwrap_or(serde_json::Value::Null)
    } else {
        match module.params_from_args(args) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{e}");
                return exit_code::CONFIG;
            }
        }
    };
    let envelope = module.run(&params, &module_runtime::ModuleContext::default());
    match serde_json::to_string_pretty(&envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("cannot serialize envelope: {e}");
            return exit_code::CONFIG;
        }
    }
    exit_code::OK
}

fn run_agent(config_path: &std::path::Path) -> i32 {
    let cfg = match AgentConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e}");
            return exit_code::CONFIG;
        }
    };
    init_tracing(&cfg.logging);
    if cfg.must_install_service {
        info!("service supervision requested; deferring to the installed service manager");
    }

    let registry = Arc::new(Registry::standard());
    let acl = match trust_kernel::Acl::load(&cfg.acl) {
        Ok(acl) => acl,
        Err(e) => {
            error!("fatal: ACL unusable: {e}");
            return exit_code::CONFIG;
        }
    };
    let keyring = match trust_kernel::Keyring::load_dir(&cfg.agent_keys) {
        Ok(k) => k,
        Err(e) => {
            error!("fatal: keyring unusable: {e}");
            return exit_code::CONFIG;
        }
    };
    if keyring.is_empty() {
        error!("fatal: keyring is empty, no investigator could ever be trusted");
        return exit_code::CONFIG;
    }

    let hostname = environment::hostname();
    let queue_location = environment::derive_queue_location(&hostname);
    let env = environment::discover(&cfg, registry.names());
    info!(queue = %queue_location, os = %env.os, init = %env.init, "agent starting");

    let bus = match RelayBus::connect_verified(cfg.relay_config(), Some(cfg.relay_retry_budget)) {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!("relay unreachable after {} attempts: {e}", cfg.relay_retry_budget);
            return exit_code::RELAY_UNREACHABLE;
        }
    };

    let stat_state = Arc::new(stat::StatState::new(queue_location.clone(), registry.len()));
    if let Err(e) = stat::serve(&cfg.stat.bind, stat_state.clone()) {
        warn!("stat socket unavailable: {e}");
    }

    let started = Utc::now();
    let base_heartbeat = Heartbeat {
        name: hostname,
        queue_location: queue_location.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
        start_time: started,
        heartbeat_time: started,
        environment: env,
        tags: cfg.tags.clone(),
        destroyed: false,
    };

    let running = Arc::new(AtomicBool::new(true));
    spawn_heartbeat_timer(
        bus.clone(),
        base_heartbeat.clone(),
        cfg.heartbeat_freq(),
        stat_state,
        running.clone(),
    );

    let dispatcher = Dispatcher {
        acl,
        keyring,
        registry,
        module_timeout: cfg.module_timeout(),
        epm: cfg.extra_privacy_mode,
    };

    let code = consume_commands(&bus, &dispatcher, &queue_location, &base_heartbeat);
    running.store(false, Ordering::SeqCst);
    code
}

/// Publish a heartbeat immediately, then on every tick. Heartbeat times
/// never decrease, even if the wall clock does.
fn spawn_heartbeat_timer(
    bus: Arc<RelayBus>,
    base: Heartbeat,
    freq: Duration,
    stat_state: Arc<stat::StatState>,
    running: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        let queue = bus.config().heartbeats_queue();
        let mut last = base.start_time;
        while running.load(Ordering::SeqCst) {
            let mut hb = base.clone();
            hb.heartbeat_time = Utc::now().max(last);
            last = hb.heartbeat_time;
            match bus.publish(&queue, &hb) {
                Ok(()) => stat_state.record_heartbeat(hb.heartbeat_time),
                Err(e) => warn!("heartbeat publication failed: {e}"),
            }
            thread::sleep(freq);
        }
    });
}

/// The agent's main loop: recover unacked deliveries, then consume the
/// private inbox until destroyed.
fn consume_commands(
    bus: &RelayBus,
    dispatcher: &Dispatcher,
    queue_location: &str,
    base_heartbeat: &Heartbeat,
) -> i32 {
    let inbox = bus.config().agent_inbox(queue_location);
    let results_queue = bus.config().results_queue();

    match bus.recover_pending::<Command>(&inbox) {
        Ok(pending) => {
            for delivery in pending {
                if let Some(code) =
                    handle_delivery(bus, dispatcher, &inbox, &results_queue, base_heartbeat, delivery)
                {
                    return code;
                }
            }
        }
        Err(e) => warn!("inbox recovery failed: {e}"),
    }

    let mut backoff = Backoff::new();
    loop {
        match bus.consume::<Command>(&inbox, Duration::from_secs(5)) {
            Ok(None) => {}
            Ok(Some(delivery)) => {
                backoff = Backoff::new();
                if let Some(code) =
                    handle_delivery(bus, dispatcher, &inbox, &results_queue, base_heartbeat, delivery)
                {
                    return code;
                }
            }
            Err(e) => {
                warn!("inbox consumption failed: {e}");
                backoff.wait();
            }
        }
    }
}

/// Dispatch one delivery, publish the reply and acknowledge. Returns the
/// process exit code when the command was a destroy order.
fn handle_delivery(
    bus: &RelayBus,
    dispatcher: &Dispatcher,
    inbox: &str,
    results_queue: &str,
    base_heartbeat: &Heartbeat,
    delivery: relay_queue::Delivery<Command>,
) -> Option<i32> {
    let command = &delivery.payload;
    info!(command = %command.id, action = command.action_id, "command received");
    match dispatcher.process(command) {
        Disposition::Reply(reply) => {
            if let Err(e) = bus.publish_retrying(results_queue, &reply) {
                error!(command = %command.id, "result publication failed: {e}");
            }
            if let Err(e) = bus.ack(inbox, &delivery) {
                warn!(command = %command.id, "ack failed: {e}");
            }
            None
        }
        Disposition::Destroy(reply) => {
            if let Err(e) = bus.publish_retrying(results_queue, &reply) {
                error!(command = %command.id, "destroy result publication failed: {e}");
            }
            if let Err(e) = bus.ack(inbox, &delivery) {
                warn!(command = %command.id, "ack failed: {e}");
            }
            let mut final_hb = base_heartbeat.clone();
            final_hb.heartbeat_time = Utc::now();
            final_hb.destroyed = true;
            if let Err(e) = bus.publish_retrying(&bus.config().heartbeats_queue(), &final_hb) {
                warn!("final heartbeat failed: {e}");
            }
            info!("destroyed by upstream command, exiting");
            Some(exit_code::DESTROYED)
        }
    }
}
