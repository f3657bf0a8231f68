//! Loopback stat socket: a plain-text `key=value` snapshot served to the
//! service supervisor and curious operators.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub struct StatState {
    pub pid: u32,
    pub started: Instant,
    pub queue_location: String,
    pub module_count: usize,
    pub heartbeat_time: Mutex<DateTime<Utc>>,
}

impl StatState {
    pub fn new(queue_location: String, module_count: usize) -> Self {
        StatState {
            pid: std::process::id(),
            started: Instant::now(),
            queue_location,
            module_count,
            heartbeat_time: Mutex::new(Utc::now()),
        }
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        let mut guard = self.heartbeat_time.lock().unwrap();
        if at > *guard {
            *guard = at;
        }
    }

    fn snapshot(&self) -> String {
        let heartbeat = *self.heartbeat_time.lock().unwrap();
        format!(
            "pid={}\nuptime={}\nheartbeatTime={}\nqueueLocation={}\nmoduleCount={}\n",
            self.pid,
            self.started.elapsed().as_secs(),
            heartbeat.to_rfc3339(),
            self.queue_location,
            self.module_count,
        )
    }
}

fn handle_client(mut stream: TcpStream, state: &StatState) {
    let snapshot = state.snapshot();
    if let Err(e) = stream.write_all(snapshot.as_bytes()) {
        warn!("stat client write failed: {e}");
    }
}

/// Bind the stat listener and serve snapshots until the process exits.
/// Returns the bound address, which matters when the config asks for
/// port 0.
pub fn serve(bind: &str, state: std::sync::Arc<StatState>) -> std::io::Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(bind)?;
    let addr = listener.local_addr()?;
    info!(%addr, "stat socket listening");
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => handle_client(stream, &state),
                Err(e) => warn!("stat accept failed: {e}"),
            }
        }
    });
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;

    #[test]
    fn snapshot_is_served_over_tcp() {
        let state = Arc::new(StatState::new("linux.host1.abc".into(), 3));
        let addr = serve("127.0.0.1:0", state.clone()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();

        assert!(body.contains(&format!("pid={}\n", std::process::id())));
        assert!(body.contains("queueLocation=linux.host1.abc\n"));
        assert!(body.contains("moduleCount=3\n"));
        assert!(body.contains("heartbeatTime="));
    }

    #[test]
    fn heartbeat_time_is_monotonic() {
        let state = StatState::new("q".into(), 0);
        let t1 = Utc::now();
        state.record_heartbeat(t1);
        state.record_heartbeat(t1 - chrono::Duration::seconds(30));
        assert_eq!(*state.heartbeat_time.lock().unwrap(), t1);
    }
}
