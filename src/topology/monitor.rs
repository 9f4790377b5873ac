//! Background server discovery and monitoring using isMaster results.
use tracing::{debug, info};

use crate::apm::TopologyEvent;
use crate::connection::Connection;
use crate::connstring::Host;
use crate::error::Result;

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::server::{ServerDescription, ServerType};
use super::TopologyInner;

// Lets the topology interrupt a monitor's sleep.
#[derive(Default)]
struct Wake {
    requested: Mutex<bool>,
    condvar: Condvar,
}

impl Wake {
    fn notify(&self) {
        if let Ok(mut requested) = self.requested.lock() {
            *requested = true;
            self.condvar.notify_one();
        }
    }
}

/// The topology's handle on a monitor thread.
pub(crate) struct MonitorHandle {
    running: Arc<AtomicBool>,
    wake: Arc<Wake>,
    thread: JoinHandle<()>,
    // The process that spawned the thread. After a fork the child still holds
    // this handle, but the thread only exists in the parent.
    pid: u32,
}

impl MonitorHandle {
    pub(crate) fn is_alive(&self) -> bool {
        self.pid == process::id() && self.running.load(Ordering::SeqCst) && !self.thread.is_finished()
    }

    pub(crate) fn request_update(&self) {
        self.wake.notify();
    }

    /// Tells the thread to exit after its current check. Does not join, since
    /// the thread may be waiting on the lock held by the caller.
    pub(crate) fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify();
    }
}

/// Monitors and updates server and topology information.
struct Monitor {
    // Host being monitored.
    host: Host,
    topology: Weak<TopologyInner>,
    // Dedicated socket, separate from the server's pool.
    conn: Option<Connection>,
    wake: Arc<Wake>,
    /// While true, the monitor will check server health at the heartbeat
    /// frequency.
    running: Arc<AtomicBool>,
}

/// Spawns a monitor thread for `host`.
pub(crate) fn spawn(host: Host, topology: Weak<TopologyInner>) -> Result<MonitorHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let wake = Arc::new(Wake::default());

    let mut monitor = Monitor {
        host: host.clone(),
        topology: topology,
        conn: None,
        wake: wake.clone(),
        running: running.clone(),
    };

    let thread = thread::Builder::new()
        .name(format!("monitor-{}", host))
        .spawn(move || monitor.run())?;

    Ok(MonitorHandle {
        running: running,
        wake: wake,
        thread: thread,
        pid: process::id(),
    })
}

impl Monitor {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // Connects if needed and runs one handshake on the monitoring socket.
    fn execute_update(&mut self, topology: &TopologyInner) -> Result<ServerDescription> {
        let mut conn = match self.conn.take() {
            Some(conn) if !conn.is_closed() => conn,
            _ => {
                let transport = topology.connector.connect(&self.host, &topology.options)?;
                Connection::new(self.host.clone(), transport, 0)
            }
        };

        let start = Instant::now();
        let reply = conn.handshake()?;
        let round_trip_time = start.elapsed();
        self.conn = Some(conn);

        Ok(ServerDescription::from_is_master(
            self.host.clone(),
            &reply,
            round_trip_time,
        ))
    }

    // Runs one check and publishes the result. A failed check against a
    // server that was reachable is retried once before the server is marked
    // Unknown, and the server's pool is reset either way.
    fn check(&mut self, topology: &Arc<TopologyInner>) {
        let previous = topology
            .current()
            .server(&self.host)
            .map_or(ServerType::Unknown, |description| description.server_type);

        let description = match self.execute_update(topology) {
            Ok(description) => description,
            Err(err) => {
                debug!(host = %self.host, error = %err, "server check failed");
                topology.reset_pool(&self.host);
                if previous == ServerType::Unknown {
                    ServerDescription::unknown_with_error(self.host.clone(), err)
                } else {
                    match self.execute_update(topology) {
                        Ok(description) => description,
                        Err(err) => ServerDescription::unknown_with_error(self.host.clone(), err),
                    }
                }
            }
        };

        if self.is_running() {
            topology.apply(description);
        }
    }

    // Sleeps until the next heartbeat or an update request.
    fn wait(&self, frequency: Duration) {
        let deadline = Instant::now() + frequency;

        let mut requested = match self.wake.requested.lock() {
            Ok(requested) => requested,
            Err(_) => return,
        };

        while !*requested && self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            requested = match self.wake.condvar.wait_timeout(requested, deadline - now) {
                Ok((requested, _)) => requested,
                Err(_) => return,
            };
        }
        *requested = false;
    }

    /// Periodically checks the server until stopped or the topology goes away.
    fn run(&mut self) {
        info!(host = %self.host, "monitor started");
        if let Some(topology) = self.topology.upgrade() {
            topology.emit(TopologyEvent::MonitorStarted {
                host: self.host.clone(),
            });
        }

        while self.is_running() {
            let topology = match self.topology.upgrade() {
                Some(topology) => topology,
                None => break,
            };

            self.check(&topology);
            let frequency = topology.options.heartbeat_frequency;
            drop(topology);

            if !self.is_running() {
                break;
            }
            self.wait(frequency);
        }

        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }

        match self.topology.upgrade() {
            Some(topology) => topology.emit(TopologyEvent::MonitorStopped {
                host: self.host.clone(),
            }),
            None => debug!(host = %self.host, "topology dropped before its monitor stopped"),
        }
        info!(host = %self.host, "monitor stopped");
    }
}
