//! MongoDB server set topology and selection.
//!
//! A [`TopologyDescription`] is an immutable snapshot of every known server.
//! Monitors propose new [`ServerDescription`]s; [`TopologyInner::apply`]
//! computes the next snapshot from the current one under a single writer
//! lock, starts or stops servers whose membership changed, and swaps the
//! snapshot in atomically. Readers load the current snapshot without locking.
pub mod monitor;
pub mod selector;
pub mod server;

use arc_swap::ArcSwap;
use bson::oid;
use tracing::{debug, info, warn};

use crate::apm::{Listener, TopologyEvent};
use crate::connstring::Host;
use crate::error::Error::{self, AutoReconnect, Configuration};
use crate::error::Result;
use crate::options::ClientOptions;
use crate::pool::ConnectionPool;
use crate::transport::Connector;

use std::cmp;
use std::collections::HashMap;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use self::selector::ServerSelector;
use self::server::{Server, ServerDescription, ServerType};

// How often a blocked selection asks the monitors for an immediate check.
const MIN_HEARTBEAT_FREQUENCY_MS: u64 = 500;

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

impl FromStr for TopologyType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Single" => TopologyType::Single,
            "ReplicaSetNoPrimary" => TopologyType::ReplicaSetNoPrimary,
            "ReplicaSetWithPrimary" => TopologyType::ReplicaSetWithPrimary,
            "Sharded" => TopologyType::Sharded,
            _ => TopologyType::Unknown,
        })
    }
}

/// Topology information gathered from server set monitoring.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    /// The set name for a replica set topology.
    pub set_name: Option<String>,
    /// Known servers within the topology.
    pub servers: HashMap<Host, ServerDescription>,
    // The largest election id seen from a server in the topology.
    max_election_id: Option<oid::ObjectId>,
}

impl TopologyDescription {
    /// The description before any server has been checked: every seed is
    /// Unknown. A replica set name forces a replica set topology, and a
    /// single seed without one connects directly.
    pub fn new(seeds: &[Host], set_name: Option<String>) -> TopologyDescription {
        let topology_type = if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if seeds.len() == 1 {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        TopologyDescription {
            topology_type: topology_type,
            set_name: set_name,
            servers: seeds
                .iter()
                .map(|host| (host.clone(), ServerDescription::new(host.clone())))
                .collect(),
            max_election_id: None,
        }
    }

    pub fn server(&self, host: &Host) -> Option<&ServerDescription> {
        self.servers.get(host)
    }

    pub fn contains(&self, host: &Host) -> bool {
        self.servers.contains_key(host)
    }

    /// Every member, in host order.
    pub fn hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.servers.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Members of the given type, in host order.
    pub fn hosts_of_type(&self, server_type: ServerType) -> Vec<Host> {
        let mut hosts: Vec<Host> = self
            .servers
            .values()
            .filter(|server| server.server_type == server_type)
            .map(|server| server.host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|server| server.server_type == ServerType::RSPrimary)
    }

    /// Why servers are currently unusable, for selection errors.
    pub fn error_summary(&self) -> String {
        let mut errors: Vec<String> = self
            .servers
            .values()
            .filter_map(|server| server.error.as_ref().map(|err| format!("{}: {}", server.host, err)))
            .collect();
        errors.sort();
        if errors.is_empty() {
            format!("topology type is {:?}", self.topology_type)
        } else {
            errors.join(", ")
        }
    }

    /// Returns the snapshot that results from applying `description`.
    pub fn updated(&self, description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        next.update(description);
        next
    }

    /// Updates the topology description based on an updated server
    /// description. Descriptions of hosts that are no longer members are
    /// ignored.
    pub fn update(&mut self, description: ServerDescription) {
        let host = description.host.clone();
        if !self.servers.contains_key(&host) {
            return;
        }

        let stype = description.server_type;
        // A member that has not joined a set yet.
        let ghost = stype == ServerType::RSOther && description.set_name.is_none();
        self.servers.insert(host.clone(), description.clone());

        match self.topology_type {
            TopologyType::Unknown => match stype {
                ServerType::Standalone => self.update_unknown_with_standalone(&host),
                ServerType::Mongos => self.topology_type = TopologyType::Sharded,
                ServerType::RSPrimary => self.update_rs_from_primary(&host, &description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther if !ghost => {
                    self.update_rs_without_primary(&host, &description)
                }
                _ => (),
            },
            TopologyType::ReplicaSetNoPrimary => match stype {
                ServerType::Standalone | ServerType::Mongos => {
                    self.servers.remove(&host);
                    self.check_if_has_primary();
                }
                ServerType::RSPrimary => self.update_rs_from_primary(&host, &description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther if !ghost => {
                    self.update_rs_without_primary(&host, &description)
                }
                _ => self.check_if_has_primary(),
            },
            TopologyType::ReplicaSetWithPrimary => match stype {
                ServerType::Standalone | ServerType::Mongos => {
                    self.servers.remove(&host);
                    self.check_if_has_primary();
                }
                ServerType::RSPrimary => self.update_rs_from_primary(&host, &description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther if !ghost => {
                    self.update_rs_with_primary_from_member(&host, &description)
                }
                _ => self.check_if_has_primary(),
            },
            TopologyType::Sharded => match stype {
                ServerType::Unknown | ServerType::Mongos => (),
                _ => {
                    self.servers.remove(&host);
                }
            },
            TopologyType::Single => (),
        }
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.primary().is_some() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, host: &Host) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(host);
        }
    }

    fn set_name_matches(&mut self, description: &ServerDescription) -> bool {
        match self.set_name {
            None => {
                self.set_name = description.set_name.clone();
                true
            }
            Some(ref name) => description.set_name.as_ref() == Some(name),
        }
    }

    // Updates a replica set topology with a new primary server description.
    fn update_rs_from_primary(&mut self, host: &Host, description: &ServerDescription) {
        if !self.set_name_matches(description) {
            // Primary found, but it doesn't have the setName provided by the
            // user or previously discovered.
            self.servers.remove(host);
            self.check_if_has_primary();
            return;
        }

        if let Some(ref election_id) = description.election_id {
            let stale = match self.max_election_id {
                Some(ref max) => max.bytes() > election_id.bytes(),
                None => false,
            };
            if stale {
                debug!(host = %host, "ignoring primary with a stale election id");
                self.servers.insert(host.clone(), ServerDescription::new(host.clone()));
                self.check_if_has_primary();
                return;
            }
            self.max_election_id = Some(election_id.clone());
        }

        // Invalidate any old primaries.
        let old_primaries: Vec<Host> = self
            .servers
            .values()
            .filter(|server| server.host != *host && server.server_type == ServerType::RSPrimary)
            .map(|server| server.host.clone())
            .collect();
        for old in old_primaries {
            self.servers.insert(old.clone(), ServerDescription::new(old));
        }

        self.add_missing_hosts(description);

        // Remove hosts that are not reported by the primary.
        let reported: Vec<&Host> = description.all_hosts().collect();
        self.servers.retain(|member, _| reported.contains(&member));

        self.check_if_has_primary();
    }

    // Updates a replica set topology with a missing primary.
    fn update_rs_without_primary(&mut self, host: &Host, description: &ServerDescription) {
        self.topology_type = TopologyType::ReplicaSetNoPrimary;

        if !self.set_name_matches(description) {
            self.servers.remove(host);
            self.check_if_has_primary();
            return;
        }

        self.add_missing_hosts(description);

        if let Some(ref me) = description.me {
            if host != me {
                self.servers.remove(host);
                self.check_if_has_primary();
            }
        }
    }

    // Updates a replica set topology with an updated member description.
    fn update_rs_with_primary_from_member(&mut self, host: &Host, description: &ServerDescription) {
        if self.set_name != description.set_name {
            self.servers.remove(host);
            self.check_if_has_primary();
            return;
        }

        if let Some(ref me) = description.me {
            if host != me {
                self.servers.remove(host);
            }
        }

        self.check_if_has_primary();
    }

    // Adds every reported member that is not known yet.
    fn add_missing_hosts(&mut self, description: &ServerDescription) {
        for host in description.all_hosts() {
            if !self.servers.contains_key(host) {
                self.servers.insert(host.clone(), ServerDescription::new(host.clone()));
            }
        }
    }
}

/// Shared state behind a [`Topology`].
pub struct TopologyInner {
    seeds: Vec<Host>,
    pub(crate) options: ClientOptions,
    pub(crate) connector: Arc<dyn Connector>,
    listener: Arc<Listener>,
    description: ArcSwap<TopologyDescription>,
    // The single writer gate. Snapshots are only swapped while this is held.
    servers: Mutex<HashMap<Host, Server>>,
    // Signalled after every applied update.
    updated: Condvar,
    pid: AtomicU32,
    connected: AtomicBool,
}

impl TopologyInner {
    pub(crate) fn current(&self) -> Arc<TopologyDescription> {
        self.description.load_full()
    }

    pub(crate) fn emit(&self, event: TopologyEvent) {
        if let Err(err) = self.listener.run_topology_hooks(&event) {
            warn!(error = %err, "failed to run topology hooks");
        }
    }

    pub(crate) fn reset_pool(&self, host: &Host) {
        let pool = match self.servers.lock() {
            Ok(servers) => servers.get(host).map(|server| server.pool.clone()),
            Err(_) => None,
        };
        if let Some(pool) = pool {
            if let Err(err) = pool.reset() {
                warn!(host = %host, error = %err, "failed to reset pool");
            }
        }
    }

    fn start_server(self: &Arc<Self>, host: Host) -> Server {
        let pool = ConnectionPool::new(
            host.clone(),
            self.options.clone(),
            self.connector.clone(),
            self.listener.clone(),
        );
        let monitor = self.spawn_monitor(&host);
        Server::new(host, pool, monitor)
    }

    fn spawn_monitor(self: &Arc<Self>, host: &Host) -> Option<monitor::MonitorHandle> {
        match monitor::spawn(host.clone(), Arc::downgrade(self)) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(host = %host, error = %err, "failed to start monitor");
                None
            }
        }
    }

    /// Publishes a server description. This is the only place snapshots
    /// change, apart from `disconnect`.
    pub(crate) fn apply(self: &Arc<Self>, description: ServerDescription) {
        let host = description.host.clone();
        let mut events = Vec::new();

        let removed: Vec<Server> = {
            let mut servers = match self.servers.lock() {
                Ok(servers) => servers,
                Err(_) => return,
            };
            if !self.connected.load(Ordering::SeqCst) {
                return;
            }

            let current = self.current();
            let previous = current.server(&host).map(|server| server.server_type);
            let next = current.updated(description);

            if let (Some(previous), Some(new)) = (previous, next.server(&host).map(|server| server.server_type)) {
                if previous != new {
                    info!(host = %host, ?previous, ?new, "server description changed");
                    events.push(TopologyEvent::ServerDescriptionChanged {
                        host: host.clone(),
                        previous: previous,
                        new: new,
                    });
                }
            }
            if next.topology_type != current.topology_type {
                info!(from = ?current.topology_type, to = ?next.topology_type, "topology type changed");
            }

            for member in next.servers.keys() {
                if !servers.contains_key(member) {
                    debug!(host = %member, "discovered server");
                    let server = self.start_server(member.clone());
                    servers.insert(member.clone(), server);
                }
            }

            let gone: Vec<Host> = servers.keys().filter(|member| !next.contains(member)).cloned().collect();
            let removed = gone.iter().filter_map(|member| servers.remove(member)).collect();

            self.description.store(Arc::new(next));
            self.updated.notify_all();
            removed
        };

        for server in removed {
            info!(host = %server.host, "server removed from topology");
            server.stop_monitor();
            if let Err(err) = server.pool.close() {
                warn!(host = %server.host, error = %err, "failed to close pool");
            }
        }

        for event in events {
            self.emit(event);
        }
    }
}

/// Holds status and connection information about a server set.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Topology {
    /// Starts monitoring the seeds.
    pub fn new(
        seeds: Vec<Host>,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        listener: Arc<Listener>,
    ) -> Result<Topology> {
        let mut unique: Vec<Host> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if !unique.contains(&seed) {
                unique.push(seed);
            }
        }
        if unique.is_empty() {
            return Err(Configuration(String::from("At least one seed host is required.")));
        }

        let description = TopologyDescription::new(&unique, options.replica_set.clone());

        let inner = Arc::new(TopologyInner {
            seeds: unique,
            options: options,
            connector: connector,
            listener: listener,
            description: ArcSwap::from_pointee(description),
            servers: Mutex::new(HashMap::new()),
            updated: Condvar::new(),
            pid: AtomicU32::new(process::id()),
            connected: AtomicBool::new(true),
        });

        {
            let mut servers = inner.servers.lock()?;
            for seed in &inner.seeds {
                servers.insert(seed.clone(), inner.start_server(seed.clone()));
            }
        }

        Ok(Topology { inner: inner })
    }

    /// The current snapshot.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.current()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn seeds(&self) -> &[Host] {
        &self.inner.seeds
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.inner.listener
    }

    /// The pool for a current member.
    pub fn pool(&self, host: &Host) -> Option<ConnectionPool> {
        match self.inner.servers.lock() {
            Ok(servers) => servers.get(host).map(|server| server.pool.clone()),
            Err(_) => None,
        }
    }

    pub fn pools(&self) -> Result<Vec<ConnectionPool>> {
        Ok(self.inner.servers.lock()?.values().map(|server| server.pool.clone()).collect())
    }

    pub fn monitor_is_alive(&self, host: &Host) -> bool {
        match self.inner.servers.lock() {
            Ok(servers) => servers.get(host).map_or(false, Server::monitor_is_alive),
            Err(_) => false,
        }
    }

    /// Wakes the monitor of `host` for an immediate check.
    pub fn request_update(&self, host: &Host) {
        if let Ok(servers) = self.inner.servers.lock() {
            if let Some(server) = servers.get(host) {
                server.request_update();
            }
        }
    }

    /// Makes sure every member has a live monitor before an operation runs.
    ///
    /// A changed process id means this is a child after a fork: the monitor
    /// threads and the sockets belong to the parent, so every pool is reset
    /// and every monitor restarted. Otherwise only dead monitors, or those
    /// stopped by `disconnect`, are restarted.
    pub fn ensure_monitors(&self) -> Result<()> {
        let pid = process::id();
        let forked = self.inner.pid.swap(pid, Ordering::SeqCst) != pid;
        let reconnecting = !self.inner.connected.swap(true, Ordering::SeqCst);

        if forked {
            warn!(pid, "process id changed; resetting pools and restarting monitors");
        } else if reconnecting {
            info!("reconnecting after disconnect");
        }

        let mut stale_pools = Vec::new();
        {
            let servers = self.inner.servers.lock()?;
            for server in servers.values() {
                if forked {
                    stale_pools.push(server.pool.clone());
                }
                if forked || !server.monitor_is_alive() {
                    let mut monitor = server.monitor.lock()?;
                    if let Some(old) = monitor.take() {
                        old.stop();
                    }
                    if !forked && !reconnecting {
                        info!(host = %server.host, "restarting dead monitor");
                    }
                    *monitor = self.inner.spawn_monitor(&server.host);
                }
            }
        }

        for pool in stale_pools {
            pool.reset()?;
        }
        Ok(())
    }

    // Pretends the topology was created by another process.
    #[cfg(test)]
    fn set_pid(&self, pid: u32) {
        self.inner.pid.store(pid, Ordering::SeqCst);
    }

    /// Blocks until `selector` matches at least one server or `timeout`
    /// elapses, then fails with `AutoReconnect`.
    pub fn select_servers(&self, selector: &dyn ServerSelector, timeout: Duration) -> Result<Vec<Host>> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(MIN_HEARTBEAT_FREQUENCY_MS);
        let mut last_wake: Option<Instant> = None;

        let mut servers = self.inner.servers.lock()?;
        loop {
            let description = self.inner.current();
            let selected: Vec<Host> = selector
                .select(&description)
                .into_iter()
                .map(|server| server.host.clone())
                .collect();
            if !selected.is_empty() {
                return Ok(selected);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(?selector, "server selection timed out");
                return Err(AutoReconnect(format!(
                    "No server matching {:?} was found within {:?}: {}",
                    selector,
                    timeout,
                    description.error_summary()
                )));
            }

            if last_wake.map_or(true, |woken| now - woken >= poll) {
                for server in servers.values() {
                    server.request_update();
                }
                last_wake = Some(now);
            }

            let wait = cmp::min(deadline - now, poll);
            servers = self.inner.updated.wait_timeout(servers, wait)?.0;
        }
    }

    /// Marks `host` Unknown after a network error on one of its connections
    /// and resets its pool. Other members keep their descriptions.
    pub fn mark_unknown(&self, host: &Host, err: Error) {
        if !self.inner.current().contains(host) {
            return;
        }
        warn!(host = %host, error = %err, "marking server unknown");
        self.inner.apply(ServerDescription::unknown_with_error(host.clone(), err));
        self.inner.reset_pool(host);
        self.request_update(host);
    }

    /// Invalidates every pooled connection.
    pub fn reset(&self) -> Result<()> {
        for pool in self.pools()? {
            pool.reset()?;
        }
        Ok(())
    }

    /// Stops every monitor, resets every pool and forgets discovered members.
    /// The next operation restarts monitoring from the seeds. Calls after the
    /// first are no-ops until then.
    pub fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (kept, removed) = {
            let mut servers = self.inner.servers.lock()?;
            for server in servers.values() {
                server.stop_monitor();
            }

            let gone: Vec<Host> = servers
                .keys()
                .filter(|host| !self.inner.seeds.contains(host))
                .cloned()
                .collect();
            let removed: Vec<Server> = gone.iter().filter_map(|host| servers.remove(host)).collect();

            for seed in &self.inner.seeds {
                if !servers.contains_key(seed) {
                    let pool = ConnectionPool::new(
                        seed.clone(),
                        self.inner.options.clone(),
                        self.inner.connector.clone(),
                        self.inner.listener.clone(),
                    );
                    servers.insert(seed.clone(), Server::new(seed.clone(), pool, None));
                }
            }

            self.inner.description.store(Arc::new(TopologyDescription::new(
                &self.inner.seeds,
                self.inner.options.replica_set.clone(),
            )));
            self.inner.updated.notify_all();

            let kept: Vec<ConnectionPool> = servers.values().map(|server| server.pool.clone()).collect();
            (kept, removed)
        };

        for pool in kept {
            pool.reset()?;
        }
        for server in removed {
            server.pool.close()?;
        }
        info!("disconnected");
        Ok(())
    }
}
