//! The client entry point.
//!
//! Every operation selects a server from the current topology snapshot,
//! borrows a connection from that server's pool, replays cached credentials
//! the connection has not proven yet, runs, and returns the connection. A
//! network failure marks the server Unknown and resets its pool; a
//! server-reported failure leaves the connection in the pool.
use bson::{bson, doc, Document};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::apm::Listener;
use crate::auth::{Authenticator, Credential, CredentialCache};
use crate::connection::{next_request_id, reply_documents, Connection, DEFAULT_MAX_DOCUMENT_SIZE};
use crate::connstring::Host;
use crate::error::Error::{AutoReconnect, Configuration, Interrupted, OperationFailure};
use crate::error::Result;
use crate::exhaust::ExhaustCursor;
use crate::options::ClientOptions;
use crate::pool::{CallerId, ConnectionPool, PooledConnection};
use crate::stream::StreamConnector;
use crate::topology::selector::{AnyServer, ServerSelector, WritableServer};
use crate::topology::server::{ServerDescription, ServerType};
use crate::topology::{Topology, TopologyDescription};
use crate::transport::Connector;
use crate::wire_protocol::operations::DEFAULT_MAX_MESSAGE_SIZE;
use crate::wire_protocol::Message;

use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Upper bound on how long `alive` waits for a server.
const ALIVE_TIMEOUT_MS: u64 = 1_000;

/// Interfaces with a standalone server, replica set or sharded cluster.
///
/// Cloning is cheap; clones share the topology, pools and credentials.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    credentials: CredentialCache,
    authenticator: Option<Arc<dyn Authenticator>>,
    listener: Arc<Listener>,
    // Request depth per caller across all pools.
    requests: Mutex<HashMap<CallerId, usize>>,
}

/// Ends a request when dropped.
pub struct RequestGuard {
    client: Client,
    caller: CallerId,
}

impl RequestGuard {
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Err(err) = self.client.end_request(&self.caller) {
            warn!(error = %err, "failed to end request");
        }
    }
}

impl Client {
    /// Creates a client that connects over TCP to the given seeds.
    pub fn new(seeds: Vec<Host>, options: ClientOptions) -> Result<Client> {
        let connector = Arc::new(StreamConnector::from_options(&options));
        Client::build(seeds, options, connector, None)
    }

    /// Creates a client for a single server with default options.
    pub fn connect(host: &str, port: u16) -> Result<Client> {
        Client::new(vec![Host::new(host, port)], ClientOptions::default())
    }

    /// Creates a client that opens transports through `connector`.
    pub fn with_connector(
        seeds: Vec<Host>,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Client> {
        Client::build(seeds, options, connector, None)
    }

    /// `with_connector` plus the mechanism used to replay cached credentials.
    pub fn with_authenticator(
        seeds: Vec<Host>,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Client> {
        Client::build(seeds, options, connector, Some(authenticator))
    }

    fn build(
        seeds: Vec<Host>,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Client> {
        options.validate()?;
        let listener = Arc::new(Listener::new());
        let topology = Topology::new(seeds, options.clone(), connector, listener.clone())?;
        info!(seeds = ?topology.seeds(), "client created");

        Ok(Client {
            inner: Arc::new(ClientInner {
                topology: topology,
                options: options,
                credentials: CredentialCache::new(),
                authenticator: authenticator,
                listener: listener,
                requests: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The hooks notified of pool and topology events.
    pub fn listener(&self) -> &Arc<Listener> {
        &self.inner.listener
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Runs `op` on a connection to a server chosen by `selector`, after
    /// authenticating the connection for `db` if a credential is cached.
    pub fn execute<T, F>(
        &self,
        caller: Option<&CallerId>,
        selector: &dyn ServerSelector,
        db: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let host = self.select(selector, self.inner.options.server_selection_timeout)?;
        self.run_on(caller, &host, Some(db), op)
    }

    /// Runs `op` against a specific member. Fails with `AutoReconnect`
    /// without touching the network if `host` has left the topology.
    pub fn execute_on<T, F>(&self, caller: Option<&CallerId>, host: &Host, db: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        self.inner.topology.ensure_monitors()?;
        self.run_on(caller, host, Some(db), op)
    }

    /// Runs a command and returns its reply.
    pub fn command(
        &self,
        caller: Option<&CallerId>,
        selector: &dyn ServerSelector,
        db: &str,
        cmd: Document,
    ) -> Result<Document> {
        self.execute(caller, selector, db, |conn| conn.command(db, cmd))
    }

    fn select(&self, selector: &dyn ServerSelector, timeout: Duration) -> Result<Host> {
        self.inner.topology.ensure_monitors()?;
        let hosts = self.inner.topology.select_servers(selector, timeout)?;
        match hosts.choose(&mut rand::thread_rng()) {
            Some(host) => Ok(host.clone()),
            None => Err(AutoReconnect(format!("No server matching {:?} is available.", selector))),
        }
    }

    fn member_pool(&self, host: &Host) -> Result<ConnectionPool> {
        if !self.inner.topology.description().contains(host) {
            return Err(AutoReconnect(format!("{} is no longer a member of the topology.", host)));
        }
        match self.inner.topology.pool(host) {
            Some(pool) => Ok(pool),
            None => Err(AutoReconnect(format!("{} is no longer a member of the topology.", host))),
        }
    }

    fn run_on<T, F>(&self, caller: Option<&CallerId>, host: &Host, db: Option<&str>, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let pool = self.member_pool(host)?;
        let mut conn = self.checkout(&pool, caller, db)?;
        let result = op(&mut *conn);
        drop(conn);

        if let Err(ref err) = result {
            match *err {
                Interrupted(_) => debug!(host = %host, "operation interrupted"),
                ref err if err.is_network_error() => self.inner.topology.mark_unknown(host, err.clone()),
                _ => (),
            }
        }
        result
    }

    // Borrows a connection ready for `db`. A network failure while replaying
    // credentials discards the socket and tries once more on a fresh one.
    fn checkout(&self, pool: &ConnectionPool, caller: Option<&CallerId>, db: Option<&str>) -> Result<PooledConnection> {
        if let Some(caller) = caller {
            if self.in_request(caller)? && !pool.in_request(caller)? {
                pool.start_request(caller)?;
            }
        }

        let mut conn = pool.acquire(caller)?;
        match self.prepare(&mut conn, db) {
            Ok(()) => return Ok(conn),
            Err(ref err) if err.is_network_error() => {
                warn!(host = %pool.host, error = %err, "network error during authentication; retrying");
                conn.discard();
            }
            Err(err) => return Err(err),
        }

        let mut conn = pool.acquire(caller)?;
        match self.prepare(&mut conn, db) {
            Ok(()) => Ok(conn),
            Err(ref err) if err.is_network_error() => {
                conn.discard();
                Err(AutoReconnect(format!(
                    "Could not authenticate to {}: {}",
                    pool.host, err
                )))
            }
            Err(err) => Err(err),
        }
    }

    // Drops authentications the client no longer holds and proves the cached
    // credential for `db`.
    fn prepare(&self, conn: &mut Connection, db: Option<&str>) -> Result<()> {
        let authenticator = match self.inner.authenticator {
            Some(ref authenticator) => authenticator,
            None => return Ok(()),
        };
        let cached = self.inner.credentials.snapshot()?;

        for name in conn.authenticated_dbs() {
            let current = match cached.get(&name) {
                Some(credential) => conn.is_authenticated(&name, credential),
                None => false,
            };
            if !current {
                debug!(host = %conn.host(), db = %name, "logging out stale authentication");
                authenticator.logout(conn, &name)?;
                conn.remove_authenticated(&name);
            }
        }

        if let Some(db) = db {
            if let Some(credential) = cached.get(db) {
                if !conn.is_authenticated(db, credential) {
                    debug!(host = %conn.host(), db, "replaying cached credential");
                    authenticator.authenticate(conn, db, credential)?;
                    conn.add_authenticated(db, credential.clone());
                }
            }
        }
        Ok(())
    }

    /// Starts or nests a request. While inside one, every operation `caller`
    /// issues against a server reuses the same connection to that server.
    pub fn start_request(&self, caller: &CallerId) -> Result<()> {
        let mut requests = self.inner.requests.lock()?;
        *requests.entry(*caller).or_insert(0) += 1;
        Ok(())
    }

    /// Ends one level of `caller`'s request. Ending the outermost level
    /// returns every pinned connection to its pool.
    pub fn end_request(&self, caller: &CallerId) -> Result<()> {
        {
            let mut requests = self.inner.requests.lock()?;
            let depth = match requests.get_mut(caller) {
                Some(depth) => {
                    *depth -= 1;
                    *depth
                }
                None => return Ok(()),
            };
            if depth > 0 {
                return Ok(());
            }
            requests.remove(caller);
        }

        for pool in self.inner.topology.pools()? {
            if pool.in_request(caller)? {
                pool.end_request(caller)?;
            }
        }
        Ok(())
    }

    pub fn in_request(&self, caller: &CallerId) -> Result<bool> {
        Ok(self.inner.requests.lock()?.contains_key(caller))
    }

    /// Starts a request that ends when the guard is dropped.
    pub fn request(&self, caller: &CallerId) -> Result<RequestGuard> {
        self.start_request(caller)?;
        Ok(RequestGuard {
            client: self.clone(),
            caller: *caller,
        })
    }

    /// Starts an exhaust query on `namespace` (`<db>.<collection>`).
    pub fn exhaust_query(
        &self,
        selector: &dyn ServerSelector,
        namespace: &str,
        query: Document,
        batch_size: i32,
    ) -> Result<ExhaustCursor> {
        let host = self.select(selector, self.inner.options.server_selection_timeout)?;
        let pool = self.member_pool(&host)?;
        let conn = self.checkout(&pool, None, Some(database_of(namespace)))?;
        ExhaustCursor::open(
            conn,
            namespace.to_owned(),
            query,
            batch_size,
            self.inner.topology.clone(),
        )
    }

    /// Fetches the next batch of a cursor from the server that owns it.
    /// Returns the cursor id to continue with, zero once exhausted.
    pub fn get_more(
        &self,
        caller: Option<&CallerId>,
        host: &Host,
        namespace: &str,
        cursor_id: i64,
        number_to_return: i32,
    ) -> Result<(i64, Vec<Document>)> {
        self.inner.topology.ensure_monitors()?;
        self.run_on(caller, host, Some(database_of(namespace)), |conn| {
            let message = Message::new_get_more(
                next_request_id(),
                namespace.to_owned(),
                number_to_return,
                cursor_id,
            );
            let reply = conn.request(&message)?;
            reply_documents(reply, cursor_id)
        })
    }

    /// Tells `host` to free the given cursors.
    pub fn kill_cursors(&self, cursor_ids: &[i64], host: &Host) -> Result<()> {
        if cursor_ids.is_empty() {
            return Ok(());
        }
        self.inner.topology.ensure_monitors()?;
        self.run_on(None, host, None, |conn| {
            conn.send(&Message::new_kill_cursors(next_request_id(), cursor_ids.to_vec()))
        })
    }

    /// Caches `credential` for `db` and proves it on a connection right away.
    /// A rejected credential is removed from the cache again.
    pub fn authenticate(&self, db: &str, credential: Credential) -> Result<()> {
        self.cache_credential(db, credential)?;
        match self.execute(None, &AnyServer, db, |_| Ok(())) {
            Err(err @ OperationFailure { .. }) => {
                self.inner.credentials.remove(db)?;
                Err(err)
            }
            result => result,
        }
    }

    /// Caches `credential` for `db`. Connections prove it the first time they
    /// are used for `db`.
    pub fn cache_credential(&self, db: &str, credential: Credential) -> Result<()> {
        if self.inner.authenticator.is_none() {
            return Err(Configuration(String::from(
                "Authentication requires a client created with an authenticator.",
            )));
        }
        self.inner.credentials.insert(db, credential)
    }

    /// Forgets the credential for `db`. Connections drop the authentication
    /// the next time they are used.
    pub fn logout(&self, db: &str) -> Result<()> {
        self.inner.credentials.remove(db)?;
        Ok(())
    }

    /// Stops monitoring, closes every pooled connection and forgets
    /// discovered members. The next operation reconnects from the seeds.
    pub fn disconnect(&self) -> Result<()> {
        self.inner.topology.disconnect()
    }

    /// Closes every pooled connection without touching the topology.
    pub fn reset(&self) -> Result<()> {
        self.inner.topology.reset()
    }

    /// The current topology snapshot.
    pub fn topology_description(&self) -> Arc<TopologyDescription> {
        self.inner.topology.description()
    }

    /// Every known member.
    pub fn nodes(&self) -> Vec<Host> {
        self.topology_description().hosts()
    }

    pub fn primary(&self) -> Option<Host> {
        self.topology_description()
            .primary()
            .map(|server| server.host.clone())
    }

    pub fn secondaries(&self) -> Vec<Host> {
        self.topology_description()
            .hosts_of_type(ServerType::RSSecondary)
    }

    pub fn arbiters(&self) -> Vec<Host> {
        self.topology_description()
            .hosts_of_type(ServerType::RSArbiter)
    }

    /// Whether writes go to a standalone server or a replica set primary.
    /// Waits for a writable server like any write would.
    pub fn is_primary(&self) -> Result<bool> {
        let server_type = self.writable_description()?.server_type;
        Ok(server_type == ServerType::Standalone || server_type == ServerType::RSPrimary)
    }

    /// Whether writes go to a shard router.
    pub fn is_mongos(&self) -> Result<bool> {
        Ok(self.writable_description()?.server_type == ServerType::Mongos)
    }

    fn writable_description(&self) -> Result<ServerDescription> {
        let host = self.select(&WritableServer, self.inner.options.server_selection_timeout)?;
        match self.topology_description().server(&host) {
            Some(description) => Ok(description.clone()),
            None => Err(AutoReconnect(format!("{} is no longer a member of the topology.", host))),
        }
    }

    // The writable server in the current snapshot, if there is one.
    fn current_writable(&self) -> Option<ServerDescription> {
        let description = self.topology_description();
        let writable = WritableServer.select(&description);
        writable.first().map(|server| (*server).clone())
    }

    /// Largest document the writable server accepts.
    pub fn max_bson_size(&self) -> i32 {
        self.current_writable()
            .map_or(DEFAULT_MAX_DOCUMENT_SIZE, |server| server.max_document_size)
    }

    /// Largest message the writable server accepts.
    pub fn max_message_size(&self) -> i32 {
        self.current_writable()
            .map_or(DEFAULT_MAX_MESSAGE_SIZE, |server| server.max_message_size)
    }

    pub fn min_wire_version(&self) -> i64 {
        self.current_writable().map_or(0, |server| server.min_wire_version)
    }

    pub fn max_wire_version(&self) -> i64 {
        self.current_writable().map_or(0, |server| server.max_wire_version)
    }

    /// Whether some server answers a handshake right now.
    pub fn alive(&self) -> bool {
        let timeout = cmp::min(
            self.inner.options.server_selection_timeout,
            Duration::from_millis(ALIVE_TIMEOUT_MS),
        );
        let host = match self.select(&AnyServer, timeout) {
            Ok(host) => host,
            Err(_) => return false,
        };
        self.run_on(None, &host, None, |conn| conn.command("admin", doc! { "ismaster": 1 }))
            .is_ok()
    }

    /// The pool of a current member.
    pub fn pool(&self, host: &Host) -> Option<ConnectionPool> {
        self.inner.topology.pool(host)
    }

    pub fn monitor_is_alive(&self, host: &Host) -> bool {
        self.inner.topology.monitor_is_alive(host)
    }
}

// The database part of `<db>.<collection>`.
fn database_of(namespace: &str) -> &str {
    match namespace.find('.') {
        Some(index) => &namespace[..index],
        None => namespace,
    }
}
