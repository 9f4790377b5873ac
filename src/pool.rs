//! Connection pooling for a single MongoDB server.
//!
//! Admission is a counting semaphore of `max_pool_size` permits kept under the
//! same lock as the idle set. A permit is held by every borrowed connection,
//! every connection being opened, and every connection parked in a request
//! slot, so `in_use + idle` never exceeds the pool size. Callers that find no
//! permit wait on a condvar for at most the wait queue timeout; at most
//! `max_pool_size * wait_queue_multiple` of them may wait at once.
use tracing::{debug, info, warn};

use crate::apm::{CloseReason, Listener, PoolEvent};
use crate::connection::Connection;
use crate::connstring::Host;
use crate::error::Error::{AutoReconnect, ConnectionFailure};
use crate::error::Result;
use crate::options::ClientOptions;
use crate::transport::Connector;

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a logical caller for request affinity.
///
/// Callers create one per thread or task and pass it to every operation that
/// should observe the same socket inside a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

impl CallerId {
    pub fn new() -> CallerId {
        CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for CallerId {
    fn default() -> Self {
        CallerId::new()
    }
}

/// Handles threaded connections to a MongoDB server.
#[derive(Clone)]
pub struct ConnectionPool {
    /// The connection host.
    pub host: Host,
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .finish()
    }
}

struct PoolInner {
    host: Host,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    listener: Arc<Listener>,
    state: Mutex<PoolState>,
    // Signalled whenever a permit or an idle connection becomes available.
    wait_lock: Condvar,
}

struct PoolState {
    idle: Vec<Connection>,
    // Permits currently held.
    in_use: usize,
    waiters: usize,
    // Bumped on every reset; connections from older generations are discarded
    // when they come back.
    generation: u64,
    requests: HashMap<CallerId, RequestSlot>,
    closed: bool,
}

struct RequestSlot {
    depth: usize,
    // The pinned connection while nobody is using it. Its permit stays held.
    conn: Option<Connection>,
    borrowed: bool,
}

/// Holds a borrowed connection and returns it to the pool when dropped.
pub struct PooledConnection {
    // Always Some until drop.
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    pinned_to: Option<CallerId>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pinned_to", &self.pinned_to)
            .finish()
    }
}

impl PooledConnection {
    /// Whether this connection is pinned to a caller's request.
    pub fn is_pinned(&self) -> bool {
        self.pinned_to.is_some()
    }

    /// Closes the connection so that dropping it discards it instead of
    /// returning it to the idle set.
    pub fn discard(mut self) {
        if let Some(ref mut conn) = self.conn {
            conn.close();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.pinned_to);
        }
    }
}

impl PoolInner {
    fn lock(&self) -> Result<MutexGuard<PoolState>> {
        Ok(self.state.lock()?)
    }

    fn emit(&self, event: PoolEvent) {
        if let Err(err) = self.listener.run_pool_hooks(&event) {
            warn!(host = %self.host, error = %err, "failed to run pool hooks");
        }
    }

    fn emit_closed(&self, conn: &Connection, reason: CloseReason) {
        self.emit(PoolEvent::ConnectionClosed {
            host: self.host.clone(),
            connection_id: conn.id(),
            reason: reason,
        });
    }

    // Returns a connection and, unless it moves into a request slot, its
    // permit. Runs exactly once per borrowed connection.
    fn check_in(&self, mut conn: Connection, pinned_to: Option<CallerId>) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                conn.close();
                return;
            }
        };

        let reason = if conn.is_closed() {
            Some(CloseReason::Error)
        } else if conn.generation() != state.generation {
            Some(CloseReason::Stale)
        } else if state.closed {
            Some(CloseReason::PoolClosed)
        } else {
            None
        };

        if let Some(caller) = pinned_to {
            if let Some(slot) = state.requests.get_mut(&caller) {
                slot.borrowed = false;
                if reason.is_none() {
                    slot.conn = Some(conn);
                    return;
                }
            }
        }

        match reason {
            None => {
                conn.mark_idle();
                state.idle.push(conn);
                state.in_use -= 1;
                self.wait_lock.notify_one();
            }
            Some(reason) => {
                // The permit comes back only once the socket is gone.
                conn.close();
                state.in_use -= 1;
                self.wait_lock.notify_one();
                drop(state);
                debug!(host = %self.host, connection_id = conn.id(), ?reason, "discarded connection");
                self.emit_closed(&conn, reason);
            }
        }
    }

    // Releases a permit whose connection never materialized.
    fn release_permit(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_use -= 1;
            self.wait_lock.notify_one();
        }
    }
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are opened lazily.
    pub fn new(
        host: Host,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        listener: Arc<Listener>,
    ) -> ConnectionPool {
        ConnectionPool {
            host: host.clone(),
            inner: Arc::new(PoolInner {
                host: host,
                options: options,
                connector: connector,
                listener: listener,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    waiters: 0,
                    generation: 0,
                    requests: HashMap::new(),
                    closed: false,
                }),
                wait_lock: Condvar::new(),
            }),
        }
    }

    /// Maximum number of connections, idle and borrowed together.
    pub fn max_size(&self) -> usize {
        self.inner.options.max_pool_size
    }

    /// Maximum number of callers allowed to wait for a permit.
    pub fn max_waiters(&self) -> Option<usize> {
        self.inner.options.max_waiters()
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.inner.lock()?.generation)
    }

    /// Permits currently held by borrowers, openers and request slots.
    pub fn in_use(&self) -> Result<usize> {
        Ok(self.inner.lock()?.in_use)
    }

    pub fn idle_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.idle.len())
    }

    pub fn idle_connection_ids(&self) -> Result<Vec<u64>> {
        Ok(self.inner.lock()?.idle.iter().map(Connection::id).collect())
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.inner.lock()?.closed)
    }

    /// Borrows a connection.
    ///
    /// A caller inside a request gets its pinned connection back. Otherwise
    /// this waits for a permit, reuses the most recently returned idle
    /// connection, or opens and handshakes a new one.
    pub fn acquire(&self, caller: Option<&CallerId>) -> Result<PooledConnection> {
        let mut state = self.inner.lock()?;
        if state.closed {
            return Err(AutoReconnect(format!("{} is no longer a known server", self.host)));
        }

        let mut pin = None;
        if let Some(caller) = caller {
            if let Some(slot) = state.requests.get_mut(caller) {
                if !slot.borrowed {
                    if let Some(conn) = slot.conn.take() {
                        slot.borrowed = true;
                        return Ok(self.wrap(conn, Some(*caller)));
                    }
                    slot.borrowed = true;
                    pin = Some(*caller);
                }
            }
        }

        match self.admit(state, pin) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                if let Some(caller) = pin {
                    if let Ok(mut state) = self.inner.lock() {
                        if let Some(slot) = state.requests.get_mut(&caller) {
                            slot.borrowed = false;
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn wrap(&self, conn: Connection, pinned_to: Option<CallerId>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            pinned_to: pinned_to,
        }
    }

    fn admit(&self, state: MutexGuard<PoolState>, pin: Option<CallerId>) -> Result<PooledConnection> {
        let mut expired = Vec::new();
        let result = self.admit_locked(state, pin, &mut expired);
        for conn in expired {
            self.inner.emit_closed(&conn, CloseReason::Idle);
        }
        result
    }

    fn admit_locked(
        &self,
        mut state: MutexGuard<PoolState>,
        pin: Option<CallerId>,
        expired: &mut Vec<Connection>,
    ) -> Result<PooledConnection> {
        let timeout = self.inner.options.effective_wait_queue_timeout();
        let deadline = Instant::now() + timeout;
        let max = self.inner.options.max_pool_size;

        loop {
            if state.closed {
                return Err(AutoReconnect(format!("{} is no longer a known server", self.host)));
            }

            // Reuse an idle connection.
            while let Some(mut conn) = state.idle.pop() {
                let is_expired = match self.inner.options.max_idle_time {
                    Some(max_idle) => conn.idle_time() >= max_idle,
                    None => false,
                };
                if is_expired {
                    conn.close();
                    debug!(host = %self.host, connection_id = conn.id(), "closed idle connection");
                    expired.push(conn);
                    continue;
                }
                state.in_use += 1;
                return Ok(self.wrap(conn, pin));
            }

            // Attempt to make a new connection.
            if state.in_use < max {
                state.in_use += 1;
                let generation = state.generation;
                drop(state);
                return self.open(generation, pin);
            }

            if let Some(max_waiters) = self.inner.options.max_waiters() {
                if state.waiters >= max_waiters {
                    return Err(ConnectionFailure(format!(
                        "Too many threads are already waiting for a connection to {}; max number of threads ({}) exceeded.",
                        self.host, max_waiters
                    )));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionFailure(format!(
                    "Timed out waiting for a connection to {} after {:?}.",
                    self.host, timeout
                )));
            }

            // Release lock and wait for a permit to be returned.
            state.waiters += 1;
            let (locked, _) = self.inner.wait_lock.wait_timeout(state, deadline - now)?;
            state = locked;
            state.waiters -= 1;
        }
    }

    // Opens and handshakes a connection for a permit that is already held.
    fn open(&self, generation: u64, pin: Option<CallerId>) -> Result<PooledConnection> {
        let transport = match self.inner.connector.connect(&self.host, &self.inner.options) {
            Ok(transport) => transport,
            Err(err) => {
                self.inner.release_permit();
                debug!(host = %self.host, error = %err, "failed to open connection");
                return Err(err);
            }
        };

        let mut conn = Connection::new(self.host.clone(), transport, generation);
        if let Err(err) = conn.handshake() {
            conn.close();
            self.inner.release_permit();
            debug!(host = %self.host, error = %err, "connection handshake failed");
            return Err(err);
        }

        debug!(host = %self.host, connection_id = conn.id(), generation, "opened connection");
        self.inner.emit(PoolEvent::ConnectionCreated {
            host: self.host.clone(),
            connection_id: conn.id(),
        });

        Ok(self.wrap(conn, pin))
    }

    /// Starts or nests a request for `caller`. The first connection the
    /// caller borrows afterwards stays pinned to it until the outermost
    /// `end_request`.
    pub fn start_request(&self, caller: &CallerId) -> Result<()> {
        let mut state = self.inner.lock()?;
        let slot = state.requests.entry(*caller).or_insert(RequestSlot {
            depth: 0,
            conn: None,
            borrowed: false,
        });
        slot.depth += 1;
        Ok(())
    }

    /// Ends one level of `caller`'s request. Ending the outermost level
    /// returns the pinned connection to the idle set.
    pub fn end_request(&self, caller: &CallerId) -> Result<()> {
        let mut state = self.inner.lock()?;
        let done = match state.requests.get_mut(caller) {
            Some(slot) => {
                slot.depth -= 1;
                slot.depth == 0
            }
            None => false,
        };

        if !done {
            return Ok(());
        }

        if let Some(slot) = state.requests.remove(caller) {
            // A borrowed pinned connection comes back through the normal path.
            if let Some(mut conn) = slot.conn {
                state.in_use -= 1;
                conn.mark_idle();
                state.idle.push(conn);
                self.inner.wait_lock.notify_one();
            }
        }
        Ok(())
    }

    pub fn in_request(&self, caller: &CallerId) -> Result<bool> {
        Ok(self.inner.lock()?.requests.contains_key(caller))
    }

    /// Invalidates every connection. Idle and parked connections are closed
    /// now; borrowed ones are discarded when they come back. Request depths
    /// survive, so callers inside a request pin a fresh connection next time.
    pub fn reset(&self) -> Result<()> {
        let (closed, generation) = {
            let mut state = self.inner.lock()?;
            state.generation += 1;
            let mut closed: Vec<Connection> = state.idle.drain(..).collect();
            let mut released = 0;
            for slot in state.requests.values_mut() {
                if let Some(conn) = slot.conn.take() {
                    closed.push(conn);
                    released += 1;
                }
            }
            for conn in closed.iter_mut() {
                conn.close();
            }
            state.in_use -= released;
            self.inner.wait_lock.notify_all();
            (closed, state.generation)
        };

        info!(host = %self.host, generation, "pool reset");
        for conn in closed {
            self.inner.emit_closed(&conn, CloseReason::PoolClosed);
        }
        self.inner.emit(PoolEvent::PoolCleared {
            host: self.host.clone(),
            generation: generation,
        });
        Ok(())
    }

    /// Resets the pool and refuses further acquisitions. Used when the
    /// server leaves the topology.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.reset()
    }
}
