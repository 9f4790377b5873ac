use std::fmt::{Display, Error, Formatter};

use crate::connstring::Host;
use crate::topology::server::ServerType;

/// Why a connection left its pool for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection saw a network or protocol failure.
    Error,
    /// The pool was reset after the connection was checked out.
    Stale,
    /// The connection sat idle longer than `max_idle_time`.
    Idle,
    /// The pool was reset or closed.
    PoolClosed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PoolEvent {
    ConnectionCreated {
        host: Host,
        connection_id: u64,
    },
    ConnectionClosed {
        host: Host,
        connection_id: u64,
        reason: CloseReason,
    },
    PoolCleared {
        host: Host,
        generation: u64,
    },
}

impl Display for PoolEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            PoolEvent::ConnectionCreated { ref host, connection_id } => {
                write!(fmt, "POOL {} CONNECTION {} CREATED", host, connection_id)
            }
            PoolEvent::ConnectionClosed { ref host, connection_id, reason } => {
                write!(fmt, "POOL {} CONNECTION {} CLOSED ({:?})", host, connection_id, reason)
            }
            PoolEvent::PoolCleared { ref host, generation } => {
                write!(fmt, "POOL {} CLEARED (generation {})", host, generation)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEvent {
    ServerDescriptionChanged {
        host: Host,
        previous: ServerType,
        new: ServerType,
    },
    MonitorStarted {
        host: Host,
    },
    MonitorStopped {
        host: Host,
    },
}

impl Display for TopologyEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            TopologyEvent::ServerDescriptionChanged { ref host, previous, new } => {
                write!(fmt, "SERVER {} CHANGED {:?} -> {:?}", host, previous, new)
            }
            TopologyEvent::MonitorStarted { ref host } => write!(fmt, "MONITOR {} STARTED", host),
            TopologyEvent::MonitorStopped { ref host } => write!(fmt, "MONITOR {} STOPPED", host),
        }
    }
}
