use bson::{oid, Bson};
use chrono::{DateTime, Utc};

use crate::connection::{int_field, is_ok, operation_failure, size_field, DEFAULT_MAX_DOCUMENT_SIZE};
use crate::connstring::{self, Host};
use crate::error::Error;
use crate::pool::ConnectionPool;
use crate::wire_protocol::operations::DEFAULT_MAX_MESSAGE_SIZE;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use super::monitor::MonitorHandle;

/// Describes the server role within a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Shard router.
    Mongos,
    /// Replica set primary.
    RSPrimary,
    /// Replica set secondary.
    RSSecondary,
    /// Replica set arbiter.
    RSArbiter,
    /// Replica set member of some other type, including members that have
    /// not joined a set yet.
    RSOther,
    /// Server type is currently unknown.
    Unknown,
}

impl ServerType {
    /// Whether the server holds data that operations may read.
    pub fn is_data_bearing(self) -> bool {
        match self {
            ServerType::Standalone
            | ServerType::Mongos
            | ServerType::RSPrimary
            | ServerType::RSSecondary => true,
            ServerType::RSArbiter | ServerType::RSOther | ServerType::Unknown => false,
        }
    }
}

impl FromStr for ServerType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "Standalone" => ServerType::Standalone,
            "Mongos" => ServerType::Mongos,
            "RSPrimary" => ServerType::RSPrimary,
            "RSSecondary" => ServerType::RSSecondary,
            "RSArbiter" => ServerType::RSArbiter,
            "RSOther" | "RSGhost" => ServerType::RSOther,
            _ => ServerType::Unknown,
        })
    }
}

/// An immutable snapshot of one server, produced by a handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerDescription {
    pub host: Host,
    pub server_type: ServerType,
    pub min_wire_version: i64,
    pub max_wire_version: i64,
    pub max_document_size: i32,
    pub max_message_size: i32,
    /// The replica set name.
    pub set_name: Option<String>,
    /// All hosts in the replica set known by this server.
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    /// The server's own address, if it is part of a replica set.
    pub me: Option<Host>,
    /// The server's opinion of who the primary is.
    pub primary: Option<Host>,
    /// Server tags for targeted reads on specific replica set members.
    pub tags: BTreeMap<String, String>,
    /// The server's current election id, if it believes it is a primary.
    pub election_id: Option<oid::ObjectId>,
    pub round_trip_time: Option<Duration>,
    pub last_update_time: DateTime<Utc>,
    /// The error that made this server Unknown.
    pub error: Option<Error>,
}

fn host_list(doc: &bson::Document, key: &str) -> Vec<Host> {
    match doc.get(key) {
        Some(&Bson::Array(ref arr)) => arr
            .iter()
            .filter_map(|bson| match *bson {
                Bson::String(ref s) => connstring::parse_host(s).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn host_field(doc: &bson::Document, key: &str) -> Option<Host> {
    match doc.get(key) {
        Some(&Bson::String(ref s)) => connstring::parse_host(s).ok(),
        _ => None,
    }
}

fn bool_field(doc: &bson::Document, key: &str) -> bool {
    match doc.get(key) {
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    }
}

impl ServerDescription {
    /// Returns an unknown server description for a host that has not been
    /// checked yet.
    pub fn new(host: Host) -> ServerDescription {
        ServerDescription {
            host: host,
            server_type: ServerType::Unknown,
            min_wire_version: 0,
            max_wire_version: 0,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            set_name: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            me: None,
            primary: None,
            tags: BTreeMap::new(),
            election_id: None,
            round_trip_time: None,
            last_update_time: Utc::now(),
            error: None,
        }
    }

    /// An Unknown description recording why the server could not be checked.
    pub fn unknown_with_error(host: Host, err: Error) -> ServerDescription {
        ServerDescription {
            error: Some(err),
            ..ServerDescription::new(host)
        }
    }

    /// Builds a description from an isMaster reply.
    pub fn from_is_master(host: Host, doc: &bson::Document, round_trip_time: Duration) -> ServerDescription {
        if !is_ok(doc) {
            return ServerDescription::unknown_with_error(host, operation_failure(doc));
        }

        let mut description = ServerDescription::new(host);
        description.round_trip_time = Some(round_trip_time);
        description.min_wire_version = int_field(doc, "minWireVersion").unwrap_or(0);
        description.max_wire_version = int_field(doc, "maxWireVersion").unwrap_or(0);
        if let Some(size) = size_field(doc, "maxBsonObjectSize") {
            description.max_document_size = size;
        }
        if let Some(size) = size_field(doc, "maxMessageSizeBytes") {
            description.max_message_size = size;
        }

        description.set_name = match doc.get("setName") {
            Some(&Bson::String(ref s)) if !s.is_empty() => Some(s.to_owned()),
            _ => None,
        };
        description.hosts = host_list(doc, "hosts");
        description.passives = host_list(doc, "passives");
        description.arbiters = host_list(doc, "arbiters");
        description.me = host_field(doc, "me");
        description.primary = host_field(doc, "primary");

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    description.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        if let Some(&Bson::ObjectId(ref id)) = doc.get("electionId") {
            description.election_id = Some(id.clone());
        }

        let is_mongos = match doc.get("msg") {
            Some(&Bson::String(ref msg)) => msg == "isdbgrid",
            _ => false,
        };

        description.server_type = if is_mongos {
            ServerType::Mongos
        } else if description.set_name.is_some() {
            if bool_field(doc, "ismaster") {
                ServerType::RSPrimary
            } else if bool_field(doc, "secondary") {
                ServerType::RSSecondary
            } else if bool_field(doc, "arbiterOnly") {
                ServerType::RSArbiter
            } else {
                ServerType::RSOther
            }
        } else if bool_field(doc, "isreplicaset") {
            ServerType::RSOther
        } else {
            ServerType::Standalone
        };

        description
    }

    pub fn is_unknown(&self) -> bool {
        self.server_type == ServerType::Unknown
    }

    /// Every member this server reports, data-bearing or not.
    pub fn all_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }
}

/// A known server: its pool and the monitor that keeps its description fresh.
pub struct Server {
    pub host: Host,
    pub pool: ConnectionPool,
    pub(crate) monitor: Mutex<Option<MonitorHandle>>,
}

impl Server {
    pub(crate) fn new(host: Host, pool: ConnectionPool, monitor: Option<MonitorHandle>) -> Server {
        Server {
            host: host,
            pool: pool,
            monitor: Mutex::new(monitor),
        }
    }

    /// Whether a live monitor thread is watching this server.
    pub fn monitor_is_alive(&self) -> bool {
        match self.monitor.lock() {
            Ok(monitor) => monitor.as_ref().map_or(false, MonitorHandle::is_alive),
            Err(_) => false,
        }
    }

    /// Asks the monitor for an immediate check.
    pub fn request_update(&self) {
        if let Ok(monitor) = self.monitor.lock() {
            if let Some(ref monitor) = *monitor {
                monitor.request_update();
            }
        }
    }

    pub(crate) fn stop_monitor(&self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(monitor) = monitor.take() {
                monitor.stop();
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}
