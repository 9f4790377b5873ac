//! A single live transport to one server plus what the pool learned about it.
use bson::{bson, doc, Bson};
use tracing::debug;

use crate::auth::Credential;
use crate::connstring::Host;
use crate::error::Error::{ConnectionFailure, CursorNotFound, OperationFailure, Protocol};
use crate::error::Result;
use crate::transport::Transport;
use crate::wire_protocol::operations::DEFAULT_MAX_MESSAGE_SIZE;
use crate::wire_protocol::{Message, OpQueryFlags, OpReplyFlags};

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a process-wide unique request id.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Limits negotiated during the connection handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub min_wire_version: i64,
    pub max_wire_version: i64,
    pub max_document_size: i32,
    pub max_message_size: i32,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        ConnectionMetadata {
            min_wire_version: 0,
            max_wire_version: 0,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionMetadata {
    /// Reads the limits out of a handshake reply.
    pub fn from_handshake(reply: &bson::Document) -> ConnectionMetadata {
        let defaults = ConnectionMetadata::default();
        ConnectionMetadata {
            min_wire_version: int_field(reply, "minWireVersion").unwrap_or(0),
            max_wire_version: int_field(reply, "maxWireVersion").unwrap_or(0),
            max_document_size: size_field(reply, "maxBsonObjectSize")
                .unwrap_or(defaults.max_document_size),
            max_message_size: size_field(reply, "maxMessageSizeBytes")
                .unwrap_or(defaults.max_message_size),
        }
    }
}

/// Reads an integral field stored as any numeric BSON type.
pub fn int_field(doc: &bson::Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(&Bson::I32(v)) => Some(v as i64),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

/// True when a command reply reports `ok: 1`.
/// A size limit from a handshake reply, or `None` when it is missing or
/// does not fit an `i32`.
pub fn size_field(doc: &bson::Document, key: &str) -> Option<i32> {
    int_field(doc, key).and_then(|size| i32::try_from(size).ok())
}

pub fn is_ok(doc: &bson::Document) -> bool {
    match doc.get("ok") {
        Some(&Bson::Boolean(ok)) => ok,
        Some(&Bson::FloatingPoint(ok)) => ok == 1.0,
        Some(&Bson::I32(ok)) => ok == 1,
        Some(&Bson::I64(ok)) => ok == 1,
        _ => false,
    }
}

/// Builds the failure for a server-rejected command.
pub fn operation_failure(doc: &bson::Document) -> crate::error::Error {
    let message = match doc.get("errmsg").or_else(|| doc.get("$err")) {
        Some(&Bson::String(ref msg)) => msg.clone(),
        _ => String::from("command failed"),
    };
    OperationFailure {
        code: int_field(doc, "code").unwrap_or(0) as i32,
        message: message,
    }
}

/// A socket handle.
///
/// Owned by exactly one of a pool's idle set, a borrower, or a request slot.
/// Every network, timeout, interrupt or protocol failure closes the transport
/// before the error is returned, so a failed handle can never be reused.
pub struct Connection {
    id: u64,
    host: Host,
    transport: Box<dyn Transport>,
    generation: u64,
    authset: HashMap<String, Credential>,
    closed: bool,
    idle_since: Instant,
    metadata: ConnectionMetadata,
}

impl fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    pub fn new(host: Host, transport: Box<dyn Transport>, generation: u64) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            host: host,
            transport: transport,
            generation: generation,
            authset: HashMap::new(),
            closed: false,
            idle_since: Instant::now(),
            metadata: ConnectionMetadata::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    /// How long the handle has been sitting in the idle set.
    pub fn idle_time(&self) -> Duration {
        self.idle_since.elapsed()
    }

    /// Whether `credential` has already been verified on this socket for `db`.
    pub fn is_authenticated(&self, db: &str, credential: &Credential) -> bool {
        self.authset.get(db) == Some(credential)
    }

    pub fn authenticated_dbs(&self) -> Vec<String> {
        self.authset.keys().cloned().collect()
    }

    pub(crate) fn add_authenticated(&mut self, db: &str, credential: Credential) {
        self.authset.insert(db.to_owned(), credential);
    }

    pub(crate) fn remove_authenticated(&mut self, db: &str) -> Option<Credential> {
        self.authset.remove(db)
    }

    /// Closes the transport. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.closed {
            debug!(host = %self.host, connection_id = self.id, "closing connection");
            self.transport.shutdown();
            self.closed = true;
        }
    }

    fn check_result<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref err) = result {
            if err.is_network_error() {
                debug!(host = %self.host, connection_id = self.id, error = %err, "discarding broken connection");
                self.close();
            }
        }
        result
    }

    /// Writes a request.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        if self.closed {
            return Err(ConnectionFailure(format!(
                "connection {} to {} is closed",
                self.id, self.host
            )));
        }
        let result = self.transport.send(message);
        self.check_result(result)
    }

    /// Reads the reply to the request identified by `response_to`. A reply to
    /// anything else means the stream is out of sync.
    pub fn receive(&mut self, response_to: i32) -> Result<Message> {
        if self.closed {
            return Err(ConnectionFailure(format!(
                "connection {} to {} is closed",
                self.id, self.host
            )));
        }
        let result = self.transport.receive().and_then(|reply| {
            match reply {
                Message::OpReply { .. } if reply.response_to() == response_to => Ok(reply),
                Message::OpReply { .. } => Err(Protocol(format!(
                    "expected a response to request {} but got one to {}",
                    response_to,
                    reply.response_to()
                ))),
                _ => Err(Protocol(String::from("server sent a request message"))),
            }
        });
        self.check_result(result)
    }

    /// Sends a request and waits for its reply.
    pub fn request(&mut self, message: &Message) -> Result<Message> {
        self.send(message)?;
        self.receive(message.request_id())
    }

    /// Runs `cmd` against `db` and returns the reply document. A reply with
    /// `ok` other than 1 becomes `OperationFailure`; the connection stays open.
    pub fn command(&mut self, db: &str, cmd: bson::Document) -> Result<bson::Document> {
        let message = Message::new_query(
            next_request_id(),
            OpQueryFlags::empty(),
            format!("{}.$cmd", db),
            0,
            -1,
            cmd,
            None,
        )?;

        let reply = self.request(&message)?;
        let (_, mut documents) = reply_documents(reply, 0)?;
        if documents.is_empty() {
            let err = Protocol(String::from("command reply carried no document"));
            self.close();
            return Err(err);
        }

        let doc = documents.remove(0);
        if is_ok(&doc) {
            Ok(doc)
        } else {
            Err(operation_failure(&doc))
        }
    }

    /// Sends the capability probe with the driver metadata and records the
    /// negotiated limits.
    pub fn handshake(&mut self) -> Result<bson::Document> {
        let reply = self.command(
            "admin",
            doc! {
                "isMaster": 1i32,
                "client": {
                    "driver": {
                        "name": crate::DRIVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "os": {
                        "type": std::env::consts::OS,
                        "architecture": std::env::consts::ARCH
                    }
                },
            },
        )?;
        self.metadata = ConnectionMetadata::from_handshake(&reply);
        Ok(reply)
    }
}

/// Splits a reply into its cursor id and documents, turning failure flags
/// into errors. `cursor_id` names the cursor the request was about.
pub fn reply_documents(reply: Message, cursor_id: i64) -> Result<(i64, Vec<bson::Document>)> {
    match reply {
        Message::OpReply {
            flags,
            cursor_id: reply_cursor_id,
            documents,
            ..
        } => {
            if flags.contains(OpReplyFlags::CURSOR_NOT_FOUND) {
                return Err(CursorNotFound(cursor_id));
            }
            if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                return Err(match documents.first() {
                    Some(doc) => operation_failure(doc),
                    None => OperationFailure {
                        code: 0,
                        message: String::from("query failure"),
                    },
                });
            }
            Ok((reply_cursor_id, documents))
        }
        _ => Err(Protocol(String::from("expected OP_REPLY"))),
    }
}
