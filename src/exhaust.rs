//! Exhaust-mode query streams.
//!
//! After an exhaust query the server keeps pushing batches over the same
//! socket without further requests, each reply answering the previous one.
//! The socket therefore stays borrowed for the whole stream. It goes back to
//! the idle set once the server reports the end of the stream, either with a
//! zero cursor id or with a query failure. A network failure, or dropping the
//! cursor while batches are still in flight, discards the socket instead.
use bson::Document;
use tracing::{debug, warn};

use crate::connection::{next_request_id, reply_documents};
use crate::connstring::Host;
use crate::error::Error::{self, Interrupted};
use crate::error::Result;
use crate::pool::PooledConnection;
use crate::topology::Topology;
use crate::wire_protocol::{Message, OpQueryFlags};

use std::collections::VecDeque;

/// Lazily yields the documents of an exhaust query.
pub struct ExhaustCursor {
    // Present while the server may still send batches.
    conn: Option<PooledConnection>,
    host: Host,
    namespace: String,
    cursor_id: i64,
    // The reply the next batch will answer.
    last_request_id: i32,
    buffer: VecDeque<Document>,
    topology: Topology,
}

impl ExhaustCursor {
    /// Sends the query and reads the first batch.
    pub(crate) fn open(
        conn: PooledConnection,
        namespace: String,
        query: Document,
        batch_size: i32,
        topology: Topology,
    ) -> Result<ExhaustCursor> {
        let message = Message::new_query(
            next_request_id(),
            OpQueryFlags::EXHAUST | OpQueryFlags::SLAVE_OK,
            namespace.clone(),
            0,
            batch_size,
            query,
            None,
        )?;

        let mut cursor = ExhaustCursor {
            host: conn.host().clone(),
            conn: Some(conn),
            namespace: namespace,
            cursor_id: 0,
            last_request_id: message.request_id(),
            buffer: VecDeque::new(),
            topology: topology,
        };

        let sent = match cursor.conn {
            Some(ref mut conn) => conn.send(&message),
            None => Ok(()),
        };
        if let Err(err) = sent {
            cursor.abandon(&err);
            return Err(err);
        }

        cursor.read_batch()?;
        Ok(cursor)
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True once every batch has been received and consumed.
    pub fn is_exhausted(&self) -> bool {
        self.conn.is_none() && self.buffer.is_empty()
    }

    /// Returns the buffered documents, waiting for the next batch if none
    /// are buffered.
    pub fn next_batch(&mut self) -> Result<Vec<Document>> {
        if self.buffer.is_empty() && self.conn.is_some() {
            self.read_batch()?;
        }
        Ok(self.buffer.drain(..).collect())
    }

    fn read_batch(&mut self) -> Result<()> {
        let received = match self.conn {
            Some(ref mut conn) => conn.receive(self.last_request_id),
            None => return Ok(()),
        };

        let reply = match received {
            Ok(reply) => reply,
            Err(err) => {
                self.abandon(&err);
                return Err(err);
            }
        };

        let request_id = reply.request_id();
        match reply_documents(reply, self.cursor_id) {
            Ok((cursor_id, documents)) => {
                self.cursor_id = cursor_id;
                self.last_request_id = request_id;
                self.buffer.extend(documents);
                if cursor_id == 0 {
                    debug!(host = %self.host, namespace = %self.namespace, "exhaust stream finished");
                    self.conn = None;
                }
                Ok(())
            }
            Err(err) => {
                // The failure reply ends the stream; the socket is in sync.
                debug!(host = %self.host, error = %err, "exhaust stream failed on the server");
                self.cursor_id = 0;
                self.conn = None;
                Err(err)
            }
        }
    }

    // Drops the socket after a transport failure.
    fn abandon(&mut self, err: &Error) {
        self.cursor_id = 0;
        if let Some(conn) = self.conn.take() {
            conn.discard();
        }
        match *err {
            Interrupted(_) => (),
            ref err if err.is_network_error() => {
                warn!(host = %self.host, error = %err, "exhaust stream broken");
                self.topology.mark_unknown(&self.host, err.clone());
            }
            _ => (),
        }
    }
}

impl Iterator for ExhaustCursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Result<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(Ok(doc));
            }
            if self.conn.is_none() {
                return None;
            }
            if let Err(err) = self.read_batch() {
                return Some(Err(err));
            }
        }
    }
}

impl Drop for ExhaustCursor {
    fn drop(&mut self) {
        // Unread batches would desynchronize the socket.
        if let Some(conn) = self.conn.take() {
            debug!(host = %self.host, cursor_id = self.cursor_id, "closing unfinished exhaust stream");
            conn.discard();
        }
    }
}
