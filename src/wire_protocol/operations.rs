//! Wire protocol messages exchanged between the client and a server.
use bson;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error::Protocol;
use crate::error::Result;
use crate::wire_protocol::flags::{OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::header::{Header, OpCode, HEADER_LENGTH};

use std::io::{Cursor, Read, Write};
use std::mem;

/// Largest message a server will send before a handshake says otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;

const I32_LENGTH: i32 = mem::size_of::<i32>() as i32;
const I64_LENGTH: i32 = mem::size_of::<i64>() as i32;

fn encode(doc: &bson::Document) -> Result<Vec<u8>> {
    let mut buffer = vec![];
    bson::encode_document(&mut buffer, doc)?;
    Ok(buffer)
}

fn byte_length(doc: &bson::Document) -> Result<i32> {
    Ok(encode(doc)?.len() as i32)
}

fn write_cstring<W: Write + ?Sized>(buffer: &mut W, s: &str) -> Result<()> {
    buffer.write_all(s.as_bytes())?;
    // Null terminator for the namespace string.
    buffer.write_u8(0)?;
    Ok(())
}

/// Represents a message in the MongoDB Wire Protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    OpReply {
        /// The message header.
        header: Header,
        /// A bit vector of reply options.
        flags: OpReplyFlags,
        /// Uniquely identifies the cursor being returned, or 0 once exhausted.
        cursor_id: i64,
        /// The starting position for the cursor.
        starting_from: i32,
        /// The total number of documents being returned.
        number_returned: i32,
        /// The documents being returned.
        documents: Vec<bson::Document>,
    },
    OpQuery {
        header: Header,
        flags: OpQueryFlags,
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: bson::Document,
        return_field_selector: Option<bson::Document>,
    },
    OpGetMore {
        header: Header,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    OpKillCursors {
        header: Header,
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    /// Constructs a reply to the request identified by `response_to`.
    pub fn new_reply(
        request_id: i32,
        response_to: i32,
        flags: OpReplyFlags,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<bson::Document>,
    ) -> Result<Message> {
        let mut total_length = HEADER_LENGTH + 3 * I32_LENGTH + I64_LENGTH;
        for doc in &documents {
            total_length += byte_length(doc)?;
        }

        Ok(Message::OpReply {
            header: Header::new(total_length, request_id, response_to, OpCode::Reply),
            flags: flags,
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: documents.len() as i32,
            documents: documents,
        })
    }

    /// Constructs a new message request for a query.
    pub fn new_query(
        request_id: i32,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: bson::Document,
        return_field_selector: Option<bson::Document>,
    ) -> Result<Message> {
        // Flags, number_to_skip and number_to_return are all 32 bits wide.
        let i32_length = 3 * I32_LENGTH;
        let string_length = namespace.len() as i32 + 1;
        let bson_length = byte_length(&query)?;
        let option_length = match return_field_selector {
            Some(ref doc) => byte_length(doc)?,
            None => 0,
        };

        let total_length = HEADER_LENGTH + i32_length + string_length + bson_length + option_length;

        Ok(Message::OpQuery {
            header: Header::new_request(total_length, request_id, OpCode::Query),
            flags: flags,
            namespace: namespace,
            number_to_skip: number_to_skip,
            number_to_return: number_to_return,
            query: query,
            return_field_selector: return_field_selector,
        })
    }

    /// Constructs a new "get more" request message.
    pub fn new_get_more(
        request_id: i32,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Message {
        // Two i32 fields because of the reserved ZERO.
        let string_length = namespace.len() as i32 + 1;
        let total_length = HEADER_LENGTH + 2 * I32_LENGTH + string_length + I64_LENGTH;

        Message::OpGetMore {
            header: Header::new_request(total_length, request_id, OpCode::GetMore),
            namespace: namespace,
            number_to_return: number_to_return,
            cursor_id: cursor_id,
        }
    }

    /// Constructs a request to close the given server-side cursors.
    pub fn new_kill_cursors(request_id: i32, cursor_ids: Vec<i64>) -> Message {
        let total_length = HEADER_LENGTH + 2 * I32_LENGTH + I64_LENGTH * cursor_ids.len() as i32;

        Message::OpKillCursors {
            header: Header::new_request(total_length, request_id, OpCode::KillCursors),
            cursor_ids: cursor_ids,
        }
    }

    pub fn header(&self) -> &Header {
        match *self {
            Message::OpReply { ref header, .. }
            | Message::OpQuery { ref header, .. }
            | Message::OpGetMore { ref header, .. }
            | Message::OpKillCursors { ref header, .. } => header,
        }
    }

    pub fn request_id(&self) -> i32 {
        self.header().request_id
    }

    pub fn response_to(&self) -> i32 {
        self.header().response_to
    }

    /// True for requests the server answers with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        match *self {
            Message::OpQuery { .. } | Message::OpGetMore { .. } => true,
            Message::OpReply { .. } | Message::OpKillCursors { .. } => false,
        }
    }

    /// Attempts to write the serialized message to a buffer.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            Message::OpReply {
                ref header,
                flags,
                cursor_id,
                starting_from,
                number_returned,
                ref documents,
            } => {
                header.write(buffer)?;
                buffer.write_i32::<LittleEndian>(flags.bits())?;
                buffer.write_i64::<LittleEndian>(cursor_id)?;
                buffer.write_i32::<LittleEndian>(starting_from)?;
                buffer.write_i32::<LittleEndian>(number_returned)?;
                for doc in documents {
                    buffer.write_all(&encode(doc)?)?;
                }
            }
            Message::OpQuery {
                ref header,
                flags,
                ref namespace,
                number_to_skip,
                number_to_return,
                ref query,
                ref return_field_selector,
            } => {
                header.write(buffer)?;
                buffer.write_i32::<LittleEndian>(flags.bits())?;
                write_cstring(buffer, namespace)?;
                buffer.write_i32::<LittleEndian>(number_to_skip)?;
                buffer.write_i32::<LittleEndian>(number_to_return)?;
                buffer.write_all(&encode(query)?)?;
                if let Some(ref doc) = *return_field_selector {
                    buffer.write_all(&encode(doc)?)?;
                }
            }
            Message::OpGetMore {
                ref header,
                ref namespace,
                number_to_return,
                cursor_id,
            } => {
                header.write(buffer)?;
                // ZERO
                buffer.write_i32::<LittleEndian>(0)?;
                write_cstring(buffer, namespace)?;
                buffer.write_i32::<LittleEndian>(number_to_return)?;
                buffer.write_i64::<LittleEndian>(cursor_id)?;
            }
            Message::OpKillCursors {
                ref header,
                ref cursor_ids,
            } => {
                header.write(buffer)?;
                // ZERO
                buffer.write_i32::<LittleEndian>(0)?;
                buffer.write_i32::<LittleEndian>(cursor_ids.len() as i32)?;
                for id in cursor_ids {
                    buffer.write_i64::<LittleEndian>(*id)?;
                }
            }
        }

        buffer.flush()?;
        Ok(())
    }

    fn read_reply<R: Read + ?Sized>(buffer: &mut R, header: Header) -> Result<Message> {
        let body_length = header.message_length - HEADER_LENGTH;
        if body_length < 3 * I32_LENGTH + I64_LENGTH {
            return Err(Protocol(format!(
                "Reply of {} bytes is too short.",
                header.message_length
            )));
        }

        let mut body = vec![0; body_length as usize];
        buffer.read_exact(&mut body)?;
        let mut body = Cursor::new(body);

        let flags = body.read_i32::<LittleEndian>()?;
        let cursor_id = body.read_i64::<LittleEndian>()?;
        let starting_from = body.read_i32::<LittleEndian>()?;
        let number_returned = body.read_i32::<LittleEndian>()?;

        let mut documents = vec![];
        while (body.position() as i32) < body_length {
            documents.push(bson::decode_document(&mut body)?);
        }

        if documents.len() as i32 != number_returned {
            return Err(Protocol(format!(
                "Reply announced {} documents but carried {}.",
                number_returned,
                documents.len()
            )));
        }

        Ok(Message::OpReply {
            header: header,
            flags: OpReplyFlags::from_bits_truncate(flags),
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: number_returned,
            documents: documents,
        })
    }

    /// Attempts to read a serialized reply from a buffer.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        if header.message_length > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(Protocol(format!(
                "Message of {} bytes exceeds the maximum message size.",
                header.message_length
            )));
        }

        match header.op_code {
            OpCode::Reply => Message::read_reply(buffer, header),
            opcode => Err(Protocol(format!(
                "Expected to read OP_REPLY but instead found opcode {}",
                opcode
            ))),
        }
    }
}
