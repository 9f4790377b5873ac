use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error::Protocol;
use crate::error::Result;

use std::fmt;
use std::io::{Read, Write};

/// Size of a serialized header in bytes.
pub const HEADER_LENGTH: i32 = 16;

/// Represents an opcode in the MongoDB Wire Protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    GetMore = 2005,
    KillCursors = 2007,
}

impl OpCode {
    /// Maps integer values to OpCodes, or `None` for unsupported opcodes.
    pub fn from_i32(i: i32) -> Option<OpCode> {
        match i {
            1 => Some(OpCode::Reply),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OpCode::Reply => write!(fmt, "OP_REPLY"),
            OpCode::Query => write!(fmt, "OP_QUERY"),
            OpCode::GetMore => write!(fmt, "OP_GET_MORE"),
            OpCode::KillCursors => write!(fmt, "OP_KILL_CURSORS"),
        }
    }
}

/// Represents a header in the MongoDB Wire Protocol.
///
/// # Fields
///
/// `message_length` - The length of the entire message in bytes.
/// `request_id` - Identifies the message being sent.
/// `response_to` - The `request_id` this message answers, or `0` in a request.
/// `op_code` - Identifies which type of message is being sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Header {
        Header {
            message_length: message_length,
            request_id: request_id,
            response_to: response_to,
            op_code: op_code,
        }
    }

    /// Constructs a new Header for a request, with `response_to` set to 0.
    pub fn new_request(message_length: i32, request_id: i32, op_code: OpCode) -> Header {
        Header::new(message_length, request_id, 0, op_code)
    }

    /// Writes the serialized Header to a buffer.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        buffer.write_i32::<LittleEndian>(self.message_length)?;
        buffer.write_i32::<LittleEndian>(self.request_id)?;
        buffer.write_i32::<LittleEndian>(self.response_to)?;
        buffer.write_i32::<LittleEndian>(self.op_code as i32)?;
        Ok(())
    }

    /// Reads a serialized Header from a buffer. An unknown opcode means the
    /// stream is out of sync.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Header> {
        let message_length = buffer.read_i32::<LittleEndian>()?;
        let request_id = buffer.read_i32::<LittleEndian>()?;
        let response_to = buffer.read_i32::<LittleEndian>()?;

        let op_code_i32 = buffer.read_i32::<LittleEndian>()?;
        let op_code = match OpCode::from_i32(op_code_i32) {
            Some(code) => code,
            None => {
                return Err(Protocol(format!(
                    "Invalid header opcode from server: {}.",
                    op_code_i32
                )))
            }
        };

        if message_length < HEADER_LENGTH {
            return Err(Protocol(format!("Invalid message length: {}.", message_length)));
        }

        Ok(Header::new(message_length, request_id, response_to, op_code))
    }
}
