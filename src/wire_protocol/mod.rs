//! Legacy opcode framing used for commands, exhaust queries and cursor
//! maintenance.
pub mod flags;
pub mod header;
pub mod operations;

pub use self::flags::{OpQueryFlags, OpReplyFlags};
pub use self::header::{Header, OpCode};
pub use self::operations::Message;
