//! Bit vectors carried by OP_REPLY and OP_QUERY.
use bitflags::bitflags;

bitflags! {
    /// Set by the server on a reply.
    pub struct OpReplyFlags: i32 {
        /// A getMore named a cursor the server no longer has.
        const CURSOR_NOT_FOUND = 1;
        /// The single returned document describes a query error.
        const QUERY_FAILURE = 1 << 1;
        const AWAIT_CAPABLE = 1 << 3;
    }
}

bitflags! {
    /// Set by the client on a query.
    pub struct OpQueryFlags: i32 {
        const TAILABLE_CURSOR = 1 << 1;
        /// Allows the query to run on a secondary.
        const SLAVE_OK = 1 << 2;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA = 1 << 5;
        /// The server streams every batch without waiting for getMore.
        const EXHAUST = 1 << 6;
        const PARTIAL = 1 << 7;
    }
}
