//! Connection lifecycle and topology management for MongoDB clients.
//!
//! A [`Client`] keeps a bounded connection pool per known server, a
//! background monitor thread per server that tracks its role and limits, and
//! a copy-on-write view of the whole deployment (standalone, replica set or
//! sharded cluster). Operations select a suitable server from that view,
//! borrow a connection from its pool and classify every failure into the
//! [`Error`] kinds so callers know whether to retry, reconnect, or give up.
//!
//! ```no_run
//! use bson::{bson, doc};
//! use mongodb_topology::topology::selector::WritableServer;
//! use mongodb_topology::Client;
//!
//! let client = Client::connect("localhost", 27017).expect("failed to start the client");
//! let reply = client
//!     .command(None, &WritableServer, "admin", doc! { "ping": 1 })
//!     .expect("ping failed");
//! println!("{}", reply);
//! ```
//!
//! Callers that need read-your-writes ordering on one socket wrap their
//! operations in a request:
//!
//! ```no_run
//! # use bson::{bson, doc};
//! # use mongodb_topology::topology::selector::WritableServer;
//! # use mongodb_topology::{CallerId, Client};
//! # let client = Client::connect("localhost", 27017).unwrap();
//! let caller = CallerId::new();
//! let _request = client.request(&caller).unwrap();
//! client.command(Some(&caller), &WritableServer, "test", doc! { "insert": "c", "documents": [{ "x": 1 }] }).unwrap();
//! client.command(Some(&caller), &WritableServer, "test", doc! { "count": "c" }).unwrap();
//! ```
pub mod apm;
pub mod auth;
pub mod client;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod error;
pub mod exhaust;
pub mod options;
pub mod pool;
pub mod stream;
pub mod topology;
pub mod transport;
pub mod wire_protocol;


pub use crate::client::{Client, RequestGuard};
pub use crate::common::{ReadMode, ReadPreference};
pub use crate::connstring::Host;
pub use crate::error::{Error, Result};
pub use crate::options::ClientOptions;
pub use crate::pool::{CallerId, ConnectionPool, PooledConnection};

/// Reported to servers in the handshake.
pub const DRIVER_NAME: &str = "mongodb-topology";
