//! Credential caching and lazy replay.
//!
//! Mechanism implementations live outside this crate behind [`Authenticator`].
//! The client only tracks which credential belongs to which database and
//! which sockets have already proven it.
use crate::connection::Connection;
use crate::error::Result;

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// A credential tuple for one database.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub mechanism: String,
    pub source: String,
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new<S: Into<String>>(mechanism: S, source: S, username: S, password: S) -> Credential {
        Credential {
            mechanism: mechanism.into(),
            source: source.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Credential")
            .field("mechanism", &self.mechanism)
            .field("source", &self.source)
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

/// Runs an authentication conversation on a socket.
pub trait Authenticator: Send + Sync {
    /// Proves `credential` for `db` on `conn`. A rejection is an
    /// `OperationFailure`; a broken socket is a network error.
    fn authenticate(&self, conn: &mut Connection, db: &str, credential: &Credential) -> Result<()>;

    /// Drops the authentication for `db` on `conn`.
    fn logout(&self, _conn: &mut Connection, _db: &str) -> Result<()> {
        Ok(())
    }
}

/// Database name to credential, shared by every pool of a client.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: RwLock<HashMap<String, Credential>>,
}

impl CredentialCache {
    pub fn new() -> CredentialCache {
        CredentialCache::default()
    }

    pub fn insert(&self, db: &str, credential: Credential) -> Result<()> {
        self.entries.write()?.insert(db.to_owned(), credential);
        Ok(())
    }

    pub fn remove(&self, db: &str) -> Result<Option<Credential>> {
        Ok(self.entries.write()?.remove(db))
    }

    pub fn get(&self, db: &str) -> Result<Option<Credential>> {
        Ok(self.entries.read()?.get(db).cloned())
    }

    /// A copy of every cached entry.
    pub fn snapshot(&self) -> Result<HashMap<String, Credential>> {
        Ok(self.entries.read()?.clone())
    }
}
