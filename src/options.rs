//! Client configuration.
//!
//! Options arrive already resolved from a connection string or a config
//! document. They are validated once, when the client is constructed, and are
//! immutable afterwards.
use bson::Bson;
use serde_derive::Deserialize;

use crate::error::Error::{self, Configuration};
use crate::error::Result;

use std::convert::TryFrom;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 10_000;
pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;

// Millisecond options must stay below one billion.
const MAX_TIMEOUT_MS: f64 = 1_000_000_000.0;

/// Certificate settings for encrypted connections.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    pub ca_file: String,
    pub certificate_file: String,
    pub key_file: String,
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
}

fn default_verify_peer() -> bool {
    true
}

/// The typed options bundle shared by pools, monitors and the client.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawOptions")]
pub struct ClientOptions {
    /// Upper bound for opening a transport.
    pub connect_timeout: Duration,
    /// Upper bound for each read or write; `None` blocks until the peer answers.
    pub socket_timeout: Option<Duration>,
    /// Connections per server, idle and borrowed together.
    pub max_pool_size: usize,
    /// How long `acquire` waits for an admission slot. `None` falls back to
    /// `server_selection_timeout`.
    pub wait_queue_timeout: Option<Duration>,
    /// Bounds the waiters per pool to `max_pool_size * wait_queue_multiple`.
    pub wait_queue_multiple: Option<usize>,
    pub socket_keepalive: bool,
    pub heartbeat_frequency: Duration,
    pub server_selection_timeout: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub max_idle_time: Option<Duration>,
    pub replica_set: Option<String>,
    pub tls: Option<TlsOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            socket_timeout: None,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            wait_queue_timeout: None,
            wait_queue_multiple: None,
            socket_keepalive: false,
            heartbeat_frequency: Duration::from_millis(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            server_selection_timeout: Duration::from_millis(DEFAULT_SERVER_SELECTION_TIMEOUT_MS),
            max_idle_time: None,
            replica_set: None,
            tls: None,
        }
    }
}

impl ClientOptions {
    /// Returns the default options.
    pub fn new() -> ClientOptions {
        ClientOptions::default()
    }

    /// Reads options from a document using connection-string key names,
    /// e.g. `{ "maxPoolSize": 3, "waitQueueMultiple": 2 }`.
    pub fn from_document(doc: bson::Document) -> Result<ClientOptions> {
        bson::from_bson(Bson::Document(doc)).map_err(|err| match err {
            bson::DecoderError::SyntaxError(msg) => Configuration(msg),
            other => Configuration(other.to_string()),
        })
    }

    pub fn with_max_pool_size(mut self, size: usize) -> ClientOptions {
        self.max_pool_size = size;
        self
    }

    pub fn with_wait_queue_timeout(mut self, timeout: Duration) -> ClientOptions {
        self.wait_queue_timeout = Some(timeout);
        self
    }

    pub fn with_wait_queue_multiple(mut self, multiple: usize) -> ClientOptions {
        self.wait_queue_multiple = Some(multiple);
        self
    }

    pub fn with_heartbeat_frequency(mut self, frequency: Duration) -> ClientOptions {
        self.heartbeat_frequency = frequency;
        self
    }

    pub fn with_server_selection_timeout(mut self, timeout: Duration) -> ClientOptions {
        self.server_selection_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> ClientOptions {
        self.socket_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> ClientOptions {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> ClientOptions {
        self.max_idle_time = Some(idle);
        self
    }

    pub fn with_replica_set<S: Into<String>>(mut self, name: S) -> ClientOptions {
        self.replica_set = Some(name.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> ClientOptions {
        self.tls = Some(tls);
        self
    }

    /// Maximum number of callers allowed to wait for a connection,
    /// or `None` when unbounded. Saturates for huge settings.
    pub fn max_waiters(&self) -> Option<usize> {
        self.wait_queue_multiple
            .map(|multiple| self.max_pool_size.saturating_mul(multiple))
    }

    /// The ceiling applied to pool admission.
    pub fn effective_wait_queue_timeout(&self) -> Duration {
        self.wait_queue_timeout.unwrap_or(self.server_selection_timeout)
    }

    /// Checks every option; called by the client constructor.
    pub fn validate(&self) -> Result<()> {
        check_duration("connectTimeoutMS", self.connect_timeout)?;
        if let Some(timeout) = self.socket_timeout {
            check_duration("socketTimeoutMS", timeout)?;
        }
        if let Some(timeout) = self.wait_queue_timeout {
            check_duration("waitQueueTimeoutMS", timeout)?;
        }
        if let Some(idle) = self.max_idle_time {
            check_duration("maxIdleTimeMS", idle)?;
        }
        check_duration("heartbeatFrequencyMS", self.heartbeat_frequency)?;
        check_duration("serverSelectionTimeoutMS", self.server_selection_timeout)?;

        if self.max_pool_size < 1 {
            return Err(Configuration(String::from(
                "The connection pool size must be greater than zero.",
            )));
        }

        if let Some(multiple) = self.wait_queue_multiple {
            if multiple < 1 {
                return Err(Configuration(String::from(
                    "waitQueueMultiple must be greater than zero.",
                )));
            }
        }

        if let Some(ref name) = self.replica_set {
            if name.is_empty() {
                return Err(Configuration(String::from("replicaSet cannot be empty.")));
            }
        }

        if self.tls.is_some() && !cfg!(feature = "ssl") {
            return Err(Configuration(String::from(
                "TLS options require the `ssl` feature.",
            )));
        }

        Ok(())
    }
}

fn check_duration(name: &str, value: Duration) -> Result<()> {
    let millis = value.as_secs_f64() * 1000.0;
    if millis <= 0.0 || millis >= MAX_TIMEOUT_MS {
        return Err(Configuration(format!(
            "{} must be greater than 0 and less than one billion",
            name
        )));
    }
    Ok(())
}

// Wire shape of the options, as they appear in connection strings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    #[serde(rename = "connectTimeoutMS")]
    connect_timeout_ms: Option<f64>,
    #[serde(rename = "socketTimeoutMS")]
    socket_timeout_ms: Option<f64>,
    #[serde(rename = "maxPoolSize")]
    max_pool_size: Option<i64>,
    #[serde(rename = "waitQueueTimeoutMS")]
    wait_queue_timeout_ms: Option<f64>,
    #[serde(rename = "waitQueueMultiple")]
    wait_queue_multiple: Option<i64>,
    #[serde(rename = "socketKeepAlive")]
    socket_keepalive: Option<bool>,
    #[serde(rename = "heartbeatFrequencyMS")]
    heartbeat_frequency_ms: Option<f64>,
    #[serde(rename = "serverSelectionTimeoutMS")]
    server_selection_timeout_ms: Option<f64>,
    #[serde(rename = "maxIdleTimeMS")]
    max_idle_time_ms: Option<f64>,
    #[serde(rename = "replicaSet")]
    replica_set: Option<String>,
    tls: Option<TlsOptions>,
}

fn millis(name: &str, value: f64) -> Result<Duration> {
    if !(value > 0.0 && value < MAX_TIMEOUT_MS) {
        return Err(Configuration(format!(
            "{} must be greater than 0 and less than one billion",
            name
        )));
    }
    Ok(Duration::from_micros((value * 1000.0) as u64))
}

fn count(name: &str, value: i64) -> Result<usize> {
    if value < 1 {
        return Err(Configuration(format!("{} must be greater than zero", name)));
    }
    Ok(value as usize)
}

impl TryFrom<RawOptions> for ClientOptions {
    type Error = Error;

    fn try_from(raw: RawOptions) -> Result<ClientOptions> {
        let mut options = ClientOptions::default();

        if let Some(ms) = raw.connect_timeout_ms {
            options.connect_timeout = millis("connectTimeoutMS", ms)?;
        }
        if let Some(ms) = raw.socket_timeout_ms {
            options.socket_timeout = Some(millis("socketTimeoutMS", ms)?);
        }
        if let Some(size) = raw.max_pool_size {
            options.max_pool_size = count("maxPoolSize", size)?;
        }
        if let Some(ms) = raw.wait_queue_timeout_ms {
            options.wait_queue_timeout = Some(millis("waitQueueTimeoutMS", ms)?);
        }
        if let Some(multiple) = raw.wait_queue_multiple {
            options.wait_queue_multiple = Some(count("waitQueueMultiple", multiple)?);
        }
        if let Some(keepalive) = raw.socket_keepalive {
            options.socket_keepalive = keepalive;
        }
        if let Some(ms) = raw.heartbeat_frequency_ms {
            options.heartbeat_frequency = millis("heartbeatFrequencyMS", ms)?;
        }
        if let Some(ms) = raw.server_selection_timeout_ms {
            options.server_selection_timeout = millis("serverSelectionTimeoutMS", ms)?;
        }
        if let Some(ms) = raw.max_idle_time_ms {
            options.max_idle_time = Some(millis("maxIdleTimeMS", ms)?);
        }
        options.replica_set = raw.replica_set;
        options.tls = raw.tls;

        options.validate()?;
        Ok(options)
    }
}
