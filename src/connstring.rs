//! Server addresses.
use crate::error::Error::Configuration;
use crate::error::Result;

use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 27017;

/// Encapsulates the hostname and port of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    /// Creates a new Host struct.
    pub fn new<S: Into<String>>(host_name: S, port: u16) -> Host {
        Host {
            host_name: host_name.into(),
            port: port,
        }
    }

    /// Creates a host on the default port.
    pub fn with_default_port<S: Into<String>>(host_name: S) -> Host {
        Host::new(host_name, DEFAULT_PORT)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(fmt, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(fmt, "{}:{}", self.host_name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Host> {
        parse_host(s)
    }
}

/// Parses a single `host[:port]` entry, as reported in handshake replies.
/// IPv6 literals must be bracketed when a port is given.
pub fn parse_host(host_string: &str) -> Result<Host> {
    let host_string = host_string.trim();
    if host_string.is_empty() {
        return Err(Configuration(String::from("host cannot be empty")));
    }

    if host_string.starts_with('[') {
        let end = host_string
            .find(']')
            .ok_or_else(|| Configuration(format!("unterminated IPv6 literal in '{}'", host_string)))?;
        let host_name = &host_string[1..end];
        let rest = &host_string[end + 1..];
        let port = if rest.is_empty() {
            DEFAULT_PORT
        } else if rest.starts_with(':') {
            parse_port(&rest[1..], host_string)?
        } else {
            return Err(Configuration(format!("invalid host '{}'", host_string)));
        };
        return Ok(Host::new(host_name.to_lowercase(), port));
    }

    match host_string.rfind(':') {
        Some(idx) if host_string[..idx].contains(':') => {
            // Unbracketed IPv6 literal without a port.
            Ok(Host::new(host_string.to_lowercase(), DEFAULT_PORT))
        }
        Some(idx) => {
            let port = parse_port(&host_string[idx + 1..], host_string)?;
            Ok(Host::new(host_string[..idx].to_lowercase(), port))
        }
        None => Ok(Host::new(host_string.to_lowercase(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str, host_string: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Configuration(format!("invalid port in host '{}'", host_string))),
        Ok(port) => Ok(port),
    }
}
