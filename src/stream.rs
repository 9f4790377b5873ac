use socket2::SockRef;
use tracing::debug;

use crate::connstring::Host;
use crate::error::Error::ConnectionFailure;
use crate::error::Result;
use crate::options::ClientOptions;
use crate::transport::{Connector, Transport, WireTransport};

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

#[cfg(feature = "ssl")]
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslOptions, SslStream, SslVerifyMode};

/// Encapsulates the functionality for how to connect to the server.
#[derive(Clone, Debug)]
pub enum StreamConnector {
    /// Connect to the server through a regular TCP stream.
    Tcp,
    #[cfg(feature = "ssl")]
    /// Connect to the server through a TCP stream encrypted with TLS.
    Ssl {
        ca_file: String,
        certificate_file: String,
        key_file: String,
        verify_peer: bool,
    },
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl StreamConnector {
    /// Picks plain TCP or TLS from the client options.
    pub fn from_options(options: &ClientOptions) -> StreamConnector {
        match options.tls {
            #[cfg(feature = "ssl")]
            Some(ref tls) => StreamConnector::Ssl {
                ca_file: tls.ca_file.clone(),
                certificate_file: tls.certificate_file.clone(),
                key_file: tls.key_file.clone(),
                verify_peer: tls.verify_peer,
            },
            _ => StreamConnector::Tcp,
        }
    }

    /// Opens a stream to the host, trying each resolved address in turn.
    pub fn connect_stream(&self, host: &Host, options: &ClientOptions) -> Result<Stream> {
        let tcp = connect_tcp(host, options)?;

        match *self {
            StreamConnector::Tcp => Ok(Stream::Tcp(tcp)),
            #[cfg(feature = "ssl")]
            StreamConnector::Ssl {
                ref ca_file,
                ref certificate_file,
                ref key_file,
                verify_peer,
            } => {
                let tls_err = |err: openssl::error::ErrorStack| ConnectionFailure(err.to_string());

                // Compression and the legacy protocol versions are disabled.
                let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_err)?;
                builder
                    .set_cipher_list("ALL:!EXPORT:!eNULL:!aNULL:HIGH:@STRENGTH")
                    .map_err(tls_err)?;
                builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_COMPRESSION);
                builder.set_ca_file(ca_file).map_err(tls_err)?;
                builder
                    .set_certificate_file(certificate_file, SslFiletype::PEM)
                    .map_err(tls_err)?;
                builder
                    .set_private_key_file(key_file, SslFiletype::PEM)
                    .map_err(tls_err)?;
                builder.set_verify(if verify_peer {
                    SslVerifyMode::PEER
                } else {
                    SslVerifyMode::NONE
                });

                let config = builder
                    .build()
                    .configure()
                    .map_err(tls_err)?
                    .verify_hostname(verify_peer);

                config
                    .connect(&host.host_name, tcp)
                    .map(Stream::Ssl)
                    .map_err(|err| ConnectionFailure(err.to_string()))
            }
        }
    }
}

impl Connector for StreamConnector {
    fn connect(&self, host: &Host, options: &ClientOptions) -> Result<Box<dyn Transport>> {
        let stream = self.connect_stream(host, options)?;
        Ok(Box::new(WireTransport::new(stream)))
    }
}

fn connect_tcp(host: &Host, options: &ClientOptions) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host.host_name.as_str(), host.port).to_socket_addrs()?.collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, options.connect_timeout) {
            Ok(tcp) => {
                tcp.set_nodelay(true)?;
                tcp.set_read_timeout(options.socket_timeout)?;
                tcp.set_write_timeout(options.socket_timeout)?;
                if options.socket_keepalive {
                    SockRef::from(&tcp).set_keepalive(true)?;
                }
                return Ok(tcp);
            }
            Err(err) => {
                debug!(host = %host, addr = %addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(match last_err {
        Some(err) => err.into(),
        None => ConnectionFailure(format!("{} did not resolve to any address", host)),
    })
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "ssl")]
    Ssl(SslStream<TcpStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.flush(),
        }
    }
}

impl Stream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Closes both halves of the socket. Errors are ignored since the
    /// stream is being abandoned.
    pub fn shutdown(&self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }

    fn tcp(&self) -> &TcpStream {
        match *self {
            Stream::Tcp(ref stream) => stream,
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref stream) => stream.get_ref(),
        }
    }
}
