//! The seam between the pool and the network.
//!
//! Pools and monitors never open sockets themselves; they ask a [`Connector`]
//! for a boxed [`Transport`] and exchange whole wire messages with it. The
//! default connector is [`StreamConnector`](crate::stream::StreamConnector);
//! tests substitute an in-process cluster.
use bufstream::BufStream;

use crate::connstring::Host;
use crate::error::Result;
use crate::options::ClientOptions;
use crate::stream::Stream;
use crate::wire_protocol::Message;

/// A bidirectional message channel to one server.
pub trait Transport: Send {
    /// Writes a whole request.
    fn send(&mut self, message: &Message) -> Result<()>;
    /// Blocks until the next whole reply arrives.
    fn receive(&mut self) -> Result<Message>;
    /// Closes the channel. Further calls fail.
    fn shutdown(&mut self);
}

/// Opens transports to hosts.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &Host, options: &ClientOptions) -> Result<Box<dyn Transport>>;
}

/// Frames messages over a buffered socket.
pub struct WireTransport {
    stream: BufStream<Stream>,
}

impl WireTransport {
    pub fn new(stream: Stream) -> WireTransport {
        WireTransport {
            stream: BufStream::new(stream),
        }
    }
}

impl Transport for WireTransport {
    fn send(&mut self, message: &Message) -> Result<()> {
        message.write(&mut self.stream)
    }

    fn receive(&mut self) -> Result<Message> {
        Message::read(&mut self.stream)
    }

    fn shutdown(&mut self) {
        self.stream.get_ref().shutdown();
    }
}
