//! The byte-stream side of a connection.

use std::net::SocketAddr;
use std::time::Duration;

/// How the underlying stream reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// A Unix domain socket or an in-process pipe. Carries no addresses.
    Local,
    /// Plain TCP.
    Tcp {
        /// Our end of the socket.
        local: SocketAddr,
        /// The peer's end of the socket.
        peer: SocketAddr,
    },
    /// TCP wrapped in TLS.
    Tls {
        /// Our end of the socket.
        local: SocketAddr,
        /// The peer's end of the socket.
        peer: SocketAddr,
    },
}

impl Transport {
    /// Whether the stream is a local socket.
    pub fn is_local(&self) -> bool {
        matches!(self, Transport::Local)
    }

    /// Whether the stream is encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    /// Local and peer addresses, unless the stream is local.
    pub fn addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        match *self {
            Transport::Local => None,
            Transport::Tcp { local, peer } | Transport::Tls { local, peer } => Some((local, peer)),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Local
    }
}

/// A duplex byte stream as seen by a connection.
///
/// Reads are not pulled through this trait. Whoever owns the socket pushes
/// them into the connection with `read`, reports flushed writes with
/// `written`, and reports the peer hanging up with `closed`.
pub trait Stream {
    /// Describe the transport underneath.
    fn transport(&self) -> Transport;

    /// Queue bytes for writing. Writes issued on one stream keep their order.
    ///
    /// When `notify` is set the owner must call `written()` on the
    /// connection once this chunk has been flushed.
    fn write(&mut self, chunk: Vec<u8>, notify: bool);

    /// Close immediately, discarding queued writes.
    fn close(&mut self);

    /// Close once every queued write has been flushed.
    fn close_gracefully(&mut self);
}

/// Proof that a timer is armed. Consumed when the timer is cancelled.
#[derive(Debug, PartialEq, Eq)]
pub struct TimeoutHandle(u64);

impl TimeoutHandle {
    /// Wrap a timer id chosen by the `Timer` implementation.
    pub fn new(id: u64) -> Self {
        TimeoutHandle(id)
    }

    /// The id this handle was created with.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A one-shot timer source for the client request timeout.
///
/// When an armed timer expires, the owner calls `timeout()` on the connection.
pub trait Timer {
    /// Arm a timer expiring after `after`.
    fn start(&mut self, after: Duration) -> TimeoutHandle;

    /// Disarm a timer. It must not fire afterwards.
    fn cancel(&mut self, handle: TimeoutHandle);
}
