//! The exchange abstraction driven by a connection.

use std::net::SocketAddr;

use async_channel::Sender;
use http_types::StatusCode;

use crate::Error;

/// What a transaction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A single HTTP request/response pair.
    Http,
    /// A WebSocket session created by upgrading an HTTP exchange.
    WebSocket,
}

/// Identifies one transaction for the lifetime of its connection.
pub type TransactionId = u64;

/// What a transaction asked its connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Output that was not available before is now ready to be written.
    Resume,
    /// The request side has been fully parsed.
    RequestReady,
}

/// A queued notification from a transaction to its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub(crate) id: TransactionId,
    pub(crate) kind: SignalKind,
}

impl Signal {
    /// The transaction that raised this signal.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// What was asked for.
    pub fn kind(&self) -> SignalKind {
        self.kind
    }
}

/// A handle a transaction uses to wake its connection.
///
/// Notifying never calls back into the connection. The signal is queued and
/// dispatched once the call that raised it has returned, so a transaction may
/// notify from inside `write_response` without re-entering the write pump.
/// Signals from a transaction that is no longer active are ignored.
#[derive(Debug, Clone)]
pub struct Notifier {
    signal: Signal,
    sender: Sender<Signal>,
}

impl Notifier {
    pub(crate) fn new(id: TransactionId, kind: SignalKind, sender: Sender<Signal>) -> Self {
        Self {
            signal: Signal { id, kind },
            sender,
        }
    }

    /// Wake the connection.
    pub fn notify(&self) {
        if self.sender.try_send(self.signal).is_err() {
            log::trace!("connection gone, dropping {:?}", self.signal);
        }
    }
}

/// One HTTP exchange or WebSocket session, parsed and serialized by the
/// implementor and sequenced by a connection.
///
/// A connection only ever calls the role-appropriate half: a client writes
/// requests and reads responses, a server reads requests and writes
/// responses. Methods that only one role uses have no-op defaults.
pub trait Transaction: Sized {
    /// Whether this is an HTTP exchange or a WebSocket session.
    fn kind(&self) -> Kind;

    /// Feed bytes read from the stream into the request parser.
    fn read_request(&mut self, chunk: &[u8]);

    /// Feed bytes read from the stream into the response parser.
    fn read_response(&mut self, chunk: &[u8]);

    /// Produce the next chunk of request bytes. Empty when nothing is ready.
    fn write_request(&mut self) -> Vec<u8>;

    /// Produce the next chunk of response bytes. Empty when nothing is ready.
    fn write_response(&mut self) -> Vec<u8>;

    /// Whether the exchange has been fully processed.
    fn is_done(&self) -> bool;

    /// Register the handle to notify when more output becomes ready.
    fn on_resume(&mut self, notifier: Notifier);

    /// Register the handle to notify once the request is fully parsed.
    fn on_request_ready(&mut self, _notifier: Notifier) {}

    /// Record the local endpoint of the connection.
    fn set_local_addr(&mut self, _addr: SocketAddr) {}

    /// Record the remote endpoint of the connection.
    fn set_remote_addr(&mut self, _addr: SocketAddr) {}

    /// Mark the request scheme as `https`/`wss`.
    fn set_secure(&mut self) {}

    /// Stamp the response with a server identifier.
    fn set_server(&mut self, _name: &str) {}

    /// Mark this transaction as arriving on a reused connection.
    fn set_kept_alive(&mut self) {}

    /// Allow or forbid reusing the connection after this exchange.
    fn set_keep_alive(&mut self, _keep_alive: bool) {}

    /// Send `Connection: close` with the response.
    fn set_connection_close(&mut self) {}

    /// Whether the connection may carry another exchange after this one.
    fn is_keep_alive(&self) -> bool;

    /// The error recorded on this exchange, if any.
    fn error(&self) -> Option<&Error>;

    /// Record an error on this exchange.
    fn set_error(&mut self, error: Error);

    /// The response status, once known.
    fn status(&self) -> Option<StatusCode>;

    /// Whether the request could not be parsed.
    fn is_malformed(&self) -> bool {
        false
    }

    /// Bytes consumed from the stream past the end of this message.
    fn take_leftovers(&mut self) -> Vec<u8>;

    /// Settle the exchange before it is handed to the application.
    fn finalize(&mut self) {}

    /// Client side: the WebSocket session this finished exchange upgraded to.
    fn upgrade(&mut self) -> Option<Self> {
        None
    }

    /// Server side: the WebSocket session paired with a handshake request.
    fn websocket(&mut self) -> Option<Self> {
        None
    }

    /// WebSocket: the handshake completed and frames may flow.
    fn set_established(&mut self) {}

    /// WebSocket: write the application's handshake decision onto the
    /// response of the HTTP exchange that carried the handshake.
    fn accept_handshake(&mut self, _handshake: &mut Self) {}
}

/// The application side of a connection.
///
/// All methods default to doing nothing.
pub trait Handler<T> {
    /// Server: a request is ready to be answered.
    ///
    /// An ordinary response may be produced later, once the transaction
    /// notifies its connection. A WebSocket handshake is different: `txn` is
    /// the session paired with the handshake, and the decision to accept or
    /// refuse it must be made before this call returns. A session left
    /// without a decision answers the handshake with `400 Bad Request`.
    fn request(&mut self, _txn: &mut T) {}

    /// Client: the connection switched to a WebSocket session.
    fn upgrade(&mut self, _txn: &mut T) {}

    /// Both: the transaction completed and is handed over.
    fn finish(&mut self, _txn: T) {}
}

impl<T> Handler<T> for () {}

impl<T, H: Handler<T> + ?Sized> Handler<T> for &mut H {
    fn request(&mut self, txn: &mut T) {
        (**self).request(txn)
    }

    fn upgrade(&mut self, txn: &mut T) {
        (**self).upgrade(txn)
    }

    fn finish(&mut self, txn: T) {
        (**self).finish(txn)
    }
}
