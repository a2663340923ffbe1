//! Process HTTP connections on the client.

use std::time::Duration;

use async_channel::Receiver;
use futures_lite::io::{AsyncRead, AsyncWrite};
use http_types::format_err;

use crate::outbox::{self, Driven, Outbox};
use crate::pump::{self, Role, Signals, Slot, WriteGuard};
use crate::stream::{Stream, TimeoutHandle, Timer, Transport};
use crate::transaction::{Handler, Kind, Signal, SignalKind, Transaction};
use crate::Error;

/// Configure the client.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// How long to wait for the whole exchange. Defaults to waiting forever.
    request_timeout: Option<Duration>,
}

impl ClientOptions {
    /// Give up on the exchange after `timeout`. Zero waits forever.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = if timeout == Duration::from_secs(0) {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// The configured request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

/// The client end of one physical connection.
///
/// Drives one transaction at a time: the request is written as the
/// transaction produces it, the response is fed in as the stream delivers
/// it, and the transaction is handed to the handler once the response is
/// complete, the request timed out, or the stream closed. A response that
/// accepts a WebSocket handshake switches the connection over to the
/// WebSocket transaction for the rest of its life.
#[derive(Debug)]
pub struct ClientConnection<T, S, H> {
    stream: S,
    handler: H,
    opts: ClientOptions,
    active: Option<Slot<T>>,
    request_timeout: Option<TimeoutHandle>,
    guard: WriteGuard,
    closing: bool,
    signals: Signals,
}

impl<T, S, H> ClientConnection<T, S, H>
where
    T: Transaction,
    S: Stream + Timer,
    H: Handler<T>,
{
    /// Create a connection with default options.
    pub fn new(stream: S, handler: H) -> Self {
        Self::with_opts(stream, handler, ClientOptions::default())
    }

    /// Create a connection.
    pub fn with_opts(stream: S, handler: H, opts: ClientOptions) -> Self {
        Self {
            stream,
            handler,
            opts,
            active: None,
            request_timeout: None,
            guard: WriteGuard::new(),
            closing: false,
            signals: Signals::new(),
        }
    }

    /// Start driving `txn`.
    ///
    /// Hands the transaction back if another one is still active or the
    /// connection is closing.
    pub fn process(&mut self, mut txn: T) -> Result<(), T> {
        if self.active.is_some() || self.closing {
            log::debug!("connection busy, rejecting transaction");
            return Err(txn);
        }

        if let Some((local, peer)) = self.stream.transport().addrs() {
            txn.set_local_addr(local);
            txn.set_remote_addr(peer);
        }

        let id = self.signals.next_id();
        txn.on_resume(self.signals.notifier(id, SignalKind::Resume));
        self.active = Some(Slot { id, txn });

        if let Some(after) = self.opts.request_timeout {
            self.request_timeout = Some(self.stream.start(after));
        }

        self.pump();
        self.dispatch();
        Ok(())
    }

    /// Feed bytes read from the stream.
    pub fn read(&mut self, chunk: &[u8]) {
        let slot = match self.active.as_mut() {
            Some(slot) => slot,
            None => {
                log::trace!("no transaction, dropping {} bytes", chunk.len());
                return;
            }
        };

        log::trace!("< {} bytes", chunk.len());
        slot.txn.read_response(chunk);
        if slot.txn.is_done() {
            self.finish(false);
        }
        self.dispatch();
    }

    /// Report that a chunk written with `notify` has been flushed.
    pub fn written(&mut self) {
        self.pump();
        self.dispatch();
    }

    /// Report that the stream has closed.
    pub fn closed(&mut self) {
        log::debug!("stream closed");
        self.closing = true;
        self.finish(true);
        self.dispatch();
    }

    /// Report that the request timer expired.
    pub fn timeout(&mut self) {
        if self.request_timeout.take().is_none() {
            log::trace!("ignoring stale request timer");
            return;
        }

        log::debug!("request timed out");
        if let Some(slot) = self.active.as_mut() {
            slot.txn.set_error(Error::Timeout);
        }
        self.finish(true);
        self.dispatch();
    }

    /// Deliver a signal received from `signals()`, then any queued behind it.
    pub fn signal(&mut self, signal: Signal) {
        self.handle_signal(signal);
        self.dispatch();
    }

    /// The queue transactions signal through.
    ///
    /// Only needed when signals may be raised outside of calls into this
    /// connection, for instance by another task producing a body.
    pub fn signals(&self) -> Receiver<Signal> {
        self.signals.receiver()
    }

    /// The transaction currently being driven.
    pub fn transaction(&self) -> Option<&T> {
        self.active.as_ref().map(|slot| &slot.txn)
    }

    /// Mutable access to the transaction currently being driven.
    ///
    /// Changes that produce output must be followed by a `Resume` signal.
    pub fn transaction_mut(&mut self) -> Option<&mut T> {
        self.active.as_mut().map(|slot| &mut slot.txn)
    }

    /// Whether the connection has started closing.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Whether no transaction is being driven.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Get a reference to the stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Get a reference to the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Take the handler back.
    pub fn into_handler(self) -> H {
        self.handler
    }

    fn pump(&mut self) {
        if self.closing {
            return;
        }
        let txn = self.active.as_mut().map(|slot| &mut slot.txn);
        // The response side decides when a client exchange is over.
        pump::pump(Role::Client, &mut self.guard, txn, &mut self.stream);
    }

    fn dispatch(&mut self) {
        while let Some(signal) = self.signals.try_next() {
            self.handle_signal(signal);
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match &self.active {
            Some(slot) if slot.id == signal.id => {}
            _ => {
                log::trace!("ignoring {:?} from a finished transaction", signal);
                return;
            }
        }

        match signal.kind {
            SignalKind::Resume => self.pump(),
            SignalKind::RequestReady => {}
        }
    }

    fn close(&mut self) {
        if !self.closing {
            log::debug!("closing connection");
            self.closing = true;
            self.stream.close_gracefully();
        }
    }

    fn finish(&mut self, closed: bool) {
        if let Some(handle) = self.request_timeout.take() {
            self.stream.cancel(handle);
        }

        let mut txn = match self.active.take() {
            Some(slot) => slot.txn,
            None => {
                self.close();
                return;
            }
        };

        txn.finalize();
        // A peer hanging up ends a WebSocket session without an error.
        if closed
            && txn.kind() == Kind::Http
            && txn.status().is_none()
            && txn.error().is_none()
        {
            txn.set_error(Error::PrematureClose);
        }

        match txn.kind() {
            Kind::WebSocket => self.close(),
            Kind::Http => match txn.upgrade() {
                Some(websocket) if !self.closing => {
                    let leftovers = txn.take_leftovers();
                    self.upgrade(websocket, leftovers);
                }
                _ => {
                    if let Some(status) = txn.status() {
                        if (status.is_client_error() || status.is_server_error())
                            && txn.error().is_none()
                        {
                            txn.set_error(Error::Status(status));
                        }
                    }
                    if txn.error().is_some() || !txn.is_keep_alive() {
                        self.close();
                    }
                }
            },
        }

        log::debug!("transaction finished");
        self.handler.finish(txn);

        // Leftovers fed to an upgrade may already have completed it.
        if self.active.as_ref().map_or(false, |slot| slot.txn.is_done()) {
            self.finish(closed);
        }
    }

    fn upgrade(&mut self, mut websocket: T, leftovers: Vec<u8>) {
        log::debug!("upgrading connection to websocket");
        let id = self.signals.next_id();
        websocket.on_resume(self.signals.notifier(id, SignalKind::Resume));

        let slot = self.active.get_or_insert(Slot { id, txn: websocket });
        self.handler.upgrade(&mut slot.txn);
        if !leftovers.is_empty() {
            log::trace!("feeding {} leftover bytes to websocket", leftovers.len());
            slot.txn.read_response(&leftovers);
        }
        self.pump();
    }
}

impl<T, H> Driven for ClientConnection<T, Outbox, H>
where
    T: Transaction,
    H: Handler<T>,
{
    fn outbox(&mut self) -> &mut Outbox {
        &mut self.stream
    }

    fn signals(&self) -> Receiver<Signal> {
        ClientConnection::signals(self)
    }

    fn read(&mut self, chunk: &[u8]) {
        ClientConnection::read(self, chunk)
    }

    fn written(&mut self) {
        ClientConnection::written(self)
    }

    fn closed(&mut self) {
        ClientConnection::closed(self)
    }

    fn timeout(&mut self) {
        ClientConnection::timeout(self)
    }

    fn signal(&mut self, signal: Signal) {
        ClientConnection::signal(self, signal)
    }

    fn is_done(&self) -> bool {
        self.closing || self.active.is_none()
    }
}

/// Opens an HTTP/1.1 connection to a remote host.
///
/// Drives `txn` over `io` until it finishes, following a WebSocket upgrade
/// through to the end of the session. Returns the handler, which has been
/// given the finished transactions.
pub async fn connect<RW, T, H>(io: RW, txn: T, handler: H) -> http_types::Result<H>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    T: Transaction,
    H: Handler<T>,
{
    connect_with_opts(io, txn, handler, ClientOptions::default(), Transport::Local).await
}

/// Opens an HTTP/1.1 connection to a remote host.
pub async fn connect_with_opts<RW, T, H>(
    io: RW,
    txn: T,
    handler: H,
    opts: ClientOptions,
    transport: Transport,
) -> http_types::Result<H>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    T: Transaction,
    H: Handler<T>,
{
    let mut conn = ClientConnection::with_opts(Outbox::new(transport), handler, opts);
    if conn.process(txn).is_err() {
        return Err(format_err!("fresh connection refused the transaction"));
    }
    outbox::drive(&mut conn, io).await?;
    Ok(conn.into_handler())
}
