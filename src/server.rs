//! Process HTTP connections on the server.

use std::fmt;
use std::mem;

use async_channel::Receiver;
use futures_lite::io::{AsyncRead, AsyncWrite};
use http_types::StatusCode;

use crate::http::HttpTransaction;
use crate::outbox::{self, Driven, Outbox};
use crate::pump::{self, Pumped, Role, Signals, Slot, WriteGuard};
use crate::stream::{Stream, Transport};
use crate::transaction::{Handler, Kind, Signal, SignalKind, Transaction, TransactionId};
use crate::Error;

/// The default cap on transactions served over one connection.
const DEFAULT_MAX_REQUESTS: usize = 100;

/// The default value stamped into the `server` response header.
const DEFAULT_SERVER_NAME: &str = "async-h1-conn";

/// Configure the server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Transactions served before the connection is closed. Defaults to 100.
    max_requests: usize,
    /// Identifier stamped on every response.
    server_name: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            server_name: DEFAULT_SERVER_NAME.to_owned(),
        }
    }
}

impl ServerOptions {
    /// Close the connection after `max_requests` transactions.
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Stamp responses with `name`.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// The configured request cap.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// The configured server identifier.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

enum State<T> {
    Idle,
    Active(Slot<T>),
    /// A handshake response is being written by `http`; `websocket` takes
    /// over once it is out, if the handshake was accepted.
    PendingUpgrade {
        http: Slot<T>,
        websocket: Slot<T>,
    },
}

impl<T> State<T> {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::Active(_) => "Active",
            State::PendingUpgrade { .. } => "PendingUpgrade",
        }
    }
}

/// The server end of one physical connection.
///
/// Builds a transaction for each request arriving on the stream, hands it to
/// the handler once its request is parsed, writes its response, and either
/// moves on to the next request, switches to a WebSocket session, or closes
/// the stream.
pub struct ServerConnection<T, S, H> {
    stream: S,
    handler: H,
    factory: Box<dyn FnMut() -> T>,
    opts: ServerOptions,
    state: State<T>,
    request_count: usize,
    /// The transaction last handed to `Handler::request`.
    surfaced: Option<TransactionId>,
    guard: WriteGuard,
    closing: bool,
    signals: Signals,
}

impl<T, S: fmt::Debug, H> fmt::Debug for ServerConnection<T, S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("stream", &self.stream)
            .field("opts", &self.opts)
            .field("state", &self.state.name())
            .field("request_count", &self.request_count)
            .field("closing", &self.closing)
            .finish()
    }
}

impl<T, S, H> ServerConnection<T, S, H>
where
    T: Transaction + Default + 'static,
    S: Stream,
    H: Handler<T>,
{
    /// Create a connection building `T::default()` transactions.
    pub fn new(stream: S, handler: H) -> Self {
        Self::with_opts(stream, handler, ServerOptions::default())
    }

    /// Create a connection building `T::default()` transactions.
    pub fn with_opts(stream: S, handler: H, opts: ServerOptions) -> Self {
        Self::with_factory(stream, handler, opts, T::default)
    }
}

impl<T, S, H> ServerConnection<T, S, H>
where
    T: Transaction,
    S: Stream,
    H: Handler<T>,
{
    /// Create a connection building transactions with `factory`.
    pub fn with_factory<F>(stream: S, handler: H, opts: ServerOptions, factory: F) -> Self
    where
        F: FnMut() -> T + 'static,
    {
        Self {
            stream,
            handler,
            factory: Box::new(factory),
            opts,
            state: State::Idle,
            request_count: 0,
            surfaced: None,
            guard: WriteGuard::new(),
            closing: false,
            signals: Signals::new(),
        }
    }

    /// Feed bytes read from the stream.
    pub fn read(&mut self, chunk: &[u8]) {
        if self.closing {
            log::trace!("closing, dropping {} bytes", chunk.len());
            return;
        }
        log::trace!("< {} bytes", chunk.len());
        self.feed(chunk);
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

        let (active, pending) = match mem::replace(&mut self.state, State::Idle) {
            State::Idle => (None, None),
            State::Active(slot) => (Some(slot), None),
            State::PendingUpgrade { http, websocket } => (Some(http), Some(websocket)),
        };
        if pending.is_some() {
            log::warn!("dropping websocket session, handshake never completed");
        }

        if let Some(mut slot) = active {
            if self.surfaced == Some(slot.id) {
                slot.txn.finalize();
                // A peer hanging up ends a WebSocket session without an error.
                if slot.txn.kind() == Kind::Http && slot.txn.error().is_none() {
                    slot.txn.set_error(Error::PrematureClose);
                }
                self.handler.finish(slot.txn);
            } else {
                log::trace!("dropping transaction with an incomplete request");
            }
        }
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
    /// connection, for instance by another task producing a response.
    pub fn signals(&self) -> Receiver<Signal> {
        self.signals.receiver()
    }

    /// How many transactions this connection has built.
    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// The transaction currently reading or writing.
    pub fn transaction(&self) -> Option<&T> {
        match &self.state {
            State::Active(slot) | State::PendingUpgrade { http: slot, .. } => Some(&slot.txn),
            State::Idle => None,
        }
    }

    /// Mutable access to the transaction currently reading or writing.
    pub fn transaction_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            State::Active(slot) | State::PendingUpgrade { http: slot, .. } => Some(&mut slot.txn),
            State::Idle => None,
        }
    }

    /// Whether a WebSocket session is waiting for its handshake to be written.
    pub fn is_upgrade_pending(&self) -> bool {
        matches!(self.state, State::PendingUpgrade { .. })
    }

    /// Whether the connection has started closing.
    pub fn is_closing(&self) -> bool {
        self.closing
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

    fn build_transaction(&mut self) -> Slot<T> {
        let mut txn = (self.factory)();
        txn.set_server(&self.opts.server_name);

        let transport = self.stream.transport();
        if let Some((local, peer)) = transport.addrs() {
            txn.set_local_addr(local);
            txn.set_remote_addr(peer);
        }
        if transport.is_secure() {
            txn.set_secure();
        }

        // Every request counts toward the cap, keep-alive or not.
        self.request_count += 1;
        if self.request_count >= self.opts.max_requests {
            txn.set_keep_alive(false);
        }

        let id = self.signals.next_id();
        txn.on_request_ready(self.signals.notifier(id, SignalKind::RequestReady));
        if self.request_count > 1 {
            txn.set_kept_alive();
        }

        log::trace!(
            "built transaction {} of {}",
            self.request_count,
            self.opts.max_requests
        );
        Slot { id, txn }
    }

    fn feed(&mut self, chunk: &[u8]) {
        if let State::Idle = self.state {
            self.state = State::Active(self.build_transaction());
        }

        if let State::Active(slot) | State::PendingUpgrade { http: slot, .. } = &mut self.state {
            slot.txn.read_request(chunk);
        }
        // Reading may have made output ready, such as an interim response.
        self.pump();
    }

    fn pump(&mut self) {
        if self.closing {
            return;
        }
        let txn = match &mut self.state {
            State::Active(slot) | State::PendingUpgrade { http: slot, .. } => Some(&mut slot.txn),
            State::Idle => None,
        };
        if pump::pump(Role::Server, &mut self.guard, txn, &mut self.stream) == Pumped::Done {
            self.finish();
        }
    }

    fn dispatch(&mut self) {
        while let Some(signal) = self.signals.try_next() {
            self.handle_signal(signal);
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        let current = match &self.state {
            State::Active(slot) | State::PendingUpgrade { http: slot, .. } => slot.id,
            State::Idle => return,
        };
        if current != signal.id {
            log::trace!("ignoring {:?} from a finished transaction", signal);
            return;
        }

        match signal.kind {
            SignalKind::Resume => self.pump(),
            SignalKind::RequestReady if self.surfaced != Some(signal.id) => self.request_ready(),
            SignalKind::RequestReady => {}
        }
    }

    fn request_ready(&mut self) {
        let mut http = match mem::replace(&mut self.state, State::Idle) {
            State::Active(slot) => slot,
            other => {
                self.state = other;
                return;
            }
        };
        self.surfaced = Some(http.id);
        let last = self.request_count >= self.opts.max_requests;

        let websocket = match http.txn.kind() {
            Kind::Http => http.txn.websocket(),
            Kind::WebSocket => None,
        };
        let pending = match websocket {
            Some(mut websocket) => {
                log::debug!("websocket handshake requested");
                let id = self.signals.next_id();
                // The decision has to be made inside `request`.
                self.handler.request(&mut websocket);
                websocket.accept_handshake(&mut http.txn);
                Some(Slot { id, txn: websocket })
            }
            None => {
                self.handler.request(&mut http.txn);
                None
            }
        };

        if last || http.txn.is_malformed() {
            http.txn.set_connection_close();
        }
        http.txn
            .on_resume(self.signals.notifier(http.id, SignalKind::Resume));

        self.state = match pending {
            Some(websocket) => State::PendingUpgrade { http, websocket },
            None => State::Active(http),
        };
        self.pump();
    }

    fn close(&mut self) {
        if !self.closing {
            log::debug!("closing connection");
            self.closing = true;
            self.stream.close_gracefully();
        }
    }

    fn finish(&mut self) {
        let (mut txn, pending) = match mem::replace(&mut self.state, State::Idle) {
            State::Idle => return,
            State::Active(slot) => (slot.txn, None),
            State::PendingUpgrade { http, websocket } => (http.txn, Some(websocket)),
        };

        if let Kind::WebSocket = txn.kind() {
            log::debug!("websocket session finished");
            self.close();
            txn.finalize();
            self.handler.finish(txn);
            return;
        }

        txn.finalize();
        let leftovers = txn.take_leftovers();

        if let Some(mut websocket) = pending {
            if txn.status() == Some(StatusCode::SwitchingProtocols) {
                self.handler.finish(txn);
                self.promote(websocket, leftovers);
                return;
            }
            log::warn!("websocket handshake rejected with {:?}", txn.status());
            websocket.txn.set_error(Error::HandshakeRejected);
            websocket.txn.finalize();
        }

        if txn.error().is_some() || !txn.is_keep_alive() {
            self.close();
            self.handler.finish(txn);
            return;
        }

        self.handler.finish(txn);
        if !leftovers.is_empty() {
            log::trace!("{} pipelined bytes, starting next transaction", leftovers.len());
            self.feed(&leftovers);
        }
    }

    fn promote(&mut self, websocket: Slot<T>, leftovers: Vec<u8>) {
        log::debug!("handshake accepted, switching to websocket");
        let Slot { id, mut txn } = websocket;
        txn.set_established();
        txn.on_resume(self.signals.notifier(id, SignalKind::Resume));
        self.surfaced = Some(id);
        self.state = State::Active(Slot { id, txn });

        if !leftovers.is_empty() {
            self.feed(&leftovers);
        }
        self.pump();
    }
}

impl<T, H> Driven for ServerConnection<T, Outbox, H>
where
    T: Transaction,
    H: Handler<T>,
{
    fn outbox(&mut self) -> &mut Outbox {
        &mut self.stream
    }

    fn signals(&self) -> Receiver<Signal> {
        ServerConnection::signals(self)
    }

    fn read(&mut self, chunk: &[u8]) {
        ServerConnection::read(self, chunk)
    }

    fn written(&mut self) {
        ServerConnection::written(self)
    }

    fn closed(&mut self) {
        ServerConnection::closed(self)
    }

    fn timeout(&mut self) {}

    fn signal(&mut self, signal: Signal) {
        ServerConnection::signal(self, signal)
    }

    fn is_done(&self) -> bool {
        self.closing
    }
}

/// Accept a new incoming HTTP/1.1 connection.
///
/// Supports `KeepAlive` and pipelined requests by default. Returns the
/// handler once the connection has closed.
pub async fn accept<RW, H>(io: RW, handler: H) -> http_types::Result<H>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    H: Handler<HttpTransaction>,
{
    accept_with_opts(io, handler, ServerOptions::default(), Transport::Local).await
}

/// Accept a new incoming HTTP/1.1 connection.
pub async fn accept_with_opts<RW, H>(
    io: RW,
    handler: H,
    opts: ServerOptions,
    transport: Transport,
) -> http_types::Result<H>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    H: Handler<HttpTransaction>,
{
    accept_with_factory(io, handler, opts, transport, HttpTransaction::default).await
}

/// Accept a new incoming HTTP/1.1 connection, building transactions with
/// `factory`.
pub async fn accept_with_factory<RW, T, H, F>(
    io: RW,
    handler: H,
    opts: ServerOptions,
    transport: Transport,
    factory: F,
) -> http_types::Result<H>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    T: Transaction,
    H: Handler<T>,
    F: FnMut() -> T + 'static,
{
    let mut conn = ServerConnection::with_factory(Outbox::new(transport), handler, opts, factory);
    outbox::drive(&mut conn, io).await?;
    Ok(conn.into_handler())
}
