#![allow(dead_code)]

use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_dup::{Arc, Mutex};
use async_h1_conn::{
    Error, Handler, Kind, Notifier, Stream, TimeoutHandle, Timer, Transaction, Transport,
};
use async_std::io::{Read, Write};
use http_types::StatusCode;

/// A transaction whose reads and writes are scripted by the test.
///
/// The message is complete once `expect` bytes have been read; anything past
/// that is kept as leftovers.
#[derive(Debug)]
pub struct MockTransaction {
    pub tag: &'static str,
    pub kind: Kind,
    pub expect: usize,
    pub received: Vec<u8>,
    pub leftovers: Vec<u8>,
    pub complete: bool,
    pub output: VecDeque<Vec<u8>>,
    pub responded: bool,
    pub status: Option<StatusCode>,
    pub keep_alive: bool,
    pub error: Option<Error>,
    pub malformed: bool,
    pub upgrade_to: Option<Box<MockTransaction>>,
    pub websocket: Option<Box<MockTransaction>>,
    pub notify_inside_write: bool,
    pub write_calls: usize,
    pub resume: Option<Notifier>,
    pub request_ready: Option<Notifier>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub secure: bool,
    pub server: Option<String>,
    pub kept_alive: bool,
    pub connection_close: bool,
    pub finalized: bool,
    pub established: bool,
}

impl MockTransaction {
    fn new(tag: &'static str, kind: Kind) -> Self {
        Self {
            tag,
            kind,
            expect: 0,
            received: Vec::new(),
            leftovers: Vec::new(),
            complete: false,
            output: VecDeque::new(),
            responded: false,
            status: None,
            keep_alive: true,
            error: None,
            malformed: false,
            upgrade_to: None,
            websocket: None,
            notify_inside_write: false,
            write_calls: 0,
            resume: None,
            request_ready: None,
            local_addr: None,
            remote_addr: None,
            secure: false,
            server: None,
            kept_alive: false,
            connection_close: false,
            finalized: false,
            established: false,
        }
    }

    /// A client exchange sending `request` and expecting a response of
    /// `expect` bytes.
    pub fn client(tag: &'static str, request: &str, expect: usize) -> Self {
        let mut txn = Self::new(tag, Kind::Http);
        txn.output.push_back(request.as_bytes().to_vec());
        txn.expect = expect;
        txn.responded = true;
        txn
    }

    /// A server exchange expecting a request of `expect` bytes.
    pub fn server(tag: &'static str, expect: usize) -> Self {
        let mut txn = Self::new(tag, Kind::Http);
        txn.expect = expect;
        txn
    }

    /// A WebSocket session that finishes once the test calls `respond`.
    pub fn websocket(tag: &'static str) -> Self {
        let mut txn = Self::new(tag, Kind::WebSocket);
        txn.complete = true;
        txn
    }

    /// Queue the response and wake the connection.
    pub fn respond(&mut self, status: StatusCode, chunks: &[&str]) {
        self.status = Some(status);
        self.output
            .extend(chunks.iter().map(|chunk| chunk.as_bytes().to_vec()));
        self.responded = true;
        if let Some(resume) = &self.resume {
            resume.notify();
        }
    }

    fn read(&mut self, chunk: &[u8]) {
        if self.complete {
            if self.kind == Kind::WebSocket {
                self.received.extend_from_slice(chunk);
            } else {
                self.leftovers.extend_from_slice(chunk);
            }
            return;
        }

        let wanted = self.expect - self.received.len();
        if chunk.len() < wanted {
            self.received.extend_from_slice(chunk);
            return;
        }
        self.received.extend_from_slice(&chunk[..wanted]);
        self.leftovers.extend_from_slice(&chunk[wanted..]);
        self.complete = true;
        if let Some(ready) = &self.request_ready {
            ready.notify();
        }
    }

    fn write(&mut self) -> Vec<u8> {
        self.write_calls += 1;
        if self.notify_inside_write {
            if let Some(resume) = &self.resume {
                resume.notify();
            }
        }
        self.output.pop_front().unwrap_or_default()
    }

    pub fn received(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }
}

impl Transaction for MockTransaction {
    fn kind(&self) -> Kind {
        self.kind
    }

    fn read_request(&mut self, chunk: &[u8]) {
        self.read(chunk)
    }

    fn read_response(&mut self, chunk: &[u8]) {
        self.read(chunk)
    }

    fn write_request(&mut self) -> Vec<u8> {
        self.write()
    }

    fn write_response(&mut self) -> Vec<u8> {
        self.write()
    }

    fn is_done(&self) -> bool {
        self.complete && self.responded && self.output.is_empty()
    }

    fn on_resume(&mut self, notifier: Notifier) {
        self.resume = Some(notifier);
    }

    fn on_request_ready(&mut self, notifier: Notifier) {
        self.request_ready = Some(notifier);
    }

    fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
    }

    fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    fn set_secure(&mut self) {
        self.secure = true;
    }

    fn set_server(&mut self, name: &str) {
        self.server = Some(name.to_owned());
    }

    fn set_kept_alive(&mut self) {
        self.kept_alive = true;
    }

    fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    fn set_connection_close(&mut self) {
        self.connection_close = true;
    }

    fn is_keep_alive(&self) -> bool {
        self.keep_alive && !self.connection_close
    }

    fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }

    fn is_malformed(&self) -> bool {
        self.malformed
    }

    fn take_leftovers(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.leftovers)
    }

    fn finalize(&mut self) {
        self.finalized = true;
    }

    fn upgrade(&mut self) -> Option<Self> {
        self.upgrade_to.take().map(|txn| *txn)
    }

    fn websocket(&mut self) -> Option<Self> {
        self.websocket.take().map(|txn| *txn)
    }

    fn set_established(&mut self) {
        self.established = true;
    }

    fn accept_handshake(&mut self, handshake: &mut Self) {
        let status = self.status.unwrap_or(StatusCode::BadRequest);
        handshake.respond(status, &["handshake"]);
    }
}

/// What the connection told the application, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(&'static str),
    Upgrade(&'static str),
    Finish(&'static str),
}

/// A handler recording every event and keeping finished transactions.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub finished: Vec<MockTransaction>,
    pub on_request: Option<Box<dyn FnMut(&mut MockTransaction)>>,
}

impl Recorder {
    /// Answer every request with `status` and `chunks`.
    pub fn responding(status: StatusCode, chunks: &'static [&'static str]) -> Self {
        Self {
            on_request: Some(Box::new(move |txn| txn.respond(status, chunks))),
            ..Self::default()
        }
    }

    pub fn finished(&self, tag: &str) -> &MockTransaction {
        self.finished
            .iter()
            .find(|txn| txn.tag == tag)
            .unwrap_or_else(|| panic!("{} never finished", tag))
    }
}

impl Handler<MockTransaction> for Recorder {
    fn request(&mut self, txn: &mut MockTransaction) {
        self.events.push(Event::Request(txn.tag));
        if let Some(on_request) = self.on_request.as_mut() {
            on_request(txn);
        }
    }

    fn upgrade(&mut self, txn: &mut MockTransaction) {
        self.events.push(Event::Upgrade(txn.tag));
    }

    fn finish(&mut self, txn: MockTransaction) {
        self.events.push(Event::Finish(txn.tag));
        self.finished.push(txn);
    }
}

/// A stream and timer recording everything the connection asked for.
#[derive(Debug, Default)]
pub struct RecordingStream {
    pub transport: Transport,
    pub writes: Vec<Vec<u8>>,
    pub closes: usize,
    pub graceful_closes: usize,
    pub timers_started: Vec<Duration>,
    pub timers_cancelled: usize,
    pub armed: Option<u64>,
    next_timer: u64,
}

impl RecordingStream {
    pub fn with_transport(transport: Transport) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    pub fn written(&self) -> String {
        let bytes: Vec<u8> = self.writes.iter().flatten().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closes + self.graceful_closes > 0
    }
}

impl Stream for RecordingStream {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn write(&mut self, chunk: Vec<u8>, notify: bool) {
        assert!(notify, "connection writes always ask to be notified");
        self.writes.push(chunk);
    }

    fn close(&mut self) {
        self.closes += 1;
    }

    fn close_gracefully(&mut self) {
        self.graceful_closes += 1;
    }
}

impl Timer for RecordingStream {
    fn start(&mut self, after: Duration) -> TimeoutHandle {
        self.next_timer += 1;
        self.timers_started.push(after);
        self.armed = Some(self.next_timer);
        TimeoutHandle::new(self.next_timer)
    }

    fn cancel(&mut self, handle: TimeoutHandle) {
        assert_eq!(self.armed, Some(handle.id()), "cancelled a stale timer");
        self.armed = None;
        self.timers_cancelled += 1;
    }
}

/// An in-memory duplex: whatever one end writes, the other end reads.
#[derive(Clone, Debug)]
pub struct TestIO {
    pub read: Arc<Pipe>,
    pub write: Arc<Pipe>,
}

impl TestIO {
    pub fn new() -> (TestIO, TestIO) {
        let client = Arc::new(Pipe::default());
        let server = Arc::new(Pipe::default());
        (
            TestIO {
                read: client.clone(),
                write: server.clone(),
            },
            TestIO {
                read: server,
                write: client,
            },
        )
    }

    /// Stop writing. The other end reads EOF once it has drained the pipe.
    pub fn close(&mut self) {
        self.write.close();
    }
}

/// One direction of a `TestIO`. Keeps every byte written, for assertions.
#[derive(Default)]
pub struct Pipe {
    state: Mutex<PipeState>,
}

#[derive(Default)]
struct PipeState {
    data: Vec<u8>,
    cursor: usize,
    closed: bool,
    waker: Option<Waker>,
}

impl Pipe {
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.write_str(&String::from_utf8_lossy(&state.data))
    }
}

impl Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pipe")
            .field("data", &String::from_utf8_lossy(&state.data))
            .field("cursor", &state.cursor)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Read for TestIO {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.read.state.lock();
        let start = state.cursor;
        let n = buf.len().min(state.data.len() - start);
        if n > 0 {
            buf[..n].copy_from_slice(&state.data[start..start + n]);
            state.cursor += n;
            Poll::Ready(Ok(n))
        } else if state.closed {
            Poll::Ready(Ok(0))
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Write for TestIO {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.write.state.lock();
        if state.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        state.data.extend_from_slice(buf);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write.close();
        Poll::Ready(Ok(()))
    }
}
