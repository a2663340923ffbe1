//! A plain HTTP/1.1 transaction, and the WebSocket session it upgrades to.
//!
//! Bodies are framed by `content-length` or chunked transfer coding. A
//! response with neither is read until the stream closes. Outgoing bodies of
//! unknown length are sent chunked. WebSocket frames are passed through as
//! opaque bytes.

use std::convert::TryFrom;
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll, Wake, Waker};

use async_channel::{Receiver, Sender};
use async_dup::{Arc, Mutex};
use futures_lite::io::AsyncRead;
use http_types::headers::{
    HeaderName, HeaderValue, Headers, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, SERVER,
    TRANSFER_ENCODING, UPGRADE,
};
use http_types::{bail, ensure, format_err};
use http_types::{Body, Method, Request, Response, StatusCode, Trailers, Url, Version};

use crate::chunked::{self, ChunkedDecoder};
use crate::transaction::{Kind, Notifier, Transaction};
use crate::{Error, MAX_HEADERS, MAX_HEAD_LENGTH};

const CONTINUE_HEADER_VALUE: &str = "100-continue";
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Body bytes produced by one call to `write_request`/`write_response`.
const WRITE_CHUNK: usize = 16 * 1024;

/// The application's end of a WebSocket session.
///
/// Frames are opaque byte chunks; encoding them is up to the caller.
#[derive(Clone)]
pub struct Session {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
    resume: Arc<Mutex<Option<Notifier>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("queued", &self.outbound.len())
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

impl Session {
    /// Queue bytes for the peer. Returns `false` once the session is closed.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> bool {
        let sent = self.outbound.try_send(frame.into()).is_ok();
        self.wake();
        sent
    }

    /// Wait for the next bytes from the peer. `None` once the stream is gone.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound.recv().await.ok()
    }

    /// Take the next bytes from the peer if any have arrived.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }

    /// Stop sending. The session finishes once queued bytes are written.
    pub fn close(&self) {
        self.outbound.close();
        self.wake();
    }

    fn wake(&self) {
        if let Some(notifier) = &*self.resume.lock() {
            notifier.notify();
        }
    }
}

#[derive(Debug)]
struct Channels {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
    session: Session,
    established: bool,
}

impl Channels {
    fn new() -> Self {
        let (inbound, peer_inbound) = async_channel::unbounded();
        let (peer_outbound, outbound) = async_channel::unbounded();
        Self {
            inbound,
            outbound,
            session: Session {
                outbound: peer_outbound,
                inbound: peer_inbound,
                resume: Arc::new(Mutex::new(None)),
            },
            established: false,
        }
    }

    fn receive(&self, chunk: &[u8]) {
        if self.inbound.try_send(chunk.to_vec()).is_err() {
            log::trace!("session gone, dropping {} bytes", chunk.len());
        }
    }

    fn drain(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            buf.extend_from_slice(&frame);
        }
        buf
    }

    fn is_done(&self) -> bool {
        self.outbound.is_closed() && self.outbound.is_empty()
    }
}

/// Wakes the connection once a streaming body has more bytes.
struct ResumeWaker(Option<Notifier>);

impl Wake for ResumeWaker {
    fn wake(self: std::sync::Arc<Self>) {
        if let Some(resume) = &self.0 {
            resume.notify();
        }
    }
}

#[derive(Debug)]
enum Reading {
    Head,
    Body(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
    Done,
}

#[derive(Debug)]
enum Sending {
    /// Nothing written yet. The server waits here for a response.
    Head,
    Body { body: Body, chunked: bool },
    Done,
}

/// A plain HTTP/1.1 exchange.
///
/// On the server, `HttpTransaction::default()` parses a request and writes
/// whatever the handler passed to `respond`. On the client,
/// `HttpTransaction::new` sends a request and parses the response.
#[derive(Debug)]
pub struct HttpTransaction {
    kind: Kind,
    client: bool,
    request: Option<Request>,
    request_body: Vec<u8>,
    response: Option<Response>,
    response_body: Vec<u8>,
    trailers: Option<Trailers>,
    buf: Vec<u8>,
    reading: Reading,
    framed_by_close: bool,
    sending: Sending,
    continue_sent: bool,
    leftovers: Vec<u8>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    server: Option<String>,
    kept_alive: bool,
    keep_alive: bool,
    connection_close: bool,
    malformed: bool,
    error: Option<Error>,
    resume: Option<Notifier>,
    request_ready: Option<Notifier>,
    channels: Option<Channels>,
}

impl Default for HttpTransaction {
    fn default() -> Self {
        Self {
            kind: Kind::Http,
            client: false,
            request: None,
            request_body: Vec::new(),
            response: None,
            response_body: Vec::new(),
            trailers: None,
            buf: Vec::new(),
            reading: Reading::Head,
            framed_by_close: false,
            sending: Sending::Head,
            continue_sent: false,
            leftovers: Vec::new(),
            local_addr: None,
            remote_addr: None,
            secure: false,
            server: None,
            kept_alive: false,
            keep_alive: true,
            connection_close: false,
            malformed: false,
            error: None,
            resume: None,
            request_ready: None,
            channels: None,
        }
    }
}

impl HttpTransaction {
    /// Create a client exchange sending `req`.
    ///
    /// The `host` header is taken from the request URL.
    pub fn new(req: Request) -> Self {
        Self {
            client: true,
            request: Some(req),
            ..Self::default()
        }
    }

    fn websocket_session(client: bool) -> Self {
        Self {
            kind: Kind::WebSocket,
            client,
            reading: Reading::Done,
            sending: Sending::Done,
            channels: Some(Channels::new()),
            ..Self::default()
        }
    }

    /// Answer the request with `status` and `body`.
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Body>) {
        let mut res = Response::new(status);
        res.set_body(body);
        self.set_response(res);
    }

    /// Answer the request with `res`.
    ///
    /// A body without a known length is sent chunked, as its reader yields.
    pub fn set_response(&mut self, res: Response) {
        self.response = Some(res);
        if let Some(resume) = &self.resume {
            resume.notify();
        }
    }

    /// Accept a WebSocket handshake with `101 Switching Protocols`.
    ///
    /// Computing `sec-websocket-accept` is left to the caller, through
    /// `response_mut`.
    pub fn accept(&mut self) {
        let mut res = Response::new(StatusCode::SwitchingProtocols);
        res.insert_header(UPGRADE, "websocket");
        res.insert_header(CONNECTION, "Upgrade");
        self.set_response(res);
    }

    /// The request, once parsed or as built.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The request body received so far.
    pub fn request_body(&self) -> &[u8] {
        &self.request_body
    }

    /// The response, once parsed or set.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Mutable access to the response.
    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// The response body received so far.
    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    /// Trailer fields that followed a chunked body.
    pub fn trailers(&self) -> Option<&Trailers> {
        self.trailers.as_ref()
    }

    /// The local endpoint of the connection, unless it is local.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The remote endpoint of the connection, unless it is local.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// `https` on an encrypted connection, `http` otherwise.
    pub fn scheme(&self) -> &'static str {
        match (self.kind, self.secure) {
            (Kind::Http, false) => "http",
            (Kind::Http, true) => "https",
            (Kind::WebSocket, false) => "ws",
            (Kind::WebSocket, true) => "wss",
        }
    }

    /// Whether an earlier exchange ran on the same connection.
    pub fn is_kept_alive(&self) -> bool {
        self.kept_alive
    }

    /// The WebSocket session, if this is one.
    pub fn session(&self) -> Option<Session> {
        self.channels.as_ref().map(|channels| channels.session.clone())
    }

    /// Whether the WebSocket handshake has completed.
    pub fn is_established(&self) -> bool {
        self.channels
            .as_ref()
            .map_or(false, |channels| channels.established)
    }

    fn read_message(&mut self, chunk: &[u8]) {
        if let Reading::Done = self.reading {
            self.leftovers.extend_from_slice(chunk);
            return;
        }
        self.buf.extend_from_slice(chunk);

        loop {
            match self.reading {
                Reading::Head => {
                    let parsed = if self.client {
                        self.parse_response_head()
                    } else {
                        self.parse_request_head()
                    };
                    match parsed {
                        Ok(Some(next)) => self.reading = next,
                        Ok(None) => return,
                        Err(err) => return self.reject(err.to_string()),
                    }
                }
                Reading::Body(remaining) => {
                    let n = remaining.min(self.buf.len());
                    let bytes: Vec<u8> = self.buf.drain(..n).collect();
                    self.body_mut().extend_from_slice(&bytes);
                    if n < remaining {
                        self.reading = Reading::Body(remaining - n);
                        return;
                    }
                    self.reading = Reading::Done;
                }
                Reading::Chunked(_) => match self.read_chunked() {
                    Ok(true) => self.reading = Reading::Done,
                    Ok(false) => return,
                    Err(err) => return self.reject(err.to_string()),
                },
                Reading::UntilClose => {
                    let bytes = mem::take(&mut self.buf);
                    self.body_mut().extend_from_slice(&bytes);
                    return;
                }
                Reading::Done => {
                    self.leftovers = mem::take(&mut self.buf);
                    return self.message_complete();
                }
            }
        }
    }

    /// Decode buffered chunks. `true` once the last chunk has been read.
    fn read_chunked(&mut self) -> io::Result<bool> {
        let decoder = match &mut self.reading {
            Reading::Chunked(decoder) => decoder,
            _ => return Ok(true),
        };
        let body = if self.client {
            &mut self.response_body
        } else {
            &mut self.request_body
        };
        let consumed = decoder.decode(&self.buf, body)?;
        let done = decoder.is_done();
        if let Some(trailers) = decoder.take_trailers() {
            self.trailers = Some(trailers);
        }
        self.buf.drain(..consumed);
        Ok(done)
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        if self.client {
            &mut self.response_body
        } else {
            &mut self.request_body
        }
    }

    fn message_complete(&mut self) {
        if !self.client {
            if let Some(ready) = &self.request_ready {
                ready.notify();
            }
        }
    }

    fn reject(&mut self, reason: String) {
        log::debug!("malformed message: {}", reason);
        self.malformed = true;
        self.keep_alive = false;
        self.error = Some(Error::Malformed(reason));
        self.reading = Reading::Done;
        self.buf.clear();
        if !self.client {
            self.response = Some(Response::new(StatusCode::BadRequest));
            self.message_complete();
        }
    }

    fn parse_request_head(&mut self) -> http_types::Result<Option<Reading>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut httparse_req = httparse::Request::new(&mut headers);
        let consumed = match httparse_req.parse(&self.buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return head_incomplete(self.buf.len()),
        };

        let method = httparse_req
            .method
            .ok_or_else(|| format_err!("No method found"))?;
        let version = version_from(httparse_req.version)?;
        let url = self.url_from_httparse_req(&httparse_req, version)?;

        let mut req = Request::new(Method::from_str(method)?, url);
        req.set_version(Some(version));
        for header in httparse_req.headers.iter() {
            req.append_header(
                HeaderName::from_str(header.name)?,
                HeaderValue::from_str(std::str::from_utf8(header.value)?)?,
            );
        }

        let content_length = req.header(CONTENT_LENGTH);
        let transfer_encoding = req.header(TRANSFER_ENCODING);
        ensure!(
            content_length.is_none() || transfer_encoding.is_none(),
            "Unexpected Content-Length header"
        );
        let next = match transfer_encoding {
            Some(encoding) if is_chunked(encoding.last().as_str()) => {
                Reading::Chunked(ChunkedDecoder::new())
            }
            Some(encoding) => bail!("unsupported transfer-encoding {}", encoding.last()),
            None => match content_length_of(req.as_ref())? {
                Some(0) | None => Reading::Done,
                Some(len) => Reading::Body(len),
            },
        };

        self.buf.drain(..consumed);
        log::trace!("< {} {}", req.method(), req.url());
        self.request = Some(req);
        Ok(Some(next))
    }

    fn url_from_httparse_req(
        &self,
        req: &httparse::Request<'_, '_>,
        version: Version,
    ) -> http_types::Result<Url> {
        let path = req.path.ok_or_else(|| format_err!("No uri found"))?;

        let host = req
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("host"))
            .map(|header| std::str::from_utf8(header.value))
            .transpose()?;
        let host = match (host, version) {
            (Some(host), _) => host.to_owned(),
            (None, Version::Http1_0) => self
                .local_addr
                .map_or_else(|| "localhost".to_owned(), |addr| addr.to_string()),
            (None, _) => bail!("Mandatory Host header missing"),
        };

        if path.starts_with("http://") || path.starts_with("https://") {
            Ok(Url::parse(path)?)
        } else if path.starts_with('/') {
            Ok(Url::parse(&format!("{}://{}/", self.scheme(), host))?.join(path)?)
        } else if req.method.map_or(false, |method| method.eq_ignore_ascii_case("connect")) {
            Ok(Url::parse(&format!("{}://{}/", self.scheme(), path))?)
        } else {
            Err(format_err!("unexpected uri format"))
        }
    }

    fn parse_response_head(&mut self) -> http_types::Result<Option<Reading>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut httparse_res = httparse::Response::new(&mut headers);
        let consumed = match httparse_res.parse(&self.buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return head_incomplete(self.buf.len()),
        };

        let code = httparse_res
            .code
            .ok_or_else(|| format_err!("No status code found"))?;
        let status = StatusCode::try_from(code)?;
        let version = version_from(httparse_res.version)?;

        let mut res = Response::new(status);
        res.set_version(Some(version));
        for header in httparse_res.headers.iter() {
            res.append_header(
                HeaderName::from_str(header.name)?,
                HeaderValue::from_str(std::str::from_utf8(header.value)?)?,
            );
        }
        self.buf.drain(..consumed);

        if status.is_informational() && status != StatusCode::SwitchingProtocols {
            log::trace!("skipping interim {} response", status);
            return Ok(Some(Reading::Head));
        }

        let head_request = self
            .request
            .as_ref()
            .map_or(false, |req| req.method() == Method::Head);
        let next = if status == StatusCode::SwitchingProtocols
            || status == StatusCode::NoContent
            || status == StatusCode::NotModified
            || head_request
        {
            Reading::Done
        } else if let Some(encoding) = res.header(TRANSFER_ENCODING) {
            if is_chunked(encoding.last().as_str()) {
                Reading::Chunked(ChunkedDecoder::new())
            } else {
                Reading::UntilClose
            }
        } else {
            match content_length_of(res.as_ref())? {
                Some(0) => Reading::Done,
                Some(len) => Reading::Body(len),
                None => Reading::UntilClose,
            }
        };
        if let Reading::UntilClose = next {
            self.framed_by_close = true;
        }

        log::trace!("< {} {}", status, status.canonical_reason());
        self.response = Some(res);
        Ok(Some(next))
    }

    /// Whether the client is waiting for `100 Continue` before sending the
    /// request body.
    fn awaits_continue(&self) -> bool {
        if self.client || self.continue_sent || self.response.is_some() {
            return false;
        }
        if !matches!(self.reading, Reading::Body(_) | Reading::Chunked(_)) {
            return false;
        }
        self.request
            .as_ref()
            .and_then(|req| req.header(EXPECT))
            .map_or(false, |expect| {
                expect.last().as_str().eq_ignore_ascii_case(CONTINUE_HEADER_VALUE)
            })
    }

    fn write_message(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Sending::Head = self.sending {
            let encoded = if self.client {
                self.encode_request(&mut out)
            } else {
                self.encode_response(&mut out)
            };
            match encoded {
                Ok(Some(sending)) => self.sending = sending,
                Ok(None) => return out,
                Err(err) => {
                    self.write_failed(err);
                    return Vec::new();
                }
            }
        }
        self.poll_body(&mut out);
        out
    }

    /// Write the request head. Returns what to send after it.
    fn encode_request(&mut self, head: &mut Vec<u8>) -> io::Result<Option<Sending>> {
        let req = match self.request.as_mut() {
            Some(req) => req,
            None => return Ok(None),
        };

        let url = req.url();
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        write!(head, "{} {} HTTP/1.1\r\n", req.method(), target)?;
        log::trace!("> {} {}", req.method(), target);

        let mut skip = vec![CONTENT_LENGTH, TRANSFER_ENCODING];
        if let Some(host) = url.host_str() {
            match url.port() {
                Some(port) => write!(head, "host: {}:{}\r\n", host, port)?,
                None => write!(head, "host: {}\r\n", host)?,
            }
            skip.push(HOST);
        }

        let body = req.take_body();
        let chunked = body.len().is_none();
        match body.len() {
            Some(0) => {}
            Some(len) => write!(head, "content-length: {}\r\n", len)?,
            None => head.extend_from_slice(b"transfer-encoding: chunked\r\n"),
        }
        write_headers(head, req.as_ref(), &skip)?;
        head.extend_from_slice(b"\r\n");

        Ok(Some(match body.len() {
            Some(0) => Sending::Done,
            _ => Sending::Body { body, chunked },
        }))
    }

    /// Write the response head. `None` until a response has been set.
    fn encode_response(&mut self, head: &mut Vec<u8>) -> io::Result<Option<Sending>> {
        let keep_alive = self.is_keep_alive();
        let head_request = self
            .request
            .as_ref()
            .map_or(false, |req| req.method() == Method::Head);
        let res = match self.response.as_mut() {
            Some(res) => res,
            None => return Ok(None),
        };
        let status = res.status();

        write!(head, "HTTP/1.1 {} {}\r\n", status, status.canonical_reason())?;
        log::trace!("> {} {}", status, status.canonical_reason());

        if let Some(server) = &self.server {
            if res.header(SERVER).is_none() {
                write!(head, "server: {}\r\n", server)?;
            }
        }

        let body = res.take_body();
        let bodiless = status.is_informational()
            || status == StatusCode::NoContent
            || status == StatusCode::NotModified;
        let chunked = !bodiless && body.len().is_none();
        if !bodiless {
            match body.len() {
                Some(len) => write!(head, "content-length: {}\r\n", len)?,
                None => head.extend_from_slice(b"transfer-encoding: chunked\r\n"),
            }
        }

        let mut skip = vec![CONTENT_LENGTH, TRANSFER_ENCODING];
        if status != StatusCode::SwitchingProtocols && !keep_alive {
            head.extend_from_slice(b"connection: close\r\n");
            skip.push(CONNECTION);
        }
        write_headers(head, res.as_ref(), &skip)?;
        head.extend_from_slice(b"\r\n");

        Ok(Some(if bodiless || head_request {
            Sending::Done
        } else {
            Sending::Body { body, chunked }
        }))
    }

    /// Append whatever the outgoing body has ready to `out`.
    fn poll_body(&mut self, out: &mut Vec<u8>) {
        let waker = Waker::from(std::sync::Arc::new(ResumeWaker(self.resume.clone())));
        let mut cx = Context::from_waker(&waker);
        let mut buf = [0; WRITE_CHUNK];

        while out.len() < WRITE_CHUNK {
            let (body, chunked) = match &mut self.sending {
                Sending::Body { body, chunked } => (body, *chunked),
                _ => return,
            };
            match Pin::new(body).poll_read(&mut cx, &mut buf) {
                Poll::Pending => return,
                Poll::Ready(Ok(0)) => {
                    if chunked {
                        out.extend_from_slice(chunked::LAST_CHUNK);
                    }
                    self.sending = Sending::Done;
                }
                Poll::Ready(Ok(n)) if chunked => {
                    if let Err(err) = chunked::encode_chunk(&buf[..n], out) {
                        return self.write_failed(err);
                    }
                }
                Poll::Ready(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Poll::Ready(Err(err)) => return self.write_failed(err),
            }
        }
    }

    fn write_failed(&mut self, err: io::Error) {
        log::error!("failed to produce the outgoing message: {}", err);
        self.keep_alive = false;
        self.sending = Sending::Done;
        if self.error.is_none() {
            self.error = Some(Error::new(err.to_string(), None));
        }
    }

    fn is_handshake(&self) -> bool {
        self.request.as_ref().map_or(false, |req| {
            has_token(req.as_ref(), UPGRADE, "websocket")
                && has_token(req.as_ref(), CONNECTION, "upgrade")
        })
    }
}

fn head_incomplete(buffered: usize) -> http_types::Result<Option<Reading>> {
    // Prevent CWE-400 DDOS with large HTTP Headers.
    ensure!(
        buffered < MAX_HEAD_LENGTH,
        "Head byte length should be less than 8kb"
    );
    Ok(None)
}

fn version_from(version: Option<u8>) -> http_types::Result<Version> {
    match version {
        Some(0) => Ok(Version::Http1_0),
        Some(1) => Ok(Version::Http1_1),
        Some(minor) => bail!("Unsupported HTTP version 1.{}", minor),
        None => bail!("No version found"),
    }
}

fn is_chunked(encoding: &str) -> bool {
    encoding.trim().eq_ignore_ascii_case("chunked")
}

fn content_length_of(headers: &Headers) -> http_types::Result<Option<usize>> {
    match headers.get(CONTENT_LENGTH) {
        Some(len) => Ok(Some(len.last().as_str().trim().parse::<usize>()?)),
        None => Ok(None),
    }
}

/// Whether any value of `name` lists `token` among its comma separated
/// elements.
fn has_token(headers: &Headers, name: HeaderName, token: &str) -> bool {
    headers.get(name).map_or(false, |values| {
        values
            .iter()
            .flat_map(|value| value.as_str().split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    })
}

fn keeps_alive(version: Option<Version>, headers: &Headers) -> bool {
    if has_token(headers, CONNECTION, "close") {
        false
    } else if version == Some(Version::Http1_0) {
        has_token(headers, CONNECTION, "keep-alive")
    } else {
        true
    }
}

fn write_headers(head: &mut Vec<u8>, headers: &Headers, skip: &[HeaderName]) -> io::Result<()> {
    for (header, values) in headers.iter() {
        if skip.contains(header) {
            continue;
        }
        for value in values.iter() {
            write!(head, "{}: {}\r\n", header, value)?;
        }
    }
    Ok(())
}

impl Transaction for HttpTransaction {
    fn kind(&self) -> Kind {
        self.kind
    }

    fn read_request(&mut self, chunk: &[u8]) {
        match &self.channels {
            Some(channels) => channels.receive(chunk),
            None => self.read_message(chunk),
        }
    }

    fn read_response(&mut self, chunk: &[u8]) {
        match &self.channels {
            Some(channels) => channels.receive(chunk),
            None => self.read_message(chunk),
        }
    }

    fn write_request(&mut self) -> Vec<u8> {
        match &self.channels {
            Some(channels) => channels.drain(),
            None => self.write_message(),
        }
    }

    fn write_response(&mut self) -> Vec<u8> {
        if let Some(channels) = &self.channels {
            return channels.drain();
        }
        if self.awaits_continue() {
            log::trace!("> 100 Continue");
            self.continue_sent = true;
            return CONTINUE_RESPONSE.to_vec();
        }
        self.write_message()
    }

    fn is_done(&self) -> bool {
        let read = matches!(self.reading, Reading::Done);
        match &self.channels {
            Some(channels) => channels.is_done(),
            None if self.client => read,
            None => read && matches!(self.sending, Sending::Done),
        }
    }

    fn on_resume(&mut self, notifier: Notifier) {
        if let Some(channels) = &self.channels {
            *channels.session.resume.lock() = Some(notifier.clone());
        }
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
        if !self.keep_alive || self.connection_close || self.malformed || self.framed_by_close {
            return false;
        }
        let request = self
            .request
            .as_ref()
            .map_or(true, |req| keeps_alive(req.version(), req.as_ref()));
        let response = self
            .response
            .as_ref()
            .map_or(true, |res| keeps_alive(res.version(), res.as_ref()));
        request && response
    }

    fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|res| res.status())
    }

    fn is_malformed(&self) -> bool {
        self.malformed
    }

    fn take_leftovers(&mut self) -> Vec<u8> {
        mem::take(&mut self.leftovers)
    }

    fn finalize(&mut self) {
        if let Some(channels) = &self.channels {
            channels.inbound.close();
        }
        match self.reading {
            Reading::Done => {}
            Reading::UntilClose => self.reading = Reading::Done,
            Reading::Head | Reading::Body(_) | Reading::Chunked(_) => {
                if self.error.is_none() {
                    log::debug!("stream ended inside a message");
                    self.error = Some(Error::PrematureClose);
                }
                self.keep_alive = false;
                self.reading = Reading::Done;
            }
        }
    }

    fn upgrade(&mut self) -> Option<Self> {
        if self.kind != Kind::Http
            || !self.client
            || !self.is_handshake()
            || self.status() != Some(StatusCode::SwitchingProtocols)
        {
            return None;
        }

        let mut websocket = Self::websocket_session(true);
        websocket.request = self.request.clone();
        websocket.response = self.response.clone();
        websocket.local_addr = self.local_addr;
        websocket.remote_addr = self.remote_addr;
        websocket.set_established();
        Some(websocket)
    }

    fn websocket(&mut self) -> Option<Self> {
        if self.kind != Kind::Http || self.client || !self.is_handshake() {
            return None;
        }

        let mut websocket = Self::websocket_session(false);
        websocket.request = self.request.clone();
        websocket.local_addr = self.local_addr;
        websocket.remote_addr = self.remote_addr;
        websocket.secure = self.secure;
        websocket.server = self.server.clone();
        Some(websocket)
    }

    fn set_established(&mut self) {
        if let Some(channels) = self.channels.as_mut() {
            channels.established = true;
        }
    }

    fn accept_handshake(&mut self, handshake: &mut Self) {
        let decision = self
            .response
            .take()
            .unwrap_or_else(|| Response::new(StatusCode::BadRequest));
        self.response = Some(decision.clone());
        handshake.response = Some(decision);
    }
}
