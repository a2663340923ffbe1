//! Event-driven HTTP 1.1 connections.
//!
//! A connection owns one physical stream and sequences the exchanges that
//! run over it. It never touches a socket itself: whoever owns the socket
//! feeds it bytes with `read`, reports flushed writes with `written`, and
//! reports the peer hanging up with `closed`. Parsing and serializing is left
//! to a [`Transaction`].
//!
//! - `client` writes requests, and reads responses.
//! - `server` reads requests, and writes responses.
//!
//! ```txt
//!   write             read
//!        \            /
//!        -> request  ->
//! client                server
//!        <- response <-
//!        /            \
//!    read             write
//! ```
//!
//! Both roles support keep-alive and the switch to a WebSocket session. The
//! server also handles pipelined requests; the client enforces an optional
//! request timeout.
//!
//! [`server::accept`] and [`client::connect`] run a connection over any
//! `AsyncRead + AsyncWrite` stream using [`HttpTransaction`].
//!
//! # Example
//!
//! ```
//! use async_h1_conn::{Handler, HttpTransaction, Outbox, ServerConnection, Transport};
//! use http_types::StatusCode;
//!
//! struct Hello;
//!
//! impl Handler<HttpTransaction> for Hello {
//!     fn request(&mut self, txn: &mut HttpTransaction) {
//!         txn.respond(StatusCode::Ok, "hello");
//!     }
//! }
//!
//! let outbox = Outbox::new(Transport::Local);
//! let mut conn = ServerConnection::<HttpTransaction, _, _>::new(outbox, Hello);
//! conn.read(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n");
//!
//! let (bytes, _) = conn.stream_mut().take_written();
//! assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! ```

#![forbid(unsafe_code, future_incompatible, rust_2018_idioms)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]

/// The maximum amount of headers parsed per message.
const MAX_HEADERS: usize = 128;

/// The maximum length of a message head, in bytes.
const MAX_HEAD_LENGTH: usize = 8 * 1024;

mod chunked;
mod error;
mod outbox;
mod pump;
mod stream;
mod transaction;

pub mod client;
pub mod http;
pub mod server;

pub use client::{connect, ClientConnection, ClientOptions};
pub use error::Error;
pub use http::{HttpTransaction, Session};
pub use outbox::Outbox;
pub use server::{accept, ServerConnection, ServerOptions};
pub use stream::{Stream, TimeoutHandle, Timer, Transport};
pub use transaction::{Handler, Kind, Notifier, Signal, SignalKind, Transaction, TransactionId};
