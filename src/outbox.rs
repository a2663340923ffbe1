//! Run a connection over an async byte stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use async_io::Timer as AsyncTimer;
use futures_lite::future::{self, FutureExt};
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::stream::{Stream, TimeoutHandle, Timer, Transport};
use crate::transaction::Signal;

/// Size of the buffer reads from the stream land in.
const READ_BUF_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub(crate) enum Op {
    Write { chunk: Vec<u8>, notify: bool },
    Close,
    CloseGracefully,
}

/// A `Stream` and `Timer` that records what the connection asked for.
///
/// The async drivers in `client` and `server` flush it against a real
/// stream. It can also be used directly to drive a connection by hand.
#[derive(Debug, Default)]
pub struct Outbox {
    transport: Transport,
    ops: VecDeque<Op>,
    timer: Option<(u64, Instant)>,
    next_timer: u64,
}

impl Outbox {
    /// Create an empty outbox for a stream over `transport`.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            ..Default::default()
        }
    }

    /// Take every byte queued for writing, in order.
    ///
    /// Returns the bytes and how many of the chunks asked to be reported
    /// through `written()`.
    pub fn take_written(&mut self) -> (Vec<u8>, usize) {
        let mut bytes = Vec::new();
        let mut notify_count = 0;
        let mut rest = VecDeque::new();
        while let Some(op) = self.ops.pop_front() {
            match op {
                Op::Write { chunk, notify } => {
                    bytes.extend_from_slice(&chunk);
                    if notify {
                        notify_count += 1;
                    }
                }
                op => rest.push_back(op),
            }
        }
        self.ops = rest;
        (bytes, notify_count)
    }

    /// Whether the connection asked for the stream to be closed.
    pub fn is_closed(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::Close | Op::CloseGracefully))
    }

    /// When the armed timer expires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.map(|(_, at)| at)
    }

    pub(crate) fn pop(&mut self) -> Option<Op> {
        self.ops.pop_front()
    }

    pub(crate) fn expire(&mut self) {
        self.timer = None;
    }
}

impl Stream for Outbox {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn write(&mut self, chunk: Vec<u8>, notify: bool) {
        self.ops.push_back(Op::Write { chunk, notify });
    }

    fn close(&mut self) {
        self.ops.clear();
        self.ops.push_back(Op::Close);
    }

    fn close_gracefully(&mut self) {
        self.ops.push_back(Op::CloseGracefully);
    }
}

impl Timer for Outbox {
    fn start(&mut self, after: Duration) -> TimeoutHandle {
        self.next_timer += 1;
        self.timer = Some((self.next_timer, Instant::now() + after));
        TimeoutHandle::new(self.next_timer)
    }

    fn cancel(&mut self, handle: TimeoutHandle) {
        if self.timer.map(|(id, _)| id) == Some(handle.id()) {
            self.timer = None;
        }
    }
}

/// A connection that can be run by `drive`.
pub(crate) trait Driven {
    fn outbox(&mut self) -> &mut Outbox;
    fn signals(&self) -> Receiver<Signal>;
    fn read(&mut self, chunk: &[u8]);
    fn written(&mut self);
    fn closed(&mut self);
    fn timeout(&mut self);
    fn signal(&mut self, signal: Signal);
    /// Whether the driver should stop once the outbox is flushed.
    fn is_done(&self) -> bool;
}

enum Event {
    Read(std::io::Result<usize>),
    Signal(Signal),
    Timeout,
}

/// Pump events between `io` and `conn` until the connection is done.
pub(crate) async fn drive<C, RW>(conn: &mut C, mut io: RW) -> http_types::Result<()>
where
    C: Driven,
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let signals = conn.signals();
    let mut buf = vec![0; READ_BUF_SIZE];

    loop {
        while let Some(op) = conn.outbox().pop() {
            match op {
                Op::Write { chunk, notify } => {
                    io.write_all(&chunk).await?;
                    if notify {
                        conn.written();
                    }
                }
                Op::Close | Op::CloseGracefully => {
                    log::trace!("closing stream");
                    io.flush().await?;
                    io.close().await?;
                    return Ok(());
                }
            }
        }
        io.flush().await?;

        if conn.is_done() {
            return Ok(());
        }

        let deadline = conn.outbox().deadline();
        match next_event(&mut io, &mut buf, &signals, deadline).await {
            Event::Read(Ok(0)) => {
                conn.closed();
                return Ok(());
            }
            Event::Read(Ok(n)) => conn.read(&buf[..n]),
            Event::Read(Err(err)) => {
                conn.closed();
                return Err(err.into());
            }
            Event::Signal(signal) => conn.signal(signal),
            Event::Timeout => {
                conn.outbox().expire();
                conn.timeout();
            }
        }
    }
}

async fn next_event<R>(
    io: &mut R,
    buf: &mut [u8],
    signals: &Receiver<Signal>,
    deadline: Option<Instant>,
) -> Event
where
    R: AsyncRead + Unpin,
{
    let read = async { Event::Read(io.read(buf).await) };
    let signal = async {
        match signals.recv().await {
            Ok(signal) => Event::Signal(signal),
            Err(_) => future::pending().await,
        }
    };
    let timer = async {
        match deadline {
            Some(at) => {
                AsyncTimer::at(at).await;
                Event::Timeout
            }
            None => future::pending().await,
        }
    };

    read.or(signal).or(timer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_close_drops_queued_writes() {
        let mut outbox = Outbox::new(Transport::Local);
        outbox.write(b"abc".to_vec(), true);
        outbox.close();
        assert_eq!(outbox.take_written(), (vec![], 0));
        assert!(outbox.is_closed());
    }

    #[test]
    fn graceful_close_keeps_queued_writes() {
        let mut outbox = Outbox::new(Transport::Local);
        outbox.write(b"abc".to_vec(), true);
        outbox.write(b"def".to_vec(), false);
        outbox.close_gracefully();
        assert_eq!(outbox.take_written(), (b"abcdef".to_vec(), 1));
        assert!(outbox.is_closed());
    }

    #[test]
    fn cancelling_a_replaced_timer_keeps_the_new_one() {
        let mut outbox = Outbox::new(Transport::Local);
        let first = outbox.start(Duration::from_secs(5));
        let _second = outbox.start(Duration::from_secs(5));
        outbox.cancel(first);
        assert!(outbox.deadline().is_some());
    }
}
