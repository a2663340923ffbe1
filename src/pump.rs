//! Write scheduling and signal plumbing shared by both connection roles.

use async_channel::{Receiver, Sender};

use crate::stream::Stream;
use crate::transaction::{Notifier, Signal, SignalKind, Transaction, TransactionId};

/// Which half of the exchange a connection writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// A transaction together with the id its notifiers carry.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) id: TransactionId,
    pub(crate) txn: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    Writing,
}

/// Allows one write-producing call into a transaction at a time.
#[derive(Debug)]
pub(crate) struct WriteGuard {
    state: WriteState,
}

impl WriteGuard {
    pub(crate) fn new() -> Self {
        Self {
            state: WriteState::Idle,
        }
    }

    /// Enter the writing state, or `None` if a write is already underway.
    fn enter(&mut self) -> Option<Writing<'_>> {
        match self.state {
            WriteState::Writing => None,
            WriteState::Idle => {
                self.state = WriteState::Writing;
                Some(Writing { guard: self })
            }
        }
    }

    #[cfg(test)]
    fn is_writing(&self) -> bool {
        self.state == WriteState::Writing
    }
}

/// Resets the guard to idle when dropped, on unwinding too.
struct Writing<'a> {
    guard: &'a mut WriteGuard,
}

impl Drop for Writing<'_> {
    fn drop(&mut self) {
        self.guard.state = WriteState::Idle;
    }
}

/// What one turn of the pump did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pumped {
    /// Nothing to do right now.
    Idle,
    /// A chunk went out; `written()` will bring us back.
    Wrote,
    /// Nothing left to write and the transaction is complete.
    Done,
}

/// Ask the transaction for its next chunk and hand it to the stream.
pub(crate) fn pump<T, S>(
    role: Role,
    guard: &mut WriteGuard,
    txn: Option<&mut T>,
    stream: &mut S,
) -> Pumped
where
    T: Transaction,
    S: Stream,
{
    let txn = match txn {
        Some(txn) => txn,
        None => return Pumped::Idle,
    };

    let chunk = match guard.enter() {
        Some(_writing) => match role {
            Role::Client => txn.write_request(),
            Role::Server => txn.write_response(),
        },
        None => {
            log::trace!("write already in progress");
            return Pumped::Idle;
        }
    };

    if !chunk.is_empty() {
        log::trace!("> {} bytes", chunk.len());
        stream.write(chunk, true);
        Pumped::Wrote
    } else if role == Role::Server && txn.is_done() {
        Pumped::Done
    } else {
        Pumped::Idle
    }
}

/// The per-connection queue transactions signal through.
#[derive(Debug)]
pub(crate) struct Signals {
    sender: Sender<Signal>,
    receiver: Receiver<Signal>,
    next_id: TransactionId,
}

impl Signals {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            sender,
            receiver,
            next_id: 0,
        }
    }

    /// Allocate the id for a new transaction.
    pub(crate) fn next_id(&mut self) -> TransactionId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn notifier(&self, id: TransactionId, kind: SignalKind) -> Notifier {
        Notifier::new(id, kind, self.sender.clone())
    }

    /// Pop the next queued signal without waiting.
    pub(crate) fn try_next(&self) -> Option<Signal> {
        self.receiver.try_recv().ok()
    }

    pub(crate) fn receiver(&self) -> Receiver<Signal> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_admits_one_writer() {
        let mut guard = WriteGuard::new();
        let writing = guard.enter();
        assert!(writing.is_some());
        drop(writing);
        assert!(!guard.is_writing());

        let first = guard.enter().map(|w| {
            assert!(w.guard.is_writing());
        });
        assert!(first.is_some());
        assert!(!guard.is_writing());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut signals = Signals::new();
        let a = signals.next_id();
        let b = signals.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn notifiers_queue_their_signal() {
        let mut signals = Signals::new();
        let id = signals.next_id();
        signals.notifier(id, SignalKind::Resume).notify();
        let signal = signals.try_next().unwrap();
        assert_eq!(signal.id(), id);
        assert_eq!(signal.kind(), SignalKind::Resume);
        assert!(signals.try_next().is_none());
    }
}
