//! Readiness integration: the generic byte-channel contract sockets expose,
//! and a multi-socket readable wait built on each socket's secondary waiter
//! slot.
//!
//! The poll waiter has strictly lower priority than a primary blocked call:
//! adapters only fire it from paths where no caller is parked on the socket.

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::error::Result;
use crate::rendezvous::Notifier;
use crate::socket::{SockRef, Socket};

bitflags::bitflags! {
    /// What a socket could currently complete without waiting for the stack.
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Readiness: u8 {
        /// Held inbound data (or stream EOF) can be consumed.
        const READABLE = 1 << 0;
        /// An accepted connection is waiting to be adopted.
        const INCOMING = 1 << 1;
    }
}

/// The generic blocking byte-channel contract. Sockets implement this so they
/// can stand in wherever the embedder consumes channels.
pub trait Channel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// Bytes that can be read without blocking on new arrivals.
    fn size(&self) -> usize;
}

impl Channel for Socket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Socket::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Socket::write(self, buf)
    }

    fn size(&self) -> usize {
        Socket::size(self)
    }
}

/// The shared slot behind one `wait_readable` call. Whichever socket becomes
/// ready first takes the notifier; waiters left installed on the other
/// sockets find the slot empty and fire as no-ops.
struct PollShared {
    slot: AtomicRefCell<Option<Notifier<usize>>>,
}

/// One socket's registration in a poll set: the shared slot plus the
/// socket's position in the caller's list.
pub(crate) struct PollWaiter {
    shared: Arc<PollShared>,
    index: usize,
}

impl PollWaiter {
    /// Resume the poll reader, if it is still waiting.
    pub(crate) fn fire(self) {
        if let Some(notifier) = self.shared.slot.borrow_mut().take() {
            notifier.notify(self.index);
        }
    }
}

/// Block until one of `sockets` is readable (held data, stream EOF, or a
/// pending incoming connection) and return its index.
///
/// All sockets must belong to the same stack context. A stale waiter left on
/// a socket by an earlier call is harmlessly overwritten or fires into an
/// empty slot; readiness is always re-checked up front, so no wake-up is
/// lost.
///
/// # Panics
///
/// Panics if `sockets` is empty.
pub fn wait_readable(sockets: &[&Socket]) -> usize {
    assert!(!sockets.is_empty(), "cannot wait on an empty socket set");
    let ctx = sockets[0].context().clone();
    let refs: Vec<SockRef> = sockets.iter().map(|s| s.sock_ref().clone()).collect();

    ctx.call(move |_stack, notifier| {
        if let Some(index) = refs.iter().position(|s| !s.readiness().is_empty()) {
            notifier.notify(index);
            return;
        }
        let shared = Arc::new(PollShared {
            slot: AtomicRefCell::new(Some(notifier)),
        });
        for (index, sock) in refs.iter().enumerate() {
            sock.set_poll_waiter(PollWaiter {
                shared: Arc::clone(&shared),
                index,
            });
        }
    })
}
