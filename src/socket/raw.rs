//! The raw adapter: ICMP over IPv4. Works like the datagram adapter except
//! that addressing is by host only (no ports) and the inbound callback tells
//! the stack whether the packet was consumed.

use std::net::Ipv4Addr;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use bytes::Bytes;

use crate::context::ContextHandle;
use crate::counters;
use crate::error::{Error, Result};
use crate::poll::{PollWaiter, Readiness};
use crate::rendezvous::Notifier;
use crate::stack::{IpProtocol, RawPcb, RawRecvFn};

pub(crate) type Shared = Arc<AtomicRefCell<RawSocket>>;

type RecvReply = Result<(Bytes, Ipv4Addr)>;

pub(crate) struct RawSocket {
    pcb: Option<RawPcb>,
    wait: Wait,
    /// At most one inbound packet, held until the next receive.
    rx: Option<(Bytes, Ipv4Addr)>,
    poll_waiter: Option<PollWaiter>,
}

enum Wait {
    Idle,
    RecvPending { notifier: Notifier<RecvReply>, cap: usize },
}

impl RawSocket {
    fn new() -> Self {
        Self {
            pcb: None,
            wait: Wait::Idle,
            rx: None,
            poll_waiter: None,
        }
    }

    pub(crate) fn held_bytes(&self) -> usize {
        self.rx.as_ref().map(|(data, _)| data.len()).unwrap_or(0)
    }

    pub(crate) fn readiness(&self) -> Readiness {
        if self.rx.is_some() {
            Readiness::READABLE
        } else {
            Readiness::empty()
        }
    }

    pub(crate) fn set_poll_waiter(&mut self, waiter: PollWaiter) {
        self.poll_waiter = Some(waiter);
    }
}

pub(crate) fn open(ctx: &ContextHandle) -> Result<Shared> {
    let sock: Shared = Arc::new(AtomicRefCell::new(RawSocket::new()));
    let result = ctx.call({
        let sock = Arc::clone(&sock);
        move |stack, notifier| match stack.raw_open(IpProtocol::Icmp) {
            Ok(pcb) => {
                stack.raw_on_recv(pcb, inbound_handler(Arc::clone(&sock)));
                sock.borrow_mut().pcb = Some(pcb);
                notifier.notify(Ok(()));
            }
            Err(e) => notifier.notify(Err(e)),
        }
    });
    result.map(|()| sock)
}

/// The stack-side inbound callback. Always reports the packet consumed: it
/// was either handed to a receiver, parked in the slot, or dropped.
fn inbound_handler(sock: Shared) -> RawRecvFn {
    Box::new(move |_stack, payload, src| {
        let mut s = sock.borrow_mut();
        if s.rx.is_some() {
            log::trace!("raw slot full, dropping {} bytes from {src}", payload.len());
            return true;
        }
        match std::mem::replace(&mut s.wait, Wait::Idle) {
            Wait::RecvPending { notifier, cap } => {
                let n = payload.len().min(cap);
                counters::add(counters::RAW_RX_BYTES, n as u64);
                drop(s);
                notifier.notify(Ok((payload.slice(..n), src)));
            }
            Wait::Idle => {
                s.rx = Some((payload, src));
                if let Some(waiter) = s.poll_waiter.take() {
                    drop(s);
                    waiter.fire();
                }
            }
        }
        true
    })
}

pub(crate) fn send_to(
    ctx: &ContextHandle,
    sock: &Shared,
    payload: Bytes,
    remote: Ipv4Addr,
) -> Result<usize> {
    let sock = Arc::clone(sock);
    let len = payload.len();
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => stack.raw_send_to(pcb, payload, remote),
            None => Err(Error::InvalidArgument),
        };
        match result {
            Ok(()) => {
                counters::add(counters::RAW_TX_BYTES, len as u64);
                notifier.notify(Ok(len));
            }
            Err(e) => notifier.notify(Err(e)),
        }
    })
}

pub(crate) fn recv(ctx: &ContextHandle, sock: &Shared, cap: usize) -> RecvReply {
    let sock = Arc::clone(sock);
    ctx.call(move |_stack, notifier| {
        let mut s = sock.borrow_mut();
        if s.pcb.is_none() {
            drop(s);
            notifier.notify(Err(Error::InvalidArgument));
            return;
        }
        if let Some((data, src)) = s.rx.take() {
            let n = data.len().min(cap);
            counters::add(counters::RAW_RX_BYTES, n as u64);
            drop(s);
            notifier.notify(Ok((data.slice(..n), src)));
        } else {
            debug_assert!(matches!(s.wait, Wait::Idle));
            s.wait = Wait::RecvPending { notifier, cap };
        }
    })
}

pub(crate) fn close(ctx: &ContextHandle, sock: &Shared) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        close_on_context(stack, &sock);
        notifier.notify(());
    });
    Ok(())
}

pub(crate) fn close_on_context(stack: &mut dyn crate::stack::NetStack, sock: &Shared) {
    let mut s = sock.borrow_mut();
    if let Some(pcb) = s.pcb.take() {
        stack.raw_close(pcb);
    }
    s.rx = None;
}
