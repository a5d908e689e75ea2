//! The datagram adapter: blocking UDP operations and the stack-side inbound
//! handler. At most one datagram is ever held per socket; later arrivals are
//! dropped while the slot is occupied, and oversize reads truncate silently.

use std::net::SocketAddrV4;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use bytes::Bytes;

use crate::context::ContextHandle;
use crate::counters;
use crate::error::{Error, Result};
use crate::poll::{PollWaiter, Readiness};
use crate::rendezvous::Notifier;
use crate::stack::{UdpPcb, UdpRecvFn};

pub(crate) type Shared = Arc<AtomicRefCell<UdpSocket>>;

/// Payload and source handed back to a resumed receiver.
type RecvReply = Result<(Bytes, SocketAddrV4)>;

pub(crate) struct UdpSocket {
    pcb: Option<UdpPcb>,
    wait: Wait,
    /// At most one inbound datagram, held until the next receive.
    rx: Option<(Bytes, SocketAddrV4)>,
    poll_waiter: Option<PollWaiter>,
}

enum Wait {
    Idle,
    RecvPending { notifier: Notifier<RecvReply>, cap: usize },
}

impl UdpSocket {
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
    let sock: Shared = Arc::new(AtomicRefCell::new(UdpSocket::new()));
    let result = ctx.call({
        let sock = Arc::clone(&sock);
        move |stack, notifier| match stack.udp_open() {
            Ok(pcb) => {
                stack.udp_on_recv(pcb, inbound_handler(Arc::clone(&sock)));
                sock.borrow_mut().pcb = Some(pcb);
                notifier.notify(Ok(()));
            }
            Err(e) => notifier.notify(Err(e)),
        }
    });
    result.map(|()| sock)
}

/// The stack-side inbound callback, running on the stack context.
fn inbound_handler(sock: Shared) -> UdpRecvFn {
    Box::new(move |_stack, payload, src| {
        let mut s = sock.borrow_mut();
        if s.rx.is_some() {
            // the slot is full; this datagram is dropped, not queued
            log::trace!("datagram slot full, dropping {} bytes from {src}", payload.len());
            return;
        }
        match std::mem::replace(&mut s.wait, Wait::Idle) {
            Wait::RecvPending { notifier, cap } => {
                let n = payload.len().min(cap);
                counters::add(counters::UDP_RX_BYTES, n as u64);
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
    })
}

pub(crate) fn bind(ctx: &ContextHandle, sock: &Shared, local: SocketAddrV4) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => stack.udp_bind(pcb, local),
            None => Err(Error::InvalidArgument),
        };
        notifier.notify(result);
    })
}

pub(crate) fn connect(ctx: &ContextHandle, sock: &Shared, remote: SocketAddrV4) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => stack.udp_connect(pcb, remote),
            None => Err(Error::InvalidArgument),
        };
        notifier.notify(result);
    })
}

pub(crate) fn send_to(
    ctx: &ContextHandle,
    sock: &Shared,
    payload: Bytes,
    remote: Option<SocketAddrV4>,
) -> Result<usize> {
    let sock = Arc::clone(sock);
    let len = payload.len();
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => match remote {
                Some(addr) => stack.udp_send_to(pcb, payload, addr),
                None => stack.udp_send(pcb, payload),
            },
            None => Err(Error::InvalidArgument),
        };
        match result {
            Ok(()) => {
                counters::add(counters::UDP_TX_BYTES, len as u64);
                notifier.notify(Ok(len));
            }
            Err(e) => notifier.notify(Err(e)),
        }
    })
}

/// Blocking receive. Completes immediately from the held slot, otherwise
/// parks the caller until a datagram arrives.
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
            counters::add(counters::UDP_RX_BYTES, n as u64);
            drop(s);
            notifier.notify(Ok((data.slice(..n), src)));
        } else {
            debug_assert!(matches!(s.wait, Wait::Idle));
            s.wait = Wait::RecvPending { notifier, cap };
        }
    })
}

pub(crate) fn local_addr(ctx: &ContextHandle, sock: &Shared) -> Result<SocketAddrV4> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => Ok(stack
                .udp_local_addr(pcb)
                .unwrap_or(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0))),
            None => Err(Error::InvalidArgument),
        };
        notifier.notify(result);
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
        stack.udp_close(pcb);
    }
    s.rx = None;
}
