//! The stream adapter. Receives fill the caller's buffer across as many
//! segments as it takes (EOF surfaces as a zero-length completion), sends are
//! chunked through the stack's send buffer across sent-ack callbacks, and a
//! listening socket holds at most one connection awaiting `accept`.

use std::net::SocketAddrV4;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use bytes::{Bytes, BytesMut};

use crate::context::ContextHandle;
use crate::counters;
use crate::error::{Error, Result};
use crate::poll::{PollWaiter, Readiness};
use crate::rendezvous::Notifier;
use crate::stack::{AcceptDisposition, NetStack, RecvDisposition, TcpAcceptFn, TcpPcb, TcpRecvFn, TcpSentFn};

pub(crate) type Shared = Arc<AtomicRefCell<TcpSocket>>;

/// A completed accept: the adopted socket and the peer address.
type AcceptReply = Result<(Shared, SocketAddrV4)>;

pub(crate) struct TcpSocket {
    pcb: Option<TcpPcb>,
    wait: Wait,
    /// At most one inbound segment, consumed incrementally by receives.
    rx: Option<HeldSegment>,
    /// The peer closed its half; set once and never cleared.
    rx_eof: bool,
    /// At most one accepted-but-not-yet-delivered connection.
    pending_accept: Option<(TcpPcb, SocketAddrV4)>,
    poll_waiter: Option<PollWaiter>,
}

struct HeldSegment {
    data: Bytes,
    consumed: usize,
}

impl HeldSegment {
    fn remaining(&self) -> usize {
        self.data.len() - self.consumed
    }
}

enum Wait {
    Idle,
    RecvPending {
        notifier: Notifier<Result<Bytes>>,
        /// Bytes accumulated so far; the caller resumes when this reaches
        /// `want` or the peer closes.
        buf: BytesMut,
        want: usize,
    },
    SendPending {
        notifier: Notifier<Result<usize>>,
        data: Bytes,
        written: usize,
    },
    AcceptPending {
        notifier: Notifier<AcceptReply>,
    },
}

impl TcpSocket {
    fn new() -> Self {
        Self::with_pcb(None)
    }

    fn with_pcb(pcb: Option<TcpPcb>) -> Self {
        Self {
            pcb,
            wait: Wait::Idle,
            rx: None,
            rx_eof: false,
            pending_accept: None,
            poll_waiter: None,
        }
    }

    pub(crate) fn held_bytes(&self) -> usize {
        self.rx.as_ref().map(|seg| seg.remaining()).unwrap_or(0)
    }

    pub(crate) fn readiness(&self) -> Readiness {
        let mut readiness = Readiness::empty();
        if self.rx.is_some() || self.rx_eof {
            readiness |= Readiness::READABLE;
        }
        if self.pending_accept.is_some() {
            readiness |= Readiness::INCOMING;
        }
        readiness
    }

    pub(crate) fn set_poll_waiter(&mut self, waiter: PollWaiter) {
        self.poll_waiter = Some(waiter);
    }
}

pub(crate) fn open(ctx: &ContextHandle) -> Result<Shared> {
    let sock: Shared = Arc::new(AtomicRefCell::new(TcpSocket::new()));
    let result = ctx.call({
        let sock = Arc::clone(&sock);
        move |stack, notifier| match stack.tcp_open() {
            Ok(pcb) => {
                stack.tcp_on_recv(pcb, inbound_handler(Arc::clone(&sock)));
                stack.tcp_on_sent(pcb, sent_handler(Arc::clone(&sock)));
                sock.borrow_mut().pcb = Some(pcb);
                notifier.notify(Ok(()));
            }
            Err(e) => notifier.notify(Err(e)),
        }
    });
    result.map(|()| sock)
}

/// The stack-side receive callback. Stores or refuses segments, records EOF,
/// and continues a parked receive.
fn inbound_handler(sock: Shared) -> TcpRecvFn {
    Box::new(move |stack, segment| {
        let mut s = sock.borrow_mut();
        match segment {
            None => {
                s.rx_eof = true;
                match std::mem::replace(&mut s.wait, Wait::Idle) {
                    Wait::RecvPending { notifier, .. } => {
                        // the peer closed under a parked reader: it resumes
                        // with 0, even if some bytes were already copied
                        drop(s);
                        notifier.notify(Ok(Bytes::new()));
                    }
                    wait => {
                        s.wait = wait;
                        if let Some(waiter) = s.poll_waiter.take() {
                            drop(s);
                            waiter.fire();
                        }
                    }
                }
                RecvDisposition::Consumed
            }
            Some(data) => {
                if s.rx.is_some() {
                    // one segment at a time; the stack will offer this again
                    return RecvDisposition::Refused;
                }
                s.rx = Some(HeldSegment { data, consumed: 0 });
                match std::mem::replace(&mut s.wait, Wait::Idle) {
                    Wait::RecvPending {
                        notifier,
                        buf,
                        want,
                    } => copy_step(stack, &mut s, notifier, buf, want),
                    wait => {
                        s.wait = wait;
                        if let Some(waiter) = s.poll_waiter.take() {
                            drop(s);
                            waiter.fire();
                        }
                    }
                }
                RecvDisposition::Consumed
            }
        }
    })
}

/// The stack-side sent-ack callback: send-buffer space freed up, so a parked
/// sender may hand the stack its next chunk.
fn sent_handler(sock: Shared) -> TcpSentFn {
    Box::new(move |stack, _freed| {
        let mut s = sock.borrow_mut();
        match std::mem::replace(&mut s.wait, Wait::Idle) {
            Wait::SendPending {
                notifier,
                data,
                written,
            } => write_step(stack, &mut s, notifier, data, written),
            wait => s.wait = wait,
        }
    })
}

/// Move bytes from the held segment into the accumulation buffer. Frees the
/// segment (crediting the receive window) once fully consumed, and either
/// resumes the caller or leaves the receive armed.
fn copy_step(
    stack: &mut dyn NetStack,
    s: &mut TcpSocket,
    notifier: Notifier<Result<Bytes>>,
    mut buf: BytesMut,
    want: usize,
) {
    let held = s.rx.as_mut().expect("stream copy step without a held segment");
    let n = held.remaining().min(want - buf.len());
    buf.extend_from_slice(&held.data[held.consumed..held.consumed + n]);
    held.consumed += n;

    if held.remaining() == 0 {
        let total = held.data.len();
        s.rx = None;
        if let Some(pcb) = s.pcb {
            stack.tcp_recved(pcb, total);
        }
    }

    if buf.len() == want {
        counters::add(counters::TCP_RX_BYTES, want as u64);
        notifier.notify(Ok(buf.freeze()));
    } else if s.rx_eof {
        // the peer already closed, so no further segment will ever complete
        // this read: it resumes with 0 like any EOF-interrupted read
        notifier.notify(Ok(Bytes::new()));
    } else {
        s.wait = Wait::RecvPending {
            notifier,
            buf,
            want,
        };
    }
}

/// Hand the stack as much of the remaining payload as its send buffer takes.
/// Resumes the caller when everything is written, reports a short (zero)
/// write if the stack rejects a chunk, and otherwise leaves the send armed
/// for the next sent-ack.
fn write_step(
    stack: &mut dyn NetStack,
    s: &mut TcpSocket,
    notifier: Notifier<Result<usize>>,
    data: Bytes,
    mut written: usize,
) {
    let Some(pcb) = s.pcb else {
        notifier.notify(Err(Error::InvalidArgument));
        return;
    };
    let available = stack.tcp_send_buffer_available(pcb);
    let n = (data.len() - written).min(available);
    // a zero-length chunk still validates that the pcb can be written
    if stack.tcp_write(pcb, &data[written..written + n]).is_err() {
        notifier.notify(Ok(0));
        return;
    }
    written += n;
    if written == data.len() {
        let _ = stack.tcp_flush(pcb);
        counters::add(counters::TCP_TX_BYTES, data.len() as u64);
        notifier.notify(Ok(data.len()));
    } else {
        s.wait = Wait::SendPending {
            notifier,
            data,
            written,
        };
    }
}

pub(crate) fn bind(ctx: &ContextHandle, sock: &Shared, local: SocketAddrV4) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => stack.tcp_bind(pcb, local),
            None => Err(Error::InvalidArgument),
        };
        notifier.notify(result);
    })
}

pub(crate) fn listen(ctx: &ContextHandle, sock: &Shared, backlog: usize) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let mut s = sock.borrow_mut();
        let Some(pcb) = s.pcb else {
            drop(s);
            notifier.notify(Err(Error::InvalidArgument));
            return;
        };
        match stack.tcp_listen(pcb, backlog) {
            Ok(listener) => {
                // the listen transition may hand back a replacement pcb
                s.pcb = Some(listener);
                stack.tcp_on_accept(listener, accept_handler(Arc::clone(&sock)));
                drop(s);
                notifier.notify(Ok(()));
            }
            Err(e) => {
                drop(s);
                notifier.notify(Err(e));
            }
        }
    })
}

/// The stack-side accept callback on a listening socket.
fn accept_handler(sock: Shared) -> TcpAcceptFn {
    Box::new(move |stack, new_pcb, peer| {
        let mut s = sock.borrow_mut();
        if s.pending_accept.is_some() {
            // one un-adopted connection at a time; the stack reports this to
            // the remote end as a refusal
            log::trace!("pending accept slot full, refusing connection from {peer}");
            return AcceptDisposition::Refused;
        }
        // segments may arrive before accept() adopts the connection; until
        // then they are refused back to the stack
        stack.tcp_on_recv(new_pcb, Box::new(|_stack, _segment| RecvDisposition::Refused));
        match std::mem::replace(&mut s.wait, Wait::Idle) {
            Wait::AcceptPending { notifier } => {
                let listener = s.pcb;
                drop(s);
                notifier.notify(finish_accept(stack, listener, new_pcb, peer));
            }
            wait => {
                s.wait = wait;
                s.pending_accept = Some((new_pcb, peer));
                if let Some(waiter) = s.poll_waiter.take() {
                    drop(s);
                    waiter.fire();
                }
            }
        }
        AcceptDisposition::Accepted
    })
}

/// Adopt an accepted pcb: bind it to a fresh socket, install the data
/// handlers, and release the listener's backlog slot.
fn finish_accept(
    stack: &mut dyn NetStack,
    listener: Option<TcpPcb>,
    pcb: TcpPcb,
    peer: SocketAddrV4,
) -> AcceptReply {
    counters::add(counters::TCP_ACCEPTS, 1);
    let sock: Shared = Arc::new(AtomicRefCell::new(TcpSocket::with_pcb(Some(pcb))));
    stack.tcp_on_recv(pcb, inbound_handler(Arc::clone(&sock)));
    stack.tcp_on_sent(pcb, sent_handler(Arc::clone(&sock)));
    if let Some(listener) = listener {
        stack.tcp_accepted(listener);
    }
    Ok((sock, peer))
}

pub(crate) fn accept(ctx: &ContextHandle, sock: &Shared) -> AcceptReply {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let mut s = sock.borrow_mut();
        if s.pcb.is_none() {
            drop(s);
            notifier.notify(Err(Error::InvalidArgument));
            return;
        }
        if let Some((pcb, peer)) = s.pending_accept.take() {
            let listener = s.pcb;
            drop(s);
            notifier.notify(finish_accept(stack, listener, pcb, peer));
        } else {
            debug_assert!(matches!(s.wait, Wait::Idle));
            s.wait = Wait::AcceptPending { notifier };
        }
    })
}

pub(crate) fn connect(ctx: &ContextHandle, sock: &Shared, remote: SocketAddrV4) -> Result<()> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let Some(pcb) = sock.borrow().pcb else {
            notifier.notify(Err(Error::InvalidArgument));
            return;
        };
        // the connected callback owns the notifier; the error path below
        // reclaims it if the attempt never gets off the ground
        let slot = Arc::new(AtomicRefCell::new(Some(notifier)));
        let callback_slot = Arc::clone(&slot);
        stack.tcp_on_connected(
            pcb,
            Box::new(move |_stack, result| {
                if let Some(notifier) = callback_slot.borrow_mut().take() {
                    notifier.notify(result);
                }
            }),
        );
        if let Err(e) = stack.tcp_connect(pcb, remote) {
            if let Some(notifier) = slot.borrow_mut().take() {
                notifier.notify(Err(e));
            }
        }
    })
}

/// Blocking receive of exactly `cap` bytes (or 0 on EOF).
pub(crate) fn recv(ctx: &ContextHandle, sock: &Shared, cap: usize) -> Result<Bytes> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let mut s = sock.borrow_mut();
        if s.pcb.is_none() {
            drop(s);
            notifier.notify(Err(Error::InvalidArgument));
            return;
        }
        if s.rx.is_some() {
            copy_step(stack, &mut s, notifier, BytesMut::with_capacity(cap), cap);
        } else if s.rx_eof {
            drop(s);
            notifier.notify(Ok(Bytes::new()));
        } else {
            debug_assert!(matches!(s.wait, Wait::Idle));
            s.wait = Wait::RecvPending {
                notifier,
                buf: BytesMut::with_capacity(cap),
                want: cap,
            };
        }
    })
}

/// Blocking send of the whole payload; chunked through the send buffer.
pub(crate) fn send(ctx: &ContextHandle, sock: &Shared, payload: Bytes) -> Result<usize> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let mut s = sock.borrow_mut();
        write_step(stack, &mut s, notifier, payload, 0);
    })
}

pub(crate) fn local_addr(ctx: &ContextHandle, sock: &Shared) -> Result<SocketAddrV4> {
    let sock = Arc::clone(sock);
    ctx.call(move |stack, notifier| {
        let result = match sock.borrow().pcb {
            Some(pcb) => Ok(stack
                .tcp_local_addr(pcb)
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

pub(crate) fn close_on_context(stack: &mut dyn NetStack, sock: &Shared) {
    let mut s = sock.borrow_mut();
    if let Some(pcb) = s.pcb.take() {
        stack.tcp_close(pcb);
    }
    if let Some((pcb, _)) = s.pending_accept.take() {
        // a connection that was never adopted goes down with the listener
        stack.tcp_close(pcb);
    }
    s.rx = None;
}
