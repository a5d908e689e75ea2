//! The blocking socket façade. A [`Socket`] is a tagged handle over one of
//! the three protocol adapters; every blocking call posts a closure to the
//! stack context and parks until the operation (or a later stack callback)
//! resumes it.
//!
//! Blocking operations take `&mut self`, so a socket can never have more than
//! one suspended caller. Closing a socket while another thread is parked on
//! it is therefore impossible by construction.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use bytes::Bytes;

use crate::context::ContextHandle;
use crate::error::{Error, Result};
use crate::poll::{PollWaiter, Readiness};

mod raw;
mod tcp;
mod udp;

/// A blocking socket bound to a stack context.
pub struct Socket {
    ctx: ContextHandle,
    sock: SockRef,
}

#[derive(Clone)]
pub(crate) enum SockRef {
    Udp(Arc<AtomicRefCell<udp::UdpSocket>>),
    Tcp(Arc<AtomicRefCell<tcp::TcpSocket>>),
    Raw(Arc<AtomicRefCell<raw::RawSocket>>),
}

impl SockRef {
    /// Bytes of inbound data currently held. Stack context only.
    pub(crate) fn held_bytes(&self) -> usize {
        match self {
            SockRef::Udp(s) => s.borrow().held_bytes(),
            SockRef::Tcp(s) => s.borrow().held_bytes(),
            SockRef::Raw(s) => s.borrow().held_bytes(),
        }
    }

    /// Current readiness. Stack context only.
    pub(crate) fn readiness(&self) -> Readiness {
        match self {
            SockRef::Udp(s) => s.borrow().readiness(),
            SockRef::Tcp(s) => s.borrow().readiness(),
            SockRef::Raw(s) => s.borrow().readiness(),
        }
    }

    /// Install the secondary (poll) waiter. Stack context only.
    pub(crate) fn set_poll_waiter(&self, waiter: PollWaiter) {
        match self {
            SockRef::Udp(s) => s.borrow_mut().set_poll_waiter(waiter),
            SockRef::Tcp(s) => s.borrow_mut().set_poll_waiter(waiter),
            SockRef::Raw(s) => s.borrow_mut().set_poll_waiter(waiter),
        }
    }
}

impl Socket {
    /// Open a datagram socket on the given stack context.
    pub fn open_udp(ctx: &ContextHandle) -> Result<Socket> {
        let sock = udp::open(ctx)?;
        Ok(Socket {
            ctx: ctx.clone(),
            sock: SockRef::Udp(sock),
        })
    }

    /// Open a stream socket on the given stack context.
    pub fn open_tcp(ctx: &ContextHandle) -> Result<Socket> {
        let sock = tcp::open(ctx)?;
        Ok(Socket {
            ctx: ctx.clone(),
            sock: SockRef::Tcp(sock),
        })
    }

    /// Open a raw ICMP socket on the given stack context.
    pub fn open_raw(ctx: &ContextHandle) -> Result<Socket> {
        let sock = raw::open(ctx)?;
        Ok(Socket {
            ctx: ctx.clone(),
            sock: SockRef::Raw(sock),
        })
    }

    /// Bind to a local address. Stream and datagram sockets only.
    pub fn bind(&mut self, local: SocketAddrV4) -> Result<()> {
        match &self.sock {
            SockRef::Udp(s) => udp::bind(&self.ctx, s, local),
            SockRef::Tcp(s) => tcp::bind(&self.ctx, s, local),
            SockRef::Raw(_) => Err(Error::InvalidArgument),
        }
    }

    /// Start listening for connections. Stream sockets only.
    pub fn listen(&mut self, backlog: usize) -> Result<()> {
        match &self.sock {
            SockRef::Tcp(s) => tcp::listen(&self.ctx, s, backlog),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Connect to a remote address. For datagram sockets this fixes the
    /// default destination and filters inbound traffic; for stream sockets
    /// the call blocks until the connection is established or refused.
    pub fn connect(&mut self, remote: SocketAddrV4) -> Result<()> {
        match &self.sock {
            SockRef::Udp(s) => udp::connect(&self.ctx, s, remote),
            SockRef::Tcp(s) => tcp::connect(&self.ctx, s, remote),
            SockRef::Raw(_) => Err(Error::InvalidArgument),
        }
    }

    /// Connect a stream socket by hostname.
    ///
    /// Documented surface only: name resolution on the stack context is not
    /// wired up, so this currently always fails with [`Error::Unsupported`].
    pub fn connect_hostname(&mut self, _host: &str, _port: u16) -> Result<()> {
        match &self.sock {
            SockRef::Tcp(_) => Err(Error::Unsupported),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Block until an incoming connection is available and adopt it. Stream
    /// sockets only. Returns the connected socket and the peer address.
    pub fn accept(&mut self) -> Result<(Socket, SocketAddrV4)> {
        match &self.sock {
            SockRef::Tcp(s) => {
                let (sock, peer) = tcp::accept(&self.ctx, s)?;
                Ok((
                    Socket {
                        ctx: self.ctx.clone(),
                        sock: SockRef::Tcp(sock),
                    },
                    peer,
                ))
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Send `buf`, optionally to an explicit destination. Returns the number
    /// of bytes sent, which on success is always `buf.len()`.
    ///
    /// Datagram sockets require either `remote` or a prior
    /// [`connect`](Self::connect); stream sockets ignore `remote`; raw
    /// sockets use only the address part of `remote`.
    pub fn send_to(&mut self, buf: &[u8], remote: Option<SocketAddrV4>) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let payload = Bytes::copy_from_slice(buf);
        match &self.sock {
            SockRef::Udp(s) => udp::send_to(&self.ctx, s, payload, remote),
            SockRef::Tcp(s) => tcp::send(&self.ctx, s, payload),
            SockRef::Raw(s) => {
                let remote = remote.ok_or(Error::NotConnected)?;
                raw::send_to(&self.ctx, s, payload, *remote.ip())
            }
        }
    }

    /// Block until inbound data is available and copy it into `buf`. Returns
    /// the byte count and, for datagram and raw sockets, the source address
    /// (raw sources carry port 0).
    ///
    /// Datagram and raw reads return one packet, truncated to `buf` if
    /// needed. Stream reads return exactly `buf.len()` bytes, or 0 once the
    /// peer has closed.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>)> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        match &self.sock {
            SockRef::Udp(s) => {
                let (data, src) = udp::recv(&self.ctx, s, buf.len())?;
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), Some(src)))
            }
            SockRef::Tcp(s) => {
                let data = tcp::recv(&self.ctx, s, buf.len())?;
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), None))
            }
            SockRef::Raw(s) => {
                let (data, src) = raw::recv(&self.ctx, s, buf.len())?;
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), Some(SocketAddrV4::new(src, 0))))
            }
        }
    }

    /// [`send_to`](Self::send_to) with no destination.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.send_to(buf, None)
    }

    /// [`recv_from`](Self::recv_from) with the source address discarded.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_from(buf).map(|(n, _)| n)
    }

    /// Bytes of inbound data currently held by the socket; non-zero exactly
    /// when a read would complete without blocking on new arrivals.
    pub fn size(&self) -> usize {
        let sock = self.sock.clone();
        self.ctx
            .call(move |_stack, notifier| notifier.notify(sock.held_bytes()))
    }

    /// The socket's bound local address, or `0.0.0.0:0` if unbound. Stream
    /// and datagram sockets only.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match &self.sock {
            SockRef::Udp(s) => udp::local_addr(&self.ctx, s),
            SockRef::Tcp(s) => tcp::local_addr(&self.ctx, s),
            SockRef::Raw(_) => Err(Error::InvalidArgument),
        }
    }

    /// Close the socket: unhook the stack callbacks and destroy the pcb.
    /// Best-effort and idempotent; always succeeds.
    pub fn close(&mut self) -> Result<()> {
        match &self.sock {
            SockRef::Udp(s) => udp::close(&self.ctx, s),
            SockRef::Tcp(s) => tcp::close(&self.ctx, s),
            SockRef::Raw(s) => raw::close(&self.ctx, s),
        }
    }

    pub(crate) fn context(&self) -> &ContextHandle {
        &self.ctx
    }

    pub(crate) fn sock_ref(&self) -> &SockRef {
        &self.sock
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // reclaim the pcb even if the user never called close(); posting is
        // fire-and-forget because the context may already be gone
        let sock = self.sock.clone();
        self.ctx.post(move |stack| match &sock {
            SockRef::Udp(s) => udp::close_on_context(stack, s),
            SockRef::Tcp(s) => tcp::close_on_context(stack, s),
            SockRef::Raw(s) => raw::close_on_context(stack, s),
        });
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sock {
            SockRef::Udp(_) => write!(f, "Socket(Udp)"),
            SockRef::Tcp(_) => write!(f, "Socket(Tcp)"),
            SockRef::Raw(_) => write!(f, "Socket(Raw)"),
        }
    }
}
