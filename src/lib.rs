//! Blocking sockets over a single-threaded network stack.
//!
//! The stack (anything implementing [`stack::NetStack`]) runs on its own
//! thread, the *stack context*, and owns every protocol control block. User
//! threads call the blocking [`Socket`] API; each call posts a closure into
//! the stack context and parks the caller until the operation completes there,
//! either synchronously or from a later stack callback (a delivered datagram,
//! freed send-buffer space, an incoming connection).
//!
//! The crate ships [`stack::LoopbackStack`], an in-process IPv4 loopback
//! stack, so the whole surface is usable without hardware:
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use syncsock::{stack::LoopbackStack, Socket, StackContext};
//!
//! syncsock::init();
//! let ctx = StackContext::spawn(Box::new(LoopbackStack::new()));
//! let handle = ctx.handle();
//!
//! let mut receiver = Socket::open_udp(&handle).unwrap();
//! receiver
//!     .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000))
//!     .unwrap();
//!
//! let mut sender = Socket::open_udp(&handle).unwrap();
//! sender
//!     .send_to(b"hello", Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000)))
//!     .unwrap();
//!
//! let mut buf = [0u8; 64];
//! let (n, from) = receiver.recv_from(&mut buf).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! assert!(from.is_some());
//! ```

pub mod context;
pub mod counters;
mod error;
pub mod poll;
pub mod rendezvous;
mod socket;
pub mod stack;

pub use context::{ContextHandle, StackContext};
pub use error::{Error, Result};
pub use poll::{wait_readable, Channel, Readiness};
pub use socket::Socket;

/// One-time module setup: registers the socket byte counters. Idempotent;
/// later calls are no-ops. Spawning a [`StackContext`] is what brings the
/// stack itself up, so this only covers process-wide state.
pub fn init() {
    counters::init();
}

#[cfg(test)]
mod tests;
