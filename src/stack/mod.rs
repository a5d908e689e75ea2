//! The boundary between the socket layer and the network stack proper.
//!
//! A [`NetStack`] owns every protocol control block and runs on a single
//! thread (the stack context); the socket adapters program against this trait
//! and register per-pcb handlers that the stack invokes from that same thread.
//!
//! Two rules keep the adapters' borrows sound:
//!
//! - Trait methods never invoke a handler synchronously. Anything a method
//!   makes deliverable (a routed datagram, freed send-buffer space, a
//!   connection attempt) is queued internally and comes out of [`poll()`].
//! - Handlers receive `&mut dyn NetStack` and may call back into the stack
//!   (consume window credit, write another chunk, register handlers on a
//!   freshly accepted pcb).
//!
//! [`poll()`]: NetStack::poll

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

use crate::error::Result;

mod loopback;

pub use loopback::{LoopbackConfig, LoopbackStack};
pub(crate) use loopback::internet_checksum;

slotmap::new_key_type! {
    /// Handle to a datagram protocol control block.
    pub struct UdpPcb;
    /// Handle to a stream protocol control block.
    pub struct TcpPcb;
    /// Handle to a raw-IP protocol control block.
    pub struct RawPcb;
}

/// Upper-layer protocols a raw pcb can be created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
}

/// What a stream receive handler did with an inbound segment. A refused
/// segment stays queued in the stack and is offered again after the receiver
/// credits window with [`NetStack::tcp_recved`] or replaces its handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecvDisposition {
    Consumed,
    Refused,
}

/// Verdict of an accept handler for an incoming connection. A refusal is
/// reported to the remote end as connection-refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcceptDisposition {
    Accepted,
    Refused,
}

/// Inbound datagram delivery: payload plus the sender's address.
pub type UdpRecvFn = Box<dyn FnMut(&mut dyn NetStack, Bytes, SocketAddrV4) + Send>;

/// Inbound stream delivery. `None` signals that the peer closed its half.
pub type TcpRecvFn = Box<dyn FnMut(&mut dyn NetStack, Option<Bytes>) -> RecvDisposition + Send>;

/// Previously written stream bytes have left the send buffer; the argument is
/// the freed byte count.
pub type TcpSentFn = Box<dyn FnMut(&mut dyn NetStack, usize) + Send>;

/// An incoming connection on a listening pcb: the new pcb and the peer
/// address.
pub type TcpAcceptFn = Box<dyn FnMut(&mut dyn NetStack, TcpPcb, SocketAddrV4) -> AcceptDisposition + Send>;

/// Outcome of an earlier [`NetStack::tcp_connect`].
pub type TcpConnectedFn = Box<dyn FnMut(&mut dyn NetStack, Result<()>) + Send>;

/// Inbound raw-IP delivery: payload plus the source address. Returning `true`
/// consumes the packet and stops further delivery.
pub type RawRecvFn = Box<dyn FnMut(&mut dyn NetStack, Bytes, Ipv4Addr) -> bool + Send>;

pub trait NetStack: Send {
    // datagram pcbs

    fn udp_open(&mut self) -> Result<UdpPcb>;
    /// Install (or replace) the inbound handler for a datagram pcb.
    fn udp_on_recv(&mut self, pcb: UdpPcb, handler: UdpRecvFn);
    /// Destroy the pcb and drop its handlers. Idempotent for unknown pcbs.
    fn udp_close(&mut self, pcb: UdpPcb);
    fn udp_bind(&mut self, pcb: UdpPcb, local: SocketAddrV4) -> Result<()>;
    /// Fix the remote peer used by [`udp_send`](Self::udp_send); also filters
    /// inbound datagrams to that peer.
    fn udp_connect(&mut self, pcb: UdpPcb, remote: SocketAddrV4) -> Result<()>;
    fn udp_send(&mut self, pcb: UdpPcb, payload: Bytes) -> Result<()>;
    fn udp_send_to(&mut self, pcb: UdpPcb, payload: Bytes, remote: SocketAddrV4) -> Result<()>;
    fn udp_local_addr(&self, pcb: UdpPcb) -> Option<SocketAddrV4>;

    // stream pcbs

    fn tcp_open(&mut self) -> Result<TcpPcb>;
    fn tcp_on_recv(&mut self, pcb: TcpPcb, handler: TcpRecvFn);
    fn tcp_on_sent(&mut self, pcb: TcpPcb, handler: TcpSentFn);
    fn tcp_on_accept(&mut self, pcb: TcpPcb, handler: TcpAcceptFn);
    fn tcp_on_connected(&mut self, pcb: TcpPcb, handler: TcpConnectedFn);
    fn tcp_close(&mut self, pcb: TcpPcb);
    fn tcp_bind(&mut self, pcb: TcpPcb, local: SocketAddrV4) -> Result<()>;
    /// Transition a bound pcb to listening. The returned handle replaces the
    /// one passed in, which must not be used afterwards.
    fn tcp_listen(&mut self, pcb: TcpPcb, backlog: usize) -> Result<TcpPcb>;
    /// Start a connection attempt. The outcome is reported through the
    /// pcb's connected handler.
    fn tcp_connect(&mut self, pcb: TcpPcb, remote: SocketAddrV4) -> Result<()>;
    /// Tell a listening pcb that one pending connection has been adopted,
    /// freeing a backlog slot.
    fn tcp_accepted(&mut self, listener: TcpPcb);
    /// Bytes the stack will currently accept into the pcb's send buffer.
    fn tcp_send_buffer_available(&self, pcb: TcpPcb) -> usize;
    /// Copy `data` into the send buffer. Fails if `data` exceeds the space
    /// reported by [`tcp_send_buffer_available`](Self::tcp_send_buffer_available).
    fn tcp_write(&mut self, pcb: TcpPcb, data: &[u8]) -> Result<()>;
    /// Push buffered output toward the peer.
    fn tcp_flush(&mut self, pcb: TcpPcb) -> Result<()>;
    /// Credit `len` consumed bytes back to the receive window.
    fn tcp_recved(&mut self, pcb: TcpPcb, len: usize);
    fn tcp_local_addr(&self, pcb: TcpPcb) -> Option<SocketAddrV4>;

    // raw pcbs

    fn raw_open(&mut self, protocol: IpProtocol) -> Result<RawPcb>;
    fn raw_on_recv(&mut self, pcb: RawPcb, handler: RawRecvFn);
    fn raw_close(&mut self, pcb: RawPcb);
    fn raw_send_to(&mut self, pcb: RawPcb, payload: Bytes, remote: Ipv4Addr) -> Result<()>;

    // work pump

    /// Process one unit of deferred work (a delivery, a handshake step, a
    /// send-buffer drain). Returns true while more work is queued; the stack
    /// context drains this after every posted closure.
    fn poll(&mut self) -> bool;
}
