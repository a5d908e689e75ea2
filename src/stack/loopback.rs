//! An in-process IPv4 loopback implementation of [`NetStack`]. Everything a
//! pcb sends is routed back to pcbs on the same stack: datagrams are delivered
//! to the bound receiver, stream connections are matched against listeners and
//! moved segment-by-segment with send-buffer and receive-window backpressure,
//! and ICMP echo requests are answered by the stack itself.
//!
//! All deferred work (deliveries, handshakes, segment movement) sits in an
//! internal event queue drained by [`poll`](NetStack::poll), so no trait
//! method ever re-enters a handler synchronously.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slotmap::{SecondaryMap, SlotMap};

use super::{
    AcceptDisposition, IpProtocol, NetStack, RawPcb, RawRecvFn, RecvDisposition, TcpAcceptFn,
    TcpConnectedFn, TcpPcb, TcpRecvFn, TcpSentFn, UdpPcb, UdpRecvFn,
};
use crate::error::{Error, Result};

/// Maximum datagram payload deliverable over the loopback interface.
// 65,535 (2^16 - 1) - 20 (ip header) - 8 (udp header)
const DATAGRAM_MAX_SIZE: usize = 65507;

const EPHEMERAL_PORT_MIN: u16 = 49152;
const EPHEMERAL_PORT_ATTEMPTS: usize = 128;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_HEADER_LEN: usize = 8;

/// Tuning knobs for the loopback stack.
#[derive(Copy, Clone, Debug)]
pub struct LoopbackConfig {
    /// Bytes a stream pcb will queue before `tcp_write` reports no space.
    pub tcp_send_buffer: usize,
    /// Bytes of un-credited inbound segment data a stream pcb may hold before
    /// the sender stalls.
    pub tcp_recv_window: usize,
    /// Largest single segment moved between stream pcbs.
    pub mss: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            tcp_send_buffer: 16 * 1024,
            tcp_recv_window: 64 * 1024,
            mss: 536,
        }
    }
}

struct UdpEntry {
    local: Option<SocketAddrV4>,
    remote: Option<SocketAddrV4>,
}

struct Connection {
    local: SocketAddrV4,
    /// The peer's address; kept for symmetry with `local` even though
    /// routing goes through `peer` directly.
    #[allow(dead_code)]
    remote: SocketAddrV4,
    /// The pcb at the other end, until it closes.
    peer: Option<TcpPcb>,
    /// Bytes accepted by `tcp_write`, not yet moved to the peer.
    tx: VecDeque<u8>,
    /// Segments awaiting delivery to this pcb's receive handler.
    inflight: VecDeque<Bytes>,
    /// Inbound bytes not yet credited back via `tcp_recved`.
    window_used: usize,
    /// The peer closed; deliver EOF once `inflight` drains.
    fin_pending: bool,
    eof_delivered: bool,
}

impl Connection {
    fn new(local: SocketAddrV4, remote: SocketAddrV4, peer: TcpPcb) -> Self {
        Self {
            local,
            remote,
            peer: Some(peer),
            tx: VecDeque::new(),
            inflight: VecDeque::new(),
            window_used: 0,
            fin_pending: false,
            eof_delivered: false,
        }
    }
}

enum TcpEntry {
    Closed {
        local: Option<SocketAddrV4>,
    },
    Listening {
        local: SocketAddrV4,
        backlog: usize,
        /// Connections handed to the accept handler but not yet consumed via
        /// `tcp_accepted`.
        pending: usize,
    },
    Connecting {
        local: SocketAddrV4,
        remote: SocketAddrV4,
    },
    Established(Connection),
}

impl TcpEntry {
    fn local(&self) -> Option<SocketAddrV4> {
        match self {
            TcpEntry::Closed { local } => *local,
            TcpEntry::Listening { local, .. } => Some(*local),
            TcpEntry::Connecting { local, .. } => Some(*local),
            TcpEntry::Established(conn) => Some(conn.local),
        }
    }
}

struct RawEntry {
    protocol: IpProtocol,
}

enum Event {
    UdpDeliver {
        pcb: UdpPcb,
        payload: Bytes,
        src: SocketAddrV4,
    },
    TcpHandshake {
        client: TcpPcb,
        remote: SocketAddrV4,
    },
    /// Move tx toward the peer, deliver inflight segments, deliver EOF.
    TcpRun(TcpPcb),
    IcmpInput {
        payload: Bytes,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    },
}

pub struct LoopbackStack {
    config: LoopbackConfig,
    udp: SlotMap<UdpPcb, UdpEntry>,
    udp_recv: SecondaryMap<UdpPcb, UdpRecvFn>,
    tcp: SlotMap<TcpPcb, TcpEntry>,
    tcp_recv: SecondaryMap<TcpPcb, TcpRecvFn>,
    tcp_sent: SecondaryMap<TcpPcb, TcpSentFn>,
    tcp_accept: SecondaryMap<TcpPcb, TcpAcceptFn>,
    tcp_connected: SecondaryMap<TcpPcb, TcpConnectedFn>,
    raw: SlotMap<RawPcb, RawEntry>,
    raw_recv: SecondaryMap<RawPcb, RawRecvFn>,
    events: VecDeque<Event>,
    rng: StdRng,
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self::with_config(LoopbackConfig::default())
    }

    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            config,
            udp: SlotMap::with_key(),
            udp_recv: SecondaryMap::new(),
            tcp: SlotMap::with_key(),
            tcp_recv: SecondaryMap::new(),
            tcp_sent: SecondaryMap::new(),
            tcp_accept: SecondaryMap::new(),
            tcp_connected: SecondaryMap::new(),
            raw: SlotMap::with_key(),
            raw_recv: SecondaryMap::new(),
            events: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn udp_addr_in_use(&self, addr: SocketAddrV4) -> bool {
        self.udp.values().any(|e| match e.local {
            Some(l) => {
                l.port() == addr.port()
                    && (l.ip().is_unspecified()
                        || addr.ip().is_unspecified()
                        || l.ip() == addr.ip())
            }
            None => false,
        })
    }

    fn tcp_addr_in_use(&self, addr: SocketAddrV4) -> bool {
        self.tcp.values().any(|e| match e.local() {
            Some(l) => {
                l.port() == addr.port()
                    && (l.ip().is_unspecified()
                        || addr.ip().is_unspecified()
                        || l.ip() == addr.ip())
            }
            None => false,
        })
    }

    fn ephemeral_udp_port(&mut self) -> Result<u16> {
        for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
            let port = self.rng.gen_range(EPHEMERAL_PORT_MIN..=u16::MAX);
            if !self.udp_addr_in_use(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
                return Ok(port);
            }
        }
        log::debug!("no ephemeral datagram port available");
        Err(Error::AddressInUse)
    }

    fn ephemeral_tcp_port(&mut self) -> Result<u16> {
        for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
            let port = self.rng.gen_range(EPHEMERAL_PORT_MIN..=u16::MAX);
            if !self.tcp_addr_in_use(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
                return Ok(port);
            }
        }
        log::debug!("no ephemeral stream port available");
        Err(Error::AddressInUse)
    }

    /// Find the bound datagram pcb a packet for `dst` from `src` lands on.
    fn udp_route(&self, dst: SocketAddrV4, src: SocketAddrV4) -> Option<UdpPcb> {
        self.udp.iter().find_map(|(pcb, e)| {
            let local = e.local?;
            if local.port() != dst.port() {
                return None;
            }
            if !local.ip().is_unspecified() && local.ip() != dst.ip() {
                return None;
            }
            // a connected pcb only receives from its peer
            if let Some(peer) = e.remote {
                if peer != src {
                    return None;
                }
            }
            Some(pcb)
        })
    }

    fn tcp_route_listener(&self, dst: SocketAddrV4) -> Option<TcpPcb> {
        self.tcp.iter().find_map(|(pcb, e)| match e {
            TcpEntry::Listening { local, .. }
                if local.port() == dst.port()
                    && (local.ip().is_unspecified() || local.ip() == dst.ip()) =>
            {
                Some(pcb)
            }
            _ => None,
        })
    }

    fn established_mut(&mut self, pcb: TcpPcb) -> Option<&mut Connection> {
        match self.tcp.get_mut(pcb) {
            Some(TcpEntry::Established(conn)) => Some(conn),
            _ => None,
        }
    }

    fn established(&self, pcb: TcpPcb) -> Option<&Connection> {
        match self.tcp.get(pcb) {
            Some(TcpEntry::Established(conn)) => Some(conn),
            _ => None,
        }
    }

    // Handlers are taken out of their map while they run so they can receive
    // `&mut dyn NetStack`; they are put back unless the pcb died or the
    // handler was replaced in the meantime.

    fn call_udp_recv(&mut self, pcb: UdpPcb, payload: Bytes, src: SocketAddrV4) {
        let Some(mut handler) = self.udp_recv.remove(pcb) else {
            log::trace!("datagram for {src} arrived on a pcb without a receive handler");
            return;
        };
        handler(self, payload, src);
        if self.udp.contains_key(pcb) && !self.udp_recv.contains_key(pcb) {
            self.udp_recv.insert(pcb, handler);
        }
    }

    fn call_tcp_recv(&mut self, pcb: TcpPcb, segment: Option<Bytes>) -> Option<RecvDisposition> {
        let mut handler = self.tcp_recv.remove(pcb)?;
        let disposition = handler(self, segment);
        if self.tcp.contains_key(pcb) && !self.tcp_recv.contains_key(pcb) {
            self.tcp_recv.insert(pcb, handler);
        }
        Some(disposition)
    }

    fn call_tcp_sent(&mut self, pcb: TcpPcb, len: usize) {
        let Some(mut handler) = self.tcp_sent.remove(pcb) else {
            return;
        };
        handler(self, len);
        if self.tcp.contains_key(pcb) && !self.tcp_sent.contains_key(pcb) {
            self.tcp_sent.insert(pcb, handler);
        }
    }

    fn call_tcp_accept(
        &mut self,
        listener: TcpPcb,
        new_pcb: TcpPcb,
        peer: SocketAddrV4,
    ) -> AcceptDisposition {
        let Some(mut handler) = self.tcp_accept.remove(listener) else {
            return AcceptDisposition::Refused;
        };
        let disposition = handler(self, new_pcb, peer);
        if self.tcp.contains_key(listener) && !self.tcp_accept.contains_key(listener) {
            self.tcp_accept.insert(listener, handler);
        }
        disposition
    }

    fn call_tcp_connected(&mut self, pcb: TcpPcb, result: Result<()>) {
        let Some(mut handler) = self.tcp_connected.remove(pcb) else {
            return;
        };
        handler(self, result);
        if self.tcp.contains_key(pcb) && !self.tcp_connected.contains_key(pcb) {
            self.tcp_connected.insert(pcb, handler);
        }
    }

    fn call_raw_recv(&mut self, pcb: RawPcb, payload: Bytes, src: Ipv4Addr) -> bool {
        let Some(mut handler) = self.raw_recv.remove(pcb) else {
            return false;
        };
        let consumed = handler(self, payload, src);
        if self.raw.contains_key(pcb) && !self.raw_recv.contains_key(pcb) {
            self.raw_recv.insert(pcb, handler);
        }
        consumed
    }

    fn process_handshake(&mut self, client: TcpPcb, remote: SocketAddrV4) {
        let client_addr = match self.tcp.get(client) {
            Some(TcpEntry::Connecting { local, .. }) => *local,
            // the client pcb was closed before the handshake ran
            _ => return,
        };

        let verdict = self.admit_connection(client, client_addr, remote);
        match &verdict {
            Ok(()) => log::trace!("connection {client_addr} -> {remote} established"),
            Err(e) => log::trace!("connection {client_addr} -> {remote} failed: {e}"),
        }
        if verdict.is_err() {
            if let Some(entry) = self.tcp.get_mut(client) {
                *entry = TcpEntry::Closed {
                    local: Some(client_addr),
                };
            }
        }
        self.call_tcp_connected(client, verdict);
    }

    /// Match a connecting client against a listener and run the accept
    /// handler. On success both pcbs are established and peered.
    fn admit_connection(
        &mut self,
        client: TcpPcb,
        client_addr: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<()> {
        let listener = self
            .tcp_route_listener(remote)
            .ok_or(Error::ConnectionRefused)?;

        let listener_ip = match &self.tcp[listener] {
            TcpEntry::Listening {
                local,
                backlog,
                pending,
            } => {
                if *pending >= *backlog {
                    log::trace!("listener backlog full, refusing {client_addr}");
                    return Err(Error::ConnectionRefused);
                }
                *local.ip()
            }
            _ => return Err(Error::ConnectionRefused),
        };

        // the server side answers from the address that was dialed
        let server_ip = if listener_ip.is_unspecified() {
            *remote.ip()
        } else {
            listener_ip
        };
        let server_addr = SocketAddrV4::new(server_ip, remote.port());

        let server = self
            .tcp
            .insert(TcpEntry::Established(Connection::new(
                server_addr,
                client_addr,
                client,
            )));

        if let Some(TcpEntry::Listening { pending, .. }) = self.tcp.get_mut(listener) {
            *pending += 1;
        }

        match self.call_tcp_accept(listener, server, client_addr) {
            AcceptDisposition::Accepted => {
                if let Some(entry) = self.tcp.get_mut(client) {
                    *entry = TcpEntry::Established(Connection::new(client_addr, remote, server));
                }
                Ok(())
            }
            AcceptDisposition::Refused => {
                self.remove_tcp(server);
                if let Some(TcpEntry::Listening { pending, .. }) = self.tcp.get_mut(listener) {
                    *pending = pending.saturating_sub(1);
                }
                Err(Error::ConnectionRefused)
            }
        }
    }

    fn process_tcp(&mut self, pcb: TcpPcb) {
        self.move_tx(pcb);
        self.deliver_inflight(pcb);
        self.deliver_eof(pcb);
    }

    /// Move send-buffer bytes toward the peer, one segment at a time, as long
    /// as the peer's receive window has room. Each moved segment frees send
    /// buffer and fires the sent handler.
    fn move_tx(&mut self, pcb: TcpPcb) {
        loop {
            let (peer, n) = {
                let Some(conn) = self.established(pcb) else {
                    return;
                };
                if conn.tx.is_empty() {
                    return;
                }
                let Some(peer) = conn.peer else {
                    // the peer is gone; these bytes have nowhere to go
                    break;
                };
                let Some(peer_conn) = self.established(peer) else {
                    break;
                };
                let room = self.config.tcp_recv_window.saturating_sub(peer_conn.window_used);
                if room == 0 {
                    // stalled until the peer credits window via tcp_recved
                    return;
                }
                (peer, conn.tx.len().min(self.config.mss).min(room))
            };

            let chunk: Bytes = {
                let conn = self.established_mut(pcb).expect("pcb vanished while moving tx");
                conn.tx.drain(..n).collect::<Vec<u8>>().into()
            };
            {
                let peer_conn = self
                    .established_mut(peer)
                    .expect("peer vanished while moving tx");
                peer_conn.inflight.push_back(chunk);
                peer_conn.window_used += n;
            }

            self.events.push_back(Event::TcpRun(peer));
            self.call_tcp_sent(pcb, n);
        }

        // unreachable peer: drop whatever is left
        if let Some(conn) = self.established_mut(pcb) {
            conn.tx.clear();
        }
    }

    /// Offer queued inbound segments to the receive handler until one is
    /// refused. Refused segments stay queued; `tcp_recved` or a handler change
    /// retries them.
    fn deliver_inflight(&mut self, pcb: TcpPcb) {
        loop {
            let Some(segment) = self
                .established(pcb)
                .and_then(|conn| conn.inflight.front().cloned())
            else {
                return;
            };
            match self.call_tcp_recv(pcb, Some(segment)) {
                Some(RecvDisposition::Consumed) => {
                    if let Some(conn) = self.established_mut(pcb) {
                        conn.inflight.pop_front();
                    }
                }
                _ => return,
            }
        }
    }

    fn deliver_eof(&mut self, pcb: TcpPcb) {
        let due = match self.established(pcb) {
            Some(conn) => conn.inflight.is_empty() && conn.fin_pending && !conn.eof_delivered,
            None => false,
        };
        if !due {
            return;
        }
        if let Some(RecvDisposition::Consumed) = self.call_tcp_recv(pcb, None) {
            if let Some(conn) = self.established_mut(pcb) {
                conn.eof_delivered = true;
            }
        }
    }

    fn process_icmp(&mut self, payload: Bytes, src: Ipv4Addr, dst: Ipv4Addr) {
        // echo requests addressed to this host are answered by the stack
        // itself; raw pcbs see everything else
        if payload.len() >= ICMP_HEADER_LEN && payload[0] == ICMP_ECHO_REQUEST {
            let mut reply = BytesMut::from(&payload[..]);
            reply[0] = ICMP_ECHO_REPLY;
            reply[2] = 0;
            reply[3] = 0;
            let sum = internet_checksum(&reply);
            reply[2..4].copy_from_slice(&sum.to_be_bytes());
            log::trace!("answering {}-byte echo request to {dst}", payload.len());
            self.events.push_back(Event::IcmpInput {
                payload: reply.freeze(),
                src: dst,
                dst: src,
            });
            return;
        }

        let pcbs: Vec<RawPcb> = self
            .raw
            .iter()
            .filter(|(_, e)| e.protocol == IpProtocol::Icmp)
            .map(|(pcb, _)| pcb)
            .collect();
        for pcb in pcbs {
            if self.call_raw_recv(pcb, payload.clone(), src) {
                return;
            }
        }
        log::trace!("inbound icmp packet from {src} had no takers");
    }

    fn remove_tcp(&mut self, pcb: TcpPcb) {
        self.tcp.remove(pcb);
        self.tcp_recv.remove(pcb);
        self.tcp_sent.remove(pcb);
        self.tcp_accept.remove(pcb);
        self.tcp_connected.remove(pcb);
    }
}

impl Default for LoopbackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NetStack for LoopbackStack {
    fn udp_open(&mut self) -> Result<UdpPcb> {
        Ok(self.udp.insert(UdpEntry {
            local: None,
            remote: None,
        }))
    }

    fn udp_on_recv(&mut self, pcb: UdpPcb, handler: UdpRecvFn) {
        self.udp_recv.insert(pcb, handler);
    }

    fn udp_close(&mut self, pcb: UdpPcb) {
        self.udp.remove(pcb);
        self.udp_recv.remove(pcb);
    }

    fn udp_bind(&mut self, pcb: UdpPcb, local: SocketAddrV4) -> Result<()> {
        if !self.udp.contains_key(pcb) {
            return Err(Error::InvalidArgument);
        }
        if self.udp[pcb].local.is_some() {
            return Err(Error::InvalidArgument);
        }
        let local = if local.port() == 0 {
            SocketAddrV4::new(*local.ip(), self.ephemeral_udp_port()?)
        } else {
            local
        };
        if self.udp_addr_in_use(local) {
            return Err(Error::AddressInUse);
        }
        self.udp[pcb].local = Some(local);
        Ok(())
    }

    fn udp_connect(&mut self, pcb: UdpPcb, remote: SocketAddrV4) -> Result<()> {
        if !self.udp.contains_key(pcb) {
            return Err(Error::InvalidArgument);
        }
        if self.udp[pcb].local.is_none() {
            let port = self.ephemeral_udp_port()?;
            self.udp[pcb].local = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        }
        self.udp[pcb].remote = Some(remote);
        Ok(())
    }

    fn udp_send(&mut self, pcb: UdpPcb, payload: Bytes) -> Result<()> {
        let remote = self
            .udp
            .get(pcb)
            .ok_or(Error::InvalidArgument)?
            .remote
            .ok_or(Error::NotConnected)?;
        self.udp_send_to(pcb, payload, remote)
    }

    fn udp_send_to(&mut self, pcb: UdpPcb, payload: Bytes, remote: SocketAddrV4) -> Result<()> {
        if !self.udp.contains_key(pcb) {
            return Err(Error::InvalidArgument);
        }
        if payload.len() > DATAGRAM_MAX_SIZE {
            return Err(Error::MessageTooLarge);
        }
        if !remote.ip().is_loopback() {
            // only the loopback interface exists here
            return Err(Error::Protocol);
        }
        if self.udp[pcb].local.is_none() {
            let port = self.ephemeral_udp_port()?;
            self.udp[pcb].local = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        }

        let bound = self.udp[pcb].local.unwrap();
        let src = if bound.ip().is_unspecified() {
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, bound.port())
        } else {
            bound
        };

        match self.udp_route(remote, src) {
            Some(dst_pcb) => self.events.push_back(Event::UdpDeliver {
                pcb: dst_pcb,
                payload,
                src,
            }),
            None => log::trace!("no datagram receiver at {remote}, dropping"),
        }
        Ok(())
    }

    fn udp_local_addr(&self, pcb: UdpPcb) -> Option<SocketAddrV4> {
        self.udp.get(pcb).and_then(|e| e.local)
    }

    fn tcp_open(&mut self) -> Result<TcpPcb> {
        Ok(self.tcp.insert(TcpEntry::Closed { local: None }))
    }

    fn tcp_on_recv(&mut self, pcb: TcpPcb, handler: TcpRecvFn) {
        self.tcp_recv.insert(pcb, handler);
        // a fresh handler may be willing to take segments the old one refused
        self.events.push_back(Event::TcpRun(pcb));
    }

    fn tcp_on_sent(&mut self, pcb: TcpPcb, handler: TcpSentFn) {
        self.tcp_sent.insert(pcb, handler);
    }

    fn tcp_on_accept(&mut self, pcb: TcpPcb, handler: TcpAcceptFn) {
        self.tcp_accept.insert(pcb, handler);
    }

    fn tcp_on_connected(&mut self, pcb: TcpPcb, handler: TcpConnectedFn) {
        self.tcp_connected.insert(pcb, handler);
    }

    fn tcp_close(&mut self, pcb: TcpPcb) {
        let peer_info = match self.tcp.get_mut(pcb) {
            Some(TcpEntry::Established(conn)) => {
                let leftover: Vec<u8> = conn.tx.drain(..).collect();
                conn.peer.map(|peer| (peer, leftover))
            }
            _ => None,
        };
        if let Some((peer, leftover)) = peer_info {
            if let Some(peer_conn) = self.established_mut(peer) {
                // flush what the closer had queued, then signal EOF
                if !leftover.is_empty() {
                    peer_conn.window_used += leftover.len();
                    peer_conn.inflight.push_back(leftover.into());
                }
                peer_conn.fin_pending = true;
                peer_conn.peer = None;
                self.events.push_back(Event::TcpRun(peer));
            }
        }
        self.remove_tcp(pcb);
    }

    fn tcp_bind(&mut self, pcb: TcpPcb, local: SocketAddrV4) -> Result<()> {
        match self.tcp.get(pcb) {
            Some(TcpEntry::Closed { local: None }) => {}
            _ => return Err(Error::InvalidArgument),
        }
        let local = if local.port() == 0 {
            SocketAddrV4::new(*local.ip(), self.ephemeral_tcp_port()?)
        } else {
            local
        };
        if self.tcp_addr_in_use(local) {
            return Err(Error::AddressInUse);
        }
        self.tcp[pcb] = TcpEntry::Closed { local: Some(local) };
        Ok(())
    }

    fn tcp_listen(&mut self, pcb: TcpPcb, backlog: usize) -> Result<TcpPcb> {
        let local = match self.tcp.get(pcb) {
            Some(TcpEntry::Closed { local: Some(local) }) => *local,
            _ => return Err(Error::InvalidArgument),
        };

        // the listen transition allocates a new pcb; handlers move with it
        self.tcp.remove(pcb);
        let listener = self.tcp.insert(TcpEntry::Listening {
            local,
            backlog,
            pending: 0,
        });
        if let Some(h) = self.tcp_recv.remove(pcb) {
            self.tcp_recv.insert(listener, h);
        }
        if let Some(h) = self.tcp_sent.remove(pcb) {
            self.tcp_sent.insert(listener, h);
        }
        if let Some(h) = self.tcp_accept.remove(pcb) {
            self.tcp_accept.insert(listener, h);
        }
        if let Some(h) = self.tcp_connected.remove(pcb) {
            self.tcp_connected.insert(listener, h);
        }
        Ok(listener)
    }

    fn tcp_connect(&mut self, pcb: TcpPcb, remote: SocketAddrV4) -> Result<()> {
        if !remote.ip().is_loopback() {
            return Err(Error::Protocol);
        }
        let local = match self.tcp.get(pcb) {
            Some(TcpEntry::Closed { local }) => *local,
            _ => return Err(Error::InvalidArgument),
        };
        let local = match local {
            Some(addr) => addr,
            None => SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.ephemeral_tcp_port()?),
        };
        self.tcp[pcb] = TcpEntry::Connecting { local, remote };
        self.events.push_back(Event::TcpHandshake {
            client: pcb,
            remote,
        });
        Ok(())
    }

    fn tcp_accepted(&mut self, listener: TcpPcb) {
        if let Some(TcpEntry::Listening { pending, .. }) = self.tcp.get_mut(listener) {
            *pending = pending.saturating_sub(1);
        }
    }

    fn tcp_send_buffer_available(&self, pcb: TcpPcb) -> usize {
        match self.established(pcb) {
            Some(conn) if conn.peer.is_some() => {
                self.config.tcp_send_buffer.saturating_sub(conn.tx.len())
            }
            _ => 0,
        }
    }

    fn tcp_write(&mut self, pcb: TcpPcb, data: &[u8]) -> Result<()> {
        let send_buffer = self.config.tcp_send_buffer;
        let conn = self.established_mut(pcb).ok_or(Error::Protocol)?;
        if conn.peer.is_none() {
            // the peer is gone; nothing written here could ever be delivered
            return Err(Error::Protocol);
        }
        if data.len() > send_buffer.saturating_sub(conn.tx.len()) {
            return Err(Error::AllocationFailure);
        }
        conn.tx.extend(data);
        self.events.push_back(Event::TcpRun(pcb));
        Ok(())
    }

    fn tcp_flush(&mut self, pcb: TcpPcb) -> Result<()> {
        // output is moved by the event queue as soon as poll() runs
        self.events.push_back(Event::TcpRun(pcb));
        Ok(())
    }

    fn tcp_recved(&mut self, pcb: TcpPcb, len: usize) {
        let Some(conn) = self.established_mut(pcb) else {
            return;
        };
        conn.window_used = conn.window_used.saturating_sub(len);
        let peer = conn.peer;
        // retry our own queued segments and unstall the peer's sender
        self.events.push_back(Event::TcpRun(pcb));
        if let Some(peer) = peer {
            self.events.push_back(Event::TcpRun(peer));
        }
    }

    fn tcp_local_addr(&self, pcb: TcpPcb) -> Option<SocketAddrV4> {
        self.tcp.get(pcb).and_then(|e| e.local())
    }

    fn raw_open(&mut self, protocol: IpProtocol) -> Result<RawPcb> {
        Ok(self.raw.insert(RawEntry { protocol }))
    }

    fn raw_on_recv(&mut self, pcb: RawPcb, handler: RawRecvFn) {
        self.raw_recv.insert(pcb, handler);
    }

    fn raw_close(&mut self, pcb: RawPcb) {
        self.raw.remove(pcb);
        self.raw_recv.remove(pcb);
    }

    fn raw_send_to(&mut self, pcb: RawPcb, payload: Bytes, remote: Ipv4Addr) -> Result<()> {
        if !self.raw.contains_key(pcb) {
            return Err(Error::InvalidArgument);
        }
        if !remote.is_loopback() {
            return Err(Error::Protocol);
        }
        self.events.push_back(Event::IcmpInput {
            payload,
            src: Ipv4Addr::LOCALHOST,
            dst: remote,
        });
        Ok(())
    }

    fn poll(&mut self) -> bool {
        if let Some(event) = self.events.pop_front() {
            match event {
                Event::UdpDeliver { pcb, payload, src } => {
                    if self.udp.contains_key(pcb) {
                        self.call_udp_recv(pcb, payload, src);
                    }
                }
                Event::TcpHandshake { client, remote } => self.process_handshake(client, remote),
                Event::TcpRun(pcb) => self.process_tcp(pcb),
                Event::IcmpInput { payload, src, dst } => self.process_icmp(payload, src, dst),
            }
        }
        !self.events.is_empty()
    }
}

/// RFC 1071 internet checksum over `data` (odd lengths are zero-padded).
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atomic_refcell::AtomicRefCell;

    use super::*;

    fn drain(stack: &mut LoopbackStack) {
        while stack.poll() {}
    }

    #[test]
    fn test_internet_checksum() {
        // RFC 1071 worked example
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), 0x220d);
    }

    #[test]
    fn test_checksum_of_valid_packet_is_zero() {
        let mut pkt = vec![0x08, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 0x01];
        let sum = internet_checksum(&pkt);
        pkt[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(internet_checksum(&pkt), 0);
    }

    #[test]
    fn test_udp_bind_conflict() {
        let mut stack = LoopbackStack::new();
        let a = stack.udp_open().unwrap();
        let b = stack.udp_open().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000);
        stack.udp_bind(a, addr).unwrap();
        assert_eq!(stack.udp_bind(b, addr), Err(Error::AddressInUse));
    }

    #[test]
    fn test_udp_ephemeral_bind() {
        let mut stack = LoopbackStack::new();
        let a = stack.udp_open().unwrap();
        stack
            .udp_bind(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        let local = stack.udp_local_addr(a).unwrap();
        assert!(local.port() >= EPHEMERAL_PORT_MIN);
    }

    #[test]
    fn test_udp_roundtrip() {
        let mut stack = LoopbackStack::new();
        let a = stack.udp_open().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4001);
        stack.udp_bind(a, addr).unwrap();

        let seen: Arc<AtomicRefCell<Vec<(Bytes, SocketAddrV4)>>> = Arc::default();
        let seen2 = Arc::clone(&seen);
        stack.udp_on_recv(
            a,
            Box::new(move |_, payload, src| seen2.borrow_mut().push((payload, src))),
        );

        let b = stack.udp_open().unwrap();
        stack
            .udp_send_to(b, Bytes::from_static(b"ping"), addr)
            .unwrap();
        drain(&mut stack);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].0[..], b"ping");
        assert_eq!(Some(seen[0].1), stack.udp_local_addr(b));
    }

    #[test]
    fn test_listen_replaces_handle() {
        let mut stack = LoopbackStack::new();
        let pcb = stack.tcp_open().unwrap();
        stack
            .tcp_bind(pcb, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4002))
            .unwrap();
        let listener = stack.tcp_listen(pcb, 1).unwrap();
        assert_ne!(pcb, listener);
        // the old handle is dead
        assert_eq!(stack.tcp_local_addr(pcb), None);
        assert_eq!(
            stack.tcp_local_addr(listener),
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4002))
        );
    }

    #[test]
    fn test_connect_without_listener_is_refused() {
        let mut stack = LoopbackStack::new();
        let pcb = stack.tcp_open().unwrap();
        let verdict: Arc<AtomicRefCell<Option<Result<()>>>> = Arc::default();
        let verdict2 = Arc::clone(&verdict);
        stack.tcp_on_connected(
            pcb,
            Box::new(move |_, result| *verdict2.borrow_mut() = Some(result)),
        );
        stack
            .tcp_connect(pcb, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4003))
            .unwrap();
        drain(&mut stack);
        assert_eq!(*verdict.borrow(), Some(Err(Error::ConnectionRefused)));
    }

    #[test]
    fn test_backlog_refusal() {
        let mut stack = LoopbackStack::new();
        let pcb = stack.tcp_open().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4004);
        stack.tcp_bind(pcb, addr).unwrap();
        let listener = stack.tcp_listen(pcb, 1).unwrap();
        stack.tcp_on_accept(listener, Box::new(|_, _, _| AcceptDisposition::Accepted));

        let connect = |stack: &mut LoopbackStack| {
            let c = stack.tcp_open().unwrap();
            let verdict: Arc<AtomicRefCell<Option<Result<()>>>> = Arc::default();
            let verdict2 = Arc::clone(&verdict);
            stack.tcp_on_connected(
                c,
                Box::new(move |_, result| *verdict2.borrow_mut() = Some(result)),
            );
            stack.tcp_connect(c, addr).unwrap();
            drain(stack);
            let v = verdict.borrow().unwrap();
            v
        };

        assert_eq!(connect(&mut stack), Ok(()));
        // the first connection still occupies the backlog slot
        assert_eq!(connect(&mut stack), Err(Error::ConnectionRefused));
        stack.tcp_accepted(listener);
        assert_eq!(connect(&mut stack), Ok(()));
    }
}
