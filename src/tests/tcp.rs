use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::{new_context, new_context_with, serial};
use crate::stack::LoopbackConfig;
use crate::{counters, Error, Socket};

fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_tcp_round_trip() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6001)).unwrap();
    listener.listen(1).unwrap();

    let accepts_before = counters::value(counters::TCP_ACCEPTS);
    let rx_before = counters::value(counters::TCP_RX_BYTES);
    let tx_before = counters::value(counters::TCP_TX_BYTES);

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        // let the accept park first so the callback path gets exercised
        std::thread::sleep(Duration::from_millis(20));
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(6001)).unwrap();
        assert_eq!(c.write(&pattern(1500)).unwrap(), 1500);
        c
    });

    let (mut server, peer) = listener.accept().unwrap();
    assert_eq!(peer.ip(), &Ipv4Addr::LOCALHOST);
    assert_eq!(counters::value(counters::TCP_ACCEPTS), accepts_before + 1);

    // delivered across several segments, read back as one full buffer
    let mut buf = vec![0u8; 1500];
    assert_eq!(server.read(&mut buf).unwrap(), 1500);
    assert_eq!(buf, pattern(1500));

    assert_eq!(counters::value(counters::TCP_RX_BYTES), rx_before + 1500);
    assert_eq!(counters::value(counters::TCP_TX_BYTES), tx_before + 1500);

    drop(client.join().unwrap());
}

#[test]
fn test_tcp_send_chunking() {
    let _guard = serial();
    // a deliberately small send buffer forces the write through many
    // sent-ack continuations
    let ctx = new_context_with(LoopbackConfig {
        tcp_send_buffer: 2048,
        ..LoopbackConfig::default()
    });

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6002)).unwrap();
    listener.listen(1).unwrap();

    let tx_before = counters::value(counters::TCP_TX_BYTES);
    let rx_before = counters::value(counters::TCP_RX_BYTES);

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(6002)).unwrap();
        let payload = pattern(65536);
        // one blocking call moves the whole payload
        assert_eq!(c.send_to(&payload, None).unwrap(), 65536);
        c
    });

    let (mut server, _) = listener.accept().unwrap();
    let mut buf = vec![0u8; 65536];
    assert_eq!(server.read(&mut buf).unwrap(), 65536);
    assert_eq!(buf, pattern(65536));

    assert_eq!(counters::value(counters::TCP_TX_BYTES), tx_before + 65536);
    assert_eq!(counters::value(counters::TCP_RX_BYTES), rx_before + 65536);

    drop(client.join().unwrap());
}

#[test]
fn test_tcp_eof_is_idempotent() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6003)).unwrap();
    listener.listen(1).unwrap();

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(6003)).unwrap();
        assert_eq!(c.write(b"done").unwrap(), 4);
        c.close().unwrap();
    });

    let (mut server, _) = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"done");

    // every read after the peer closed reports EOF
    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert_eq!(server.read(&mut buf).unwrap(), 0);

    client.join().unwrap();
}

#[test]
fn test_eof_interrupts_partial_read() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6004)).unwrap();
    listener.listen(1).unwrap();

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(6004)).unwrap();
        assert_eq!(c.write(b"abc").unwrap(), 3);
        c.close().unwrap();
    });

    let (mut server, _) = listener.accept().unwrap();
    // the reader wants 10 bytes but the peer closes after 3: the read
    // resumes with 0 rather than a short count
    let mut buf = [0u8; 10];
    assert_eq!(server.read(&mut buf).unwrap(), 0);

    client.join().unwrap();
}

#[test]
fn test_read_spans_segments() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6005)).unwrap();
    listener.listen(1).unwrap();

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(6005)).unwrap();
        assert_eq!(c.write(b"fore").unwrap(), 4);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(c.write(b"noon").unwrap(), 4);
        c
    });

    let (mut server, _) = listener.accept().unwrap();
    // one read accumulates across two separately sent segments
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).unwrap(), 8);
    assert_eq!(&buf, b"forenoon");

    drop(client.join().unwrap());
}

#[test]
fn test_second_pending_connection_is_refused() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(6006)).unwrap();
    listener.listen(5).unwrap();

    let mut c1 = Socket::open_tcp(&ctx).unwrap();
    c1.connect(addr(6006)).unwrap();

    // c1 still occupies the single pending-accept slot
    let mut c2 = Socket::open_tcp(&ctx).unwrap();
    assert_eq!(c2.connect(addr(6006)), Err(Error::ConnectionRefused));

    let (_server, peer) = listener.accept().unwrap();
    assert_eq!(peer, c1.local_addr().unwrap());

    // the slot is free again
    let mut c3 = Socket::open_tcp(&ctx).unwrap();
    c3.connect(addr(6006)).unwrap();
}

#[test]
fn test_connect_without_listener() {
    let _guard = serial();
    let ctx = new_context();
    let mut c = Socket::open_tcp(&ctx).unwrap();
    assert_eq!(c.connect(addr(6007)), Err(Error::ConnectionRefused));
}

#[test]
fn test_listen_requires_bind() {
    let _guard = serial();
    let ctx = new_context();
    let mut s = Socket::open_tcp(&ctx).unwrap();
    assert_eq!(s.listen(1), Err(Error::InvalidArgument));
}

#[test]
fn test_write_on_unconnected_stream_is_short() {
    let _guard = serial();
    let ctx = new_context();
    let mut s = Socket::open_tcp(&ctx).unwrap();
    // a write the stack rejects surfaces as a zero-length transfer
    assert_eq!(s.write(b"hello").unwrap(), 0);
}

#[test]
fn test_connect_hostname_is_stubbed() {
    let _guard = serial();
    let ctx = new_context();
    let mut s = Socket::open_tcp(&ctx).unwrap();
    assert_eq!(s.connect_hostname("localhost", 80), Err(Error::Unsupported));
}
