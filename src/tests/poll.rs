use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::{new_context, serial};
use crate::{wait_readable, Channel, Socket};

fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[test]
fn test_poll_immediate_readiness() {
    let _guard = serial();
    let ctx = new_context();

    let mut quiet = Socket::open_udp(&ctx).unwrap();
    quiet.bind(addr(7001)).unwrap();
    let mut busy = Socket::open_udp(&ctx).unwrap();
    busy.bind(addr(7002)).unwrap();

    let mut sender = Socket::open_udp(&ctx).unwrap();
    sender.send_to(b"data", Some(addr(7002))).unwrap();

    assert_eq!(wait_readable(&[&quiet, &busy]), 1);

    let mut buf = [0u8; 16];
    let (n, _) = busy.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"data");
}

#[test]
fn test_poll_wakes_on_arrival() {
    let _guard = serial();
    let ctx = new_context();

    let mut a = Socket::open_udp(&ctx).unwrap();
    a.bind(addr(7003)).unwrap();
    let mut b = Socket::open_udp(&ctx).unwrap();
    b.bind(addr(7004)).unwrap();

    let sender_ctx = ctx.clone();
    let sender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut s = Socket::open_udp(&sender_ctx).unwrap();
        s.send_to(b"late", Some(addr(7004))).unwrap();
    });

    assert_eq!(wait_readable(&[&a, &b]), 1);
    sender.join().unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"late");
}

#[test]
fn test_poll_sees_incoming_connection() {
    let _guard = serial();
    let ctx = new_context();

    let mut listener = Socket::open_tcp(&ctx).unwrap();
    listener.bind(addr(7005)).unwrap();
    listener.listen(1).unwrap();

    let client_ctx = ctx.clone();
    let client = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut c = Socket::open_tcp(&client_ctx).unwrap();
        c.connect(addr(7005)).unwrap();
        c
    });

    assert_eq!(wait_readable(&[&listener]), 0);
    let (_server, _peer) = listener.accept().unwrap();

    drop(client.join().unwrap());
}

#[test]
fn test_poll_reuse_after_stale_waiter() {
    let _guard = serial();
    let ctx = new_context();

    let mut a = Socket::open_udp(&ctx).unwrap();
    a.bind(addr(7006)).unwrap();
    let mut b = Socket::open_udp(&ctx).unwrap();
    b.bind(addr(7007)).unwrap();
    // first round: the wait parks, then a fires, leaving a stale waiter
    // installed on b
    let sender_ctx = ctx.clone();
    let background = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut s = Socket::open_udp(&sender_ctx).unwrap();
        s.send_to(b"one", Some(addr(7006))).unwrap();
        s
    });
    assert_eq!(wait_readable(&[&a, &b]), 0);
    let mut buf = [0u8; 16];
    a.recv_from(&mut buf).unwrap();
    let mut sender = background.join().unwrap();

    // second round must still see traffic for b
    sender.send_to(b"two", Some(addr(7007))).unwrap();
    assert_eq!(wait_readable(&[&a, &b]), 1);
    let (n, _) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"two");
}

#[test]
fn test_socket_as_generic_channel() {
    let _guard = serial();
    let ctx = new_context();

    let mut rx = Socket::open_udp(&ctx).unwrap();
    rx.bind(addr(7008)).unwrap();
    let mut tx = Socket::open_udp(&ctx).unwrap();
    tx.connect(addr(7008)).unwrap();

    fn shove(chan: &mut dyn Channel, data: &[u8]) -> usize {
        chan.write(data).unwrap()
    }
    fn drain(chan: &mut dyn Channel) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let n = chan.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    assert_eq!(shove(&mut tx, b"via channel"), 11);
    assert_eq!(rx.size(), 11);
    assert_eq!(drain(&mut rx), b"via channel");
    assert_eq!(rx.size(), 0);
}
