use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::time::Duration;

use super::{new_context, serial};
use crate::stack::internet_checksum;
use crate::{counters, Socket};

const LOCALHOST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);

fn echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![8, 0, 0, 0];
    pkt.extend_from_slice(&ident.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(payload);
    let sum = internet_checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

#[test]
fn test_raw_ping() {
    let _guard = serial();
    let ctx = new_context();

    let mut sock = Socket::open_raw(&ctx).unwrap();
    let tx_before = counters::value(counters::RAW_TX_BYTES);
    let rx_before = counters::value(counters::RAW_RX_BYTES);

    let request = echo_request(0x1234, 1, b"abcdefgh");
    assert_eq!(
        sock.send_to(&request, Some(LOCALHOST)).unwrap(),
        request.len()
    );

    let mut buf = [0u8; 64];
    let (n, from) = sock.recv_from(&mut buf).unwrap();
    let reply = &buf[..n];

    assert_eq!(n, request.len());
    assert_eq!(reply[0], 0, "expected an echo reply");
    assert_eq!(internet_checksum(reply), 0, "reply checksum must verify");
    assert_eq!(&reply[4..6], &0x1234u16.to_be_bytes());
    assert_eq!(&reply[6..8], &1u16.to_be_bytes());
    assert_eq!(&reply[8..], b"abcdefgh");
    assert_eq!(from, Some(LOCALHOST));

    let len = request.len() as u64;
    assert_eq!(counters::value(counters::RAW_TX_BYTES), tx_before + len);
    assert_eq!(counters::value(counters::RAW_RX_BYTES), rx_before + len);
}

#[test]
fn test_raw_reply_truncation() {
    let _guard = serial();
    let ctx = new_context();

    let mut sock = Socket::open_raw(&ctx).unwrap();
    let request = echo_request(7, 1, &[0x55; 32]);
    sock.send_to(&request, Some(LOCALHOST)).unwrap();

    let mut buf = [0u8; 8];
    let (n, _) = sock.recv_from(&mut buf).unwrap();
    assert_eq!(n, 8);
    assert_eq!(buf[0], 0);
}

#[test]
fn test_raw_drop_while_slot_full() {
    let _guard = serial();
    let ctx = new_context();

    let mut sock = Socket::open_raw(&ctx).unwrap();
    sock.send_to(&echo_request(9, 1, b"one"), Some(LOCALHOST))
        .unwrap();
    // this reply lands while the first still occupies the slot
    sock.send_to(&echo_request(9, 2, b"two"), Some(LOCALHOST))
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = sock.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[6..8], &1u16.to_be_bytes());
    assert_eq!(&buf[8..n], b"one");

    let (done_tx, done_rx) = mpsc::channel();
    let reader = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let result = sock.recv_from(&mut buf).map(|(n, _)| buf[..n].to_vec());
        done_tx.send(()).unwrap();
        (result, sock)
    });
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    // a third ping from a second socket unblocks the parked reader
    let mut other = Socket::open_raw(&ctx).unwrap();
    other
        .send_to(&echo_request(9, 3, b"three"), Some(LOCALHOST))
        .unwrap();

    let (result, _sock) = reader.join().unwrap();
    let reply = result.unwrap();
    assert_eq!(&reply[6..8], &3u16.to_be_bytes());
}
