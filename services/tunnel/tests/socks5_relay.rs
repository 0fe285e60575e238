
use std::time::Duration;

use burrow_addr::TargetAddress;
use harness::{closed_within, read_reply, socks5_connect, ProxyHandle, EchoTarget};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const IDLE: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(3);

async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    let (mut reader, mut writer) = stream.split();
    let mut buf = vec![0u8; payload.len()];
    let (written, read) = tokio::time::timeout(WAIT, async {
        tokio::join!(writer.write_all(payload), reader.read_exact(&mut buf))
    })
    .await
    .expect("echo timed out");
    written.unwrap();
    read.unwrap();
    buf
}

#[tokio::test]
async fn relays_to_ipv4_target() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let target = TargetAddress::from(backend.addr);
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &target).await.unwrap();
    assert_eq!(code, 0x00);

    assert_eq!(roundtrip(&mut stream, b"hello through the tunnel").await, b"hello through the tunnel");

    // Larger than a single read to exercise flow control.
    let big: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(roundtrip(&mut stream, &big).await, big);

    assert_eq!(backend.accepted(), 1);
    assert_eq!(backend.received(), (24 + big.len()) as u64);
}

#[tokio::test]
async fn relays_to_domain_target() {
    // Only the first answer is used, so listen where that answer points.
    let first = tokio::net::lookup_host(("localhost", 0))
        .await
        .unwrap()
        .next()
        .unwrap();
    let backend = EchoTarget::spawn_on(first).await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let target = TargetAddress::domain("localhost", backend.addr.port()).unwrap();
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &target).await.unwrap();
    assert_eq!(code, 0x00);
    assert_eq!(roundtrip(&mut stream, b"by name").await, b"by name");
}

#[tokio::test]
async fn numeric_domain_skips_resolution() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let target = TargetAddress::domain("127.0.0.1", backend.addr.port()).unwrap();
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &target).await.unwrap();
    assert_eq!(code, 0x00);
    assert_eq!(roundtrip(&mut stream, b"literal").await, b"literal");
}

#[tokio::test]
async fn non_utf8_domain_is_host_unreachable() {
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let target = TargetAddress::domain(vec![0xC3, 0x28], 80).unwrap();
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &target).await.unwrap();
    assert_eq!(code, 0x04);
    assert!(closed_within(&mut stream, WAIT).await);
}

#[tokio::test]
async fn reply_carries_bound_address() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&TargetAddress::from(backend.addr).to_bytes().unwrap());
    stream.write_all(&request).await.unwrap();

    let (code, bound) = read_reply(&mut stream).await.unwrap();
    assert_eq!(code, 0x00);
    let bound = bound.to_socket_addr().unwrap();
    assert!(bound.ip().is_loopback());
    assert_ne!(bound.port(), 0);
}

#[tokio::test]
async fn pipelined_handshake_and_early_data() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    // Greeting, request and first payload in one write.
    let mut burst = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00];
    burst.extend_from_slice(&TargetAddress::from(backend.addr).to_bytes().unwrap());
    burst.extend_from_slice(b"early bytes");

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(&burst).await.unwrap();

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let (code, _) = read_reply(&mut stream).await.unwrap();
    assert_eq!(code, 0x00);

    let mut echoed = [0u8; 11];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"early bytes");
}

#[tokio::test]
async fn split_handshake_frames() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    for byte in [0x05u8, 0x01, 0x00] {
        stream.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&TargetAddress::from(backend.addr).to_bytes().unwrap());
    let (head, tail) = request.split_at(5);
    stream.write_all(head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    stream.write_all(tail).await.unwrap();

    let (code, _) = read_reply(&mut stream).await.unwrap();
    assert_eq!(code, 0x00);
}

#[tokio::test]
async fn no_acceptable_method_closes() {
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    // Username/password only.
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0xFF]);
    assert!(closed_within(&mut stream, WAIT).await);
}

#[tokio::test]
async fn unsupported_command_is_rejected() {
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    // BIND
    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let (code, _) = read_reply(&mut stream).await.unwrap();
    assert_eq!(code, 0x07);
    assert!(closed_within(&mut stream, WAIT).await);
}

#[tokio::test]
async fn bad_version_closes_without_reply() {
    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00, 0x50]).await.unwrap();
    assert!(closed_within(&mut stream, WAIT).await);
}

#[tokio::test]
async fn refused_target_closes_client() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();
    let result = socks5_connect(proxy.listen_addr, &TargetAddress::from(dead_addr)).await;

    // A refused connect tears the tunnel down before any reply is sent.
    assert!(result.is_err());
}

#[tokio::test]
async fn idle_relay_times_out() {
    let backend = EchoTarget::spawn().await.unwrap();
    let proxy = ProxyHandle::socks5(Duration::from_millis(200)).await.unwrap();

    let target = TargetAddress::from(backend.addr);
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &target).await.unwrap();
    assert_eq!(code, 0x00);

    assert!(closed_within(&mut stream, WAIT).await);
}

#[tokio::test]
async fn backend_close_ends_tunnel() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = backend.accept().await {
            let _ = stream.write_all(b"bye").await;
        }
    });

    let proxy = ProxyHandle::socks5(IDLE).await.unwrap();
    let (mut stream, code) = socks5_connect(proxy.listen_addr, &TargetAddress::from(backend_addr))
        .await
        .unwrap();
    assert_eq!(code, 0x00);

    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bye");
    assert!(closed_within(&mut stream, WAIT).await);
}
