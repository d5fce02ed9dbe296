//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on a random loopback port and talk to it
//! with a plain `TcpStream`, checking that bytes flow both ways and that
//! closing either side is observed by the other.

use questline_transport::{TcpTransport, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_tcp_accept_and_send_receive() {
    let transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = transport.local_addr().unwrap();

    let server = tokio::spawn(async move {
        transport.accept().await.expect("should accept")
    });
    let mut client = TcpStream::connect(addr).await.unwrap();
    let conn = server.await.unwrap();

    assert!(conn.id().into_inner() > 0);
    assert!(conn.peer_addr().is_some());

    // --- Server sends, client receives ---
    conn.send(b"hello from server").await.unwrap();
    let mut buf = [0u8; 17];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from server");

    // --- Client sends, server receives ---
    client.write_all(&[3]).await.unwrap();
    let got = conn.recv().await.unwrap().unwrap();
    assert_eq!(got, vec![3]);
}

#[tokio::test]
async fn test_tcp_client_disconnect_returns_none() {
    let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = transport.local_addr().unwrap();

    let server = tokio::spawn(async move { transport.accept().await.unwrap() });
    let client = TcpStream::connect(addr).await.unwrap();
    let conn = server.await.unwrap();

    drop(client);
    let got = conn.recv().await.unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn test_tcp_server_close_is_seen_by_client() {
    let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = transport.local_addr().unwrap();

    let server = tokio::spawn(async move { transport.accept().await.unwrap() });
    let mut client = TcpStream::connect(addr).await.unwrap();
    let conn = server.await.unwrap();

    conn.close().await.unwrap();
    let mut buf = [0u8; 4];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_tcp_bind_invalid_address_fails() {
    let result = TcpTransport::bind("not-an-address").await;
    assert!(result.is_err());
}
