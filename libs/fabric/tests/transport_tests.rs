use std::time::Duration;

use meridian_core::BasicStream;
use meridian_fabric::{
    error::Error,
    transport::{
        Acceptor, Connector, TcpAcceptor, TcpConnector, Transceiver, TransceiverReader,
        TransceiverWriter, UdpConnector, UdpTransceiver, MAX_DATAGRAM_SIZE,
    },
    Endpoint,
};
use tokio::io::AsyncWriteExt;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Helper to bind an acceptor on a free port
async fn get_acceptor() -> (TcpAcceptor, Endpoint) {
    let acceptor = TcpAcceptor::bind(Endpoint::tcp("127.0.0.1", 0))
        .await
        .unwrap();
    let endpoint = acceptor.local_endpoint().clone();
    (acceptor, endpoint)
}

fn stream_of(bytes: &[u8]) -> BasicStream {
    BasicStream::from_vec(bytes.to_vec())
}

/// Buffer expecting exactly `len` bytes
fn expecting(len: usize) -> BasicStream {
    let mut buf = BasicStream::new();
    buf.resize(len);
    buf
}

#[tokio::test]
async fn acceptor_resolves_ephemeral_port() {
    let (_acceptor, endpoint) = get_acceptor().await;
    assert_ne!(endpoint.port, 0);
    assert_eq!(endpoint.host, "127.0.0.1");
}

#[tokio::test]
async fn tcp_send_receive() {
    let (acceptor, endpoint) = get_acceptor().await;

    // Spawn server
    let server = tokio::spawn(async move {
        let transceiver = acceptor.accept().await.unwrap();
        assert!(!transceiver.datagram());
        let (mut reader, mut writer) = transceiver.split();
        let mut buf = expecting(11);
        reader.read(&mut buf).await.unwrap();
        writer.write(&buf).await.unwrap(); // Echo back
    });

    // Client
    let transceiver = TcpConnector::new(endpoint).connect(TIMEOUT).await.unwrap();
    assert!(transceiver.description().contains("remote address = 127.0.0.1"));
    let (mut reader, mut writer) = transceiver.split();
    writer.write(&stream_of(b"hello world")).await.unwrap();

    let mut response = expecting(11);
    reader.read(&mut response).await.unwrap();
    assert_eq!(response.as_bytes(), b"hello world");
    assert_eq!(response.pos(), 11);
    server.await.unwrap();
}

#[tokio::test]
async fn tcp_read_fills_from_position() {
    let (acceptor, endpoint) = get_acceptor().await;

    tokio::spawn(async move {
        let transceiver = acceptor.accept().await.unwrap();
        let (_reader, mut writer) = transceiver.split();
        writer.write(&stream_of(b"headbody")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let transceiver = TcpConnector::new(endpoint).connect(TIMEOUT).await.unwrap();
    let (mut reader, _writer) = transceiver.split();

    // First the fixed-size part, then grow and read the rest
    let mut buf = expecting(4);
    reader.read(&mut buf).await.unwrap();
    assert_eq!(buf.as_bytes(), b"head");
    buf.resize(8);
    reader.read(&mut buf).await.unwrap();
    assert_eq!(buf.as_bytes(), b"headbody");
}

#[tokio::test]
async fn tcp_peer_close_is_connection_lost() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    // Server sends half a message and hangs up
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"ab").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let transceiver = TcpConnector::new(Endpoint::tcp("127.0.0.1", port))
        .connect(TIMEOUT)
        .await
        .unwrap();
    let (mut reader, _writer) = transceiver.split();
    let mut buf = expecting(14);
    let result = reader.read(&mut buf).await;
    assert!(matches!(result, Err(Error::ConnectionLost)));
}

#[tokio::test]
async fn tcp_connect_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = TcpConnector::new(Endpoint::tcp("127.0.0.1", port))
        .connect(TIMEOUT)
        .await;
    match result {
        Err(Error::ConnectionRefused(address)) => assert!(address.ends_with(&port.to_string())),
        Err(other) => panic!("Expected connection refused, got {other}"),
        Ok(_) => panic!("Expected connection refused"),
    }
}

#[tokio::test]
async fn udp_datagrams_round_trip() {
    let server = UdpTransceiver::bind(&Endpoint::udp("127.0.0.1", 0))
        .await
        .unwrap();
    let endpoint = server.local_endpoint(&Endpoint::udp("127.0.0.1", 0)).unwrap();
    assert_ne!(endpoint.port, 0);
    let (mut server_reader, mut server_writer) = Box::new(server).split();

    let client = UdpConnector::new(endpoint).connect(TIMEOUT).await.unwrap();
    assert!(client.datagram());
    let (mut client_reader, mut client_writer) = client.split();

    client_writer.write(&stream_of(b"ping")).await.unwrap();
    let mut received = BasicStream::new();
    server_reader.read(&mut received).await.unwrap();
    assert_eq!(received.as_bytes(), b"ping");

    // The server answers whoever sent last
    server_writer.write(&stream_of(b"pong")).await.unwrap();
    let mut reply = stream_of(b"stale contents");
    client_reader.read(&mut reply).await.unwrap();
    assert_eq!(reply.as_bytes(), b"pong");
}

#[tokio::test]
async fn udp_rejects_oversized_datagram() {
    let server = UdpTransceiver::bind(&Endpoint::udp("127.0.0.1", 0))
        .await
        .unwrap();
    let endpoint = server.local_endpoint(&Endpoint::udp("127.0.0.1", 0)).unwrap();

    let client = UdpConnector::new(endpoint).connect(TIMEOUT).await.unwrap();
    let (_reader, mut writer) = client.split();
    let oversized = BasicStream::from_vec(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
    let result = writer.write(&oversized).await;
    assert!(matches!(result, Err(Error::DatagramLimit { size }) if size == MAX_DATAGRAM_SIZE + 1));
}

#[tokio::test]
async fn unbound_udp_server_cannot_send() {
    let server = UdpTransceiver::bind(&Endpoint::udp("127.0.0.1", 0))
        .await
        .unwrap();
    let (_reader, mut writer) = Box::new(server).split();
    let result = writer.write(&stream_of(b"nobody")).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
}
