//! Integration tests for the QUIC transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tunproxy_transport::{
    TransportConnection, TransportConnector, TransportListener, TransportStream,
};
use tunproxy_transport_quic::{QuicConfig, QuicConnector, QuicListener};

use std::sync::OnceLock;
static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn create_test_server() -> (QuicListener, SocketAddr) {
    init_crypto_provider();

    let config = Arc::new(QuicConfig::server_self_signed().expect("Failed to create server config"));

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = QuicListener::new(bind_addr, config).expect("Failed to create listener");
    let local_addr = listener.local_addr().expect("Failed to get local addr");

    (listener, local_addr)
}

fn create_test_client() -> QuicConnector {
    let config = Arc::new(
        QuicConfig::client_default()
            .with_keep_alive(Duration::from_secs(2))
            .with_idle_timeout(Duration::from_secs(10)),
    );

    QuicConnector::new(config).expect("Failed to create connector")
}

#[tokio::test]
async fn test_quic_connection_establishment() {
    let (listener, server_addr) = create_test_server();
    let connector = create_test_client();

    let server_task = tokio::spawn(async move {
        let result = timeout(Duration::from_secs(5), listener.accept()).await;
        result.expect("Server timeout").expect("Accept failed")
    });

    let client_conn = timeout(
        Duration::from_secs(5),
        connector.connect(server_addr, "localhost"),
    )
    .await
    .expect("Client timeout")
    .expect("Connect failed");

    let (server_conn, remote_addr) = server_task.await.expect("Server task failed");

    assert!(!client_conn.is_closed());
    assert!(!server_conn.is_closed());
    assert_eq!(client_conn.remote_address(), server_addr);
    assert_eq!(server_conn.remote_address(), remote_addr);
    assert!(client_conn.connection_id().starts_with("quic-"));
}

#[tokio::test]
async fn test_quic_stream_echo() {
    let (listener, server_addr) = create_test_server();
    let connector = create_test_client();

    let server_task = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.expect("Accept failed");
        let mut stream = conn
            .accept_stream()
            .await
            .expect("Failed to accept stream")
            .expect("No stream available");

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("Failed to read");
        stream.write_all(&buf).await.expect("Failed to echo");
        stream.finish().await.expect("Failed to finish");
        // Keep the connection alive until the client has read the echo.
        tokio::time::sleep(Duration::from_millis(200)).await;
        conn
    });

    let client_conn = connector
        .connect(server_addr, "localhost")
        .await
        .expect("Connect failed");

    let mut stream = client_conn
        .open_stream()
        .await
        .expect("Failed to open stream");
    stream.write_all(b"ping").await.expect("Failed to send");
    stream.finish().await.expect("Failed to finish");

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut echoed))
        .await
        .expect("Echo timeout")
        .expect("Failed to read echo");
    assert_eq!(echoed, b"ping");

    server_task.await.expect("Server task failed");
}

#[tokio::test]
async fn test_split_halves_move_independently() {
    let (listener, server_addr) = create_test_server();
    let connector = create_test_client();

    let server_task = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.expect("Accept failed");
        let stream = conn.accept_stream().await.unwrap().unwrap();
        let (mut send, mut recv) = stream.split();

        let mut buf = [0u8; 5];
        recv.read_exact(&mut buf).await.unwrap();
        send.write_all(&buf).await.unwrap();
        send.finish().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        conn
    });

    let client_conn = connector.connect(server_addr, "localhost").await.unwrap();
    let (mut send, mut recv) = client_conn.open_stream().await.unwrap().split();

    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        recv.read_to_end(&mut out).await.unwrap();
        out
    });
    send.write_all(b"hello").await.unwrap();

    let echoed = timeout(Duration::from_secs(5), reader)
        .await
        .expect("Reader timeout")
        .unwrap();
    assert_eq!(echoed, b"hello");

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_accept_stream_returns_none_after_close() {
    let (listener, server_addr) = create_test_server();
    let connector = create_test_client();

    let server_task = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        timeout(Duration::from_secs(5), conn.accept_stream()).await
    });

    let client_conn = connector.connect(server_addr, "localhost").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client_conn.close(0, "done").await;
    assert!(client_conn.is_closed());

    let accepted = server_task.await.unwrap().expect("Accept timeout").unwrap();
    assert!(accepted.is_none());
}

#[tokio::test]
async fn test_connect_to_closed_listener_fails() {
    let (listener, server_addr) = create_test_server();
    listener.close().await;
    drop(listener);

    let connector = QuicConnector::new(Arc::new(
        QuicConfig::client_default()
            .with_keep_alive(Duration::from_millis(200))
            .with_idle_timeout(Duration::from_secs(1)),
    ))
    .unwrap();

    let result = timeout(
        Duration::from_secs(5),
        connector.connect(server_addr, "localhost"),
    )
    .await
    .expect("Connect should give up on its own");
    assert!(result.is_err());
}
