//! Control-plane negotiation over loopback QUIC

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tunproxy_config::{OutboundConfig, PortRange};
use tunproxy_control::{
    ControlError, ControlServer, ForwardingSpawner, OutboundInitiator, RandomPortAllocator,
};
use tunproxy_router::OutboundDirectory;
use tunproxy_transport::{
    TransportConnection, TransportConnector, TransportListener, TransportStream,
};
use tunproxy_transport_quic::{QuicConfig, QuicConnector, QuicListener};

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn client_config() -> Arc<QuicConfig> {
    Arc::new(
        QuicConfig::client_default()
            .with_keep_alive(Duration::from_secs(1))
            .with_idle_timeout(Duration::from_secs(5)),
    )
}

type ForwardingFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Forwarding loop that echoes every stream it accepts
fn echo_forwarding() -> ForwardingSpawner {
    Arc::new(|listener: QuicListener, cancel: CancellationToken| -> ForwardingFuture {
        Box::pin(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((connection, _)) = accepted else {
                    return;
                };
                tokio::spawn(async move {
                    while let Ok(Some(mut stream)) = connection.accept_stream().await {
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 1024];
                            while let Ok(n) = stream.read(&mut buf).await {
                                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                            let _ = stream.finish().await;
                        });
                    }
                });
            }
        })
    })
}

fn start_server() -> (Arc<ControlServer>, SocketAddr, CancellationToken) {
    init_crypto_provider();

    let server_config = Arc::new(QuicConfig::server_self_signed().unwrap());
    let allocator = Arc::new(RandomPortAllocator::new(PortRange::new(42000, 48000).unwrap()));
    let server = ControlServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_config,
        allocator,
        echo_forwarding(),
    )
    .unwrap()
    .with_grace(Duration::from_millis(200));
    let addr = server.local_addr().unwrap();

    let server = Arc::new(server);
    let cancel = CancellationToken::new();
    tokio::spawn(server.clone().run(cancel.clone()));

    (server, addr, cancel)
}

fn outbound(tag: &str, port: u16) -> OutboundConfig {
    OutboundConfig {
        tag: tag.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        node_port: 0,
    }
}

#[tokio::test]
async fn test_negotiated_port_serves_forwarding_traffic() {
    let (server, addr, cancel) = start_server();

    let connector = Arc::new(QuicConnector::new(client_config()).unwrap());
    let directory = Arc::new(OutboundDirectory::new());
    let initiator = OutboundInitiator::new(connector.clone(), directory.clone());

    timeout(
        Duration::from_secs(10),
        initiator.negotiate_all(&[outbound("vpn1", addr.port())]),
    )
    .await
    .expect("negotiation timeout")
    .expect("negotiation failed");

    let peer = directory.get("vpn1").expect("vpn1 not resolved");
    assert_eq!(peer.address, "127.0.0.1");
    assert!((42000..=48000).contains(&peer.node_port));
    assert_eq!(directory.default_tag().as_deref(), Some("vpn1"));

    let forwarding_addr: SocketAddr = peer.forwarding_addr().to_string().parse().unwrap();
    let connection = timeout(
        Duration::from_secs(5),
        connector.connect(forwarding_addr, "localhost"),
    )
    .await
    .expect("connect timeout")
    .expect("connect failed");

    let mut stream = connection.open_stream().await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timeout")
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(server.active_endpoints(), 1);

    cancel.cancel();
    server.close().await;
}

#[tokio::test]
async fn test_requested_node_port_is_honored() {
    let (server, addr, cancel) = start_server();

    let requested = {
        let probe = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let connector = Arc::new(QuicConnector::new(client_config()).unwrap());
    let directory = Arc::new(OutboundDirectory::new());
    let initiator = OutboundInitiator::new(connector, directory.clone());

    let mut config = outbound("vpn1", addr.port());
    config.node_port = requested;
    let peer = timeout(Duration::from_secs(10), initiator.negotiate(&config))
        .await
        .expect("negotiation timeout")
        .expect("negotiation failed");

    assert_eq!(peer.node_port, requested);

    cancel.cancel();
    server.close().await;
}

#[tokio::test]
async fn test_failures_are_aggregated() {
    let (server, addr, cancel) = start_server();

    // Nothing listens on this port
    let dead_port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let connector = Arc::new(QuicConnector::new(client_config()).unwrap());
    let directory = Arc::new(OutboundDirectory::new());
    let initiator = OutboundInitiator::new(connector, directory.clone())
        .with_timeout(Duration::from_millis(500));

    let result = initiator
        .negotiate_all(&[outbound("good", addr.port()), outbound("dead", dead_port)])
        .await;

    match result {
        Err(ControlError::Negotiation(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "dead");
        }
        other => panic!("expected aggregated failure, got {:?}", other),
    }
    assert!(directory.get("good").is_some());
    assert!(directory.get("dead").is_none());

    cancel.cancel();
    server.close().await;
}

#[tokio::test]
async fn test_close_aborts_forwarding_endpoints() {
    let (server, addr, cancel) = start_server();

    let connector = Arc::new(QuicConnector::new(client_config()).unwrap());
    let directory = Arc::new(OutboundDirectory::new());
    let initiator = OutboundInitiator::new(connector, directory);

    initiator.negotiate(&outbound("vpn1", addr.port())).await.unwrap();
    assert_eq!(server.active_endpoints(), 1);

    cancel.cancel();
    server.close().await;

    for _ in 0..50 {
        if server.active_endpoints() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.active_endpoints(), 0);
}
