//! Instance lifecycle over loopback: one node serving a control endpoint,
//! one node with a SOCKS5 inbound tunneling through it

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tunproxy_config::{Config, ConfigError};
use tunproxy_core::{Instance, InstanceError};
use tunproxy_router::Route;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn start_server_node() -> (Instance, SocketAddr) {
    init_crypto_provider();

    let config = Config::from_yaml(
        r#"
transfer: { keepAlivePeriod: 1, maxIdleTimeout: 10 }
endpoint: { address: 127.0.0.1, port: 0, randPort: "42000-48000" }
"#,
    )
    .unwrap();

    let instance = Instance::new(&config).unwrap();
    instance.start().await.unwrap();
    let addr = instance
        .context()
        .endpoint_addr()
        .expect("endpoint address not recorded");

    (instance, addr)
}

fn client_config(endpoint_port: u16) -> Config {
    Config::from_yaml(&format!(
        r#"
transfer: {{ keepAlivePeriod: 1, maxIdleTimeout: 10 }}
inbounds:
  - {{ tag: lan, address: 127.0.0.1, port: 0, protocol: socks }}
outbounds:
  - {{ tag: vpn1, address: 127.0.0.1, port: {endpoint_port} }}
"#
    ))
    .unwrap()
}

async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 target expected");
    };
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "CONNECT rejected");

    stream
}

#[tokio::test]
async fn test_empty_config_is_rejected() {
    let result = Instance::new(&Config::default());
    assert!(matches!(
        result,
        Err(InstanceError::Config(ConfigError::NothingToRun))
    ));
}

#[tokio::test]
async fn test_two_nodes_tunnel_socks_traffic() {
    let echo = start_tcp_echo().await;
    let (server, endpoint) = start_server_node().await;

    let client = Instance::new(&client_config(endpoint.port())).unwrap();
    timeout(TEST_TIMEOUT, client.start())
        .await
        .expect("start timeout")
        .expect("client failed to start");
    assert!(client.is_running().await);

    let ctx = client.context();
    let peer = ctx.directory().get("vpn1").expect("vpn1 not negotiated");
    assert!((42000..=48000).contains(&peer.node_port));
    assert_eq!(
        ctx.router().decide("lan", Some(echo.ip())),
        Route::Tunnel("vpn1".to_string())
    );

    let proxy = ctx.inbound_addr("lan").expect("inbound address not recorded");
    timeout(TEST_TIMEOUT, async {
        let mut stream = socks_connect(proxy, echo).await;
        stream.write_all(b"across two nodes").await.unwrap();
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"across two nodes");
    })
    .await
    .expect("test timeout");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (server, _) = start_server_node().await;
    assert!(server.is_running().await);

    server.close().await.unwrap();
    assert!(!server.is_running().await);
    server.close().await.unwrap();

    assert!(matches!(server.start().await, Err(InstanceError::Closed)));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (server, _) = start_server_node().await;
    assert!(matches!(
        server.start().await,
        Err(InstanceError::AlreadyStarted)
    ));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_inbound_bind_failure_aborts_start() {
    init_crypto_provider();
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let config = Config::from_yaml(&format!(
        "inbounds:\n  - {{ tag: web, address: 127.0.0.1, port: {port}, protocol: http }}\n"
    ))
    .unwrap();
    let instance = Instance::new(&config).unwrap();

    let result = instance.start().await;
    assert!(matches!(
        result,
        Err(InstanceError::Start {
            task: "inbounds",
            ..
        })
    ));

    instance.close().await.unwrap();
}
