//! Process-scoped state shared by every task
//!
//! The directory, router and tunnel pool are built once here and handed to
//! tasks through this context; nothing is global.

use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunproxy_cert::{load_certs, TlsIdentity};
use tunproxy_config::TransferConfig;
use tunproxy_control::ForwardingSpawner;
use tunproxy_forward::{ForwardContext, TunnelPool, TunnelReceiver};
use tunproxy_router::{OutboundDirectory, Router};
use tunproxy_transport_quic::{QuicConfig, QuicConnector, QuicListener};

use crate::TaskError;

type ForwardingFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct RuntimeContext {
    transfer: TransferConfig,
    directory: Arc<OutboundDirectory>,
    router: Arc<Router>,
    connector: Arc<QuicConnector>,
    forward: Arc<ForwardContext>,
    receiver: Arc<TunnelReceiver>,
    endpoint_addr: OnceLock<SocketAddr>,
    inbound_addrs: DashMap<String, SocketAddr>,
    cancel: CancellationToken,
}

impl RuntimeContext {
    /// Build the shared state; must run inside a tokio runtime
    pub fn new(transfer: &TransferConfig) -> Result<Self, TaskError> {
        let directory = Arc::new(OutboundDirectory::new());
        let router = Arc::new(Router::new(directory.clone()));

        let connector = Arc::new(QuicConnector::new(Arc::new(client_config(transfer)?))?);
        let pool = Arc::new(TunnelPool::new(connector.clone(), directory.clone()));
        let forward = Arc::new(
            ForwardContext::new(router.clone(), pool)
                .with_udp_idle_timeout(transfer.udp_idle_timeout()),
        );
        let receiver = Arc::new(TunnelReceiver::new(forward.clone()));

        Ok(Self {
            transfer: transfer.clone(),
            directory,
            router,
            connector,
            forward,
            receiver,
            endpoint_addr: OnceLock::new(),
            inbound_addrs: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn transfer(&self) -> &TransferConfig {
        &self.transfer
    }

    pub fn directory(&self) -> &Arc<OutboundDirectory> {
        &self.directory
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn connector(&self) -> &Arc<QuicConnector> {
        &self.connector
    }

    pub fn forward(&self) -> &Arc<ForwardContext> {
        &self.forward
    }

    /// Root cancellation token; tasks hand child tokens to their loops
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Serve tunnel traffic on forwarding endpoints created by the
    /// control server
    pub fn forwarding_spawner(&self) -> ForwardingSpawner {
        let receiver = self.receiver.clone();
        Arc::new(move |listener: QuicListener, cancel: CancellationToken| -> ForwardingFuture {
            Box::pin(receiver.clone().serve(listener, cancel))
        })
    }

    pub(crate) fn set_endpoint_addr(&self, addr: SocketAddr) {
        let _ = self.endpoint_addr.set(addr);
    }

    /// Bound address of the control endpoint once it is running
    pub fn endpoint_addr(&self) -> Option<SocketAddr> {
        self.endpoint_addr.get().copied()
    }

    pub(crate) fn set_inbound_addr(&self, tag: &str, addr: SocketAddr) {
        self.inbound_addrs.insert(tag.to_string(), addr);
    }

    /// Bound address of the inbound `tag` once it is running
    pub fn inbound_addr(&self, tag: &str) -> Option<SocketAddr> {
        self.inbound_addrs.get(tag).map(|addr| *addr)
    }
}

fn tuned(config: QuicConfig, transfer: &TransferConfig) -> QuicConfig {
    config
        .with_keep_alive(transfer.keep_alive_period())
        .with_idle_timeout(transfer.max_idle_timeout())
        .with_max_streams(
            transfer.max_bidi_remote_streams,
            transfer.max_uni_remote_streams,
        )
        .with_windows(
            transfer.max_stream_read_buffer_size,
            transfer.max_stream_write_buffer_size,
            transfer.max_conn_read_buffer_size,
        )
}

/// Client side of tunnel connections; peers are verified only when a CA
/// bundle is configured
pub fn client_config(transfer: &TransferConfig) -> Result<QuicConfig, TaskError> {
    let mut config = tuned(QuicConfig::client_default(), transfer);

    if let Some(ca) = transfer.tls.as_ref().and_then(|tls| tls.ca.as_ref()) {
        let roots = load_certs(ca)?
            .into_iter()
            .map(|cert| cert.as_ref().to_vec())
            .collect();
        debug!("Verifying tunnel peers against {}", ca.display());
        config = config.with_root_certs(roots);
    }

    Ok(config)
}

/// Server side of control and forwarding endpoints, presenting the
/// configured certificate or a self-signed one
pub fn server_config(transfer: &TransferConfig) -> Result<QuicConfig, TaskError> {
    let pem = transfer
        .tls
        .as_ref()
        .and_then(|tls| tls.crt.as_ref().zip(tls.key.as_ref()));

    let identity = match pem {
        Some((crt, key)) => TlsIdentity::from_pem_files(crt, key)?,
        None => TlsIdentity::self_signed()?,
    };

    Ok(tuned(QuicConfig::server(identity), transfer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transfer_settings_reach_quic_config() {
        let transfer = TransferConfig {
            max_bidi_remote_streams: 64,
            max_idle_timeout: 90,
            keep_alive_period: 15,
            max_stream_read_buffer_size: 1 << 20,
            ..TransferConfig::default()
        };

        let config = client_config(&transfer).unwrap();
        assert_eq!(config.max_concurrent_bidi_streams, 64);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(15));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(90));
        assert_eq!(config.stream_receive_window, Some(1 << 20));
        assert_eq!(config.send_window, None);
    }

    #[test]
    fn test_missing_ca_bundle_fails() {
        let transfer = TransferConfig {
            tls: Some(tunproxy_config::TlsConfig {
                crt: None,
                key: None,
                ca: Some("/nonexistent/ca.pem".into()),
            }),
            ..TransferConfig::default()
        };

        assert!(matches!(client_config(&transfer), Err(TaskError::Cert(_))));
    }
}
