//! QUIC transport configuration

use std::sync::Arc;
use std::time::Duration;
use tunproxy_cert::TlsIdentity;
use tunproxy_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,

    /// Certificate presented by listeners (servers only)
    identity: Option<TlsIdentity>,

    pub keep_alive_interval: Duration,

    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_bidi_streams: u32,

    /// Maximum number of concurrent unidirectional streams the peer may open
    pub max_concurrent_uni_streams: u32,

    /// Per-stream receive window in bytes (quinn default when `None`)
    pub stream_receive_window: Option<u64>,

    /// Per-connection send window in bytes (quinn default when `None`)
    pub send_window: Option<u64>,

    /// Per-connection receive window in bytes (quinn default when `None`)
    pub receive_window: Option<u64>,
}

impl QuicConfig {
    /// Client configuration with defaults
    ///
    /// Certificate verification is off unless roots are added with
    /// [`QuicConfig::with_root_certs`].
    pub fn client_default() -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            identity: None,
            keep_alive_interval: Duration::from_secs(20),
            max_idle_timeout: Duration::from_secs(30 * 60),
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 0,
            stream_receive_window: None,
            send_window: None,
            receive_window: None,
        }
    }

    /// Server configuration presenting `identity`
    pub fn server(identity: TlsIdentity) -> Self {
        Self {
            identity: Some(identity),
            ..Self::client_default()
        }
    }

    /// Server configuration with a freshly generated self-signed certificate
    pub fn server_self_signed() -> TransportResult<Self> {
        let identity =
            TlsIdentity::self_signed().map_err(|e| TransportError::TlsError(e.to_string()))?;
        Ok(Self::server(identity))
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, bidi: u32, uni: u32) -> Self {
        self.max_concurrent_bidi_streams = bidi;
        self.max_concurrent_uni_streams = uni;
        self
    }

    /// Flow-control windows; zero keeps the quinn default
    pub fn with_windows(mut self, stream_receive: u64, send: u64, receive: u64) -> Self {
        let non_zero = |v: u64| (v > 0).then_some(v);
        self.stream_receive_window = non_zero(stream_receive);
        self.send_window = non_zero(send);
        self.receive_window = non_zero(receive);
        self
    }

    /// Verify servers against the given DER roots
    pub fn with_root_certs(mut self, roots: Vec<Vec<u8>>) -> Self {
        self.security.root_certs = roots;
        self.security.verify_server_cert = true;
        self
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let var_int = |value: u64, what: &str| {
            quinn::VarInt::from_u64(value)
                .map_err(|_| TransportError::ConfigurationError(format!("{} out of range", what)))
        };

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(
            self.max_concurrent_bidi_streams,
        ));
        transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(
            self.max_concurrent_uni_streams,
        ));
        if let Some(window) = self.stream_receive_window {
            transport.stream_receive_window(var_int(window, "Stream receive window")?);
        }
        if let Some(window) = self.receive_window {
            transport.receive_window(var_int(window, "Connection receive window")?);
        }
        if let Some(window) = self.send_window {
            transport.send_window(window);
        }
        Ok(transport)
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let builder = quinn::rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&quinn::rustls::version::TLS13])
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut client_crypto = if self.security.verify_server_cert {
            let mut roots = quinn::rustls::RootCertStore::empty();
            if self.security.root_certs.is_empty() {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            } else {
                for cert_der in &self.security.root_certs {
                    roots
                        .add(quinn::rustls::pki_types::CertificateDer::from(
                            cert_der.clone(),
                        ))
                        .map_err(|e| {
                            TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                        })?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self.alpn();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server certificate required".to_string())
        })?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&quinn::rustls::version::TLS13])
            .map_err(|e| TransportError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = self.alpn();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }
}

fn crypto_provider() -> Arc<quinn::rustls::crypto::CryptoProvider> {
    Arc::new(quinn::rustls::crypto::ring::default_provider())
}

// Accepts any server certificate; peers present self-signed certificates.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
