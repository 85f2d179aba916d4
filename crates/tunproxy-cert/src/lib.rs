//! TLS material for tunnel connections
//!
//! Servers present either a PEM certificate/key pair loaded from disk or a
//! self-signed certificate generated in memory at startup. Clients may pin
//! a custom CA bundle.

pub mod pem;
pub mod self_signed;

pub use pem::{load_certs, load_private_key};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),
}

/// Certificate chain and private key presented by a server
#[derive(Debug)]
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a PEM certificate chain and private key
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_chain = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        info!("Loaded TLS certificate from {}", cert_path.display());
        Ok(Self { cert_chain, key })
    }

    /// Generate an in-memory self-signed identity
    pub fn self_signed() -> Result<Self, CertError> {
        let cert = generate_self_signed_cert()?;
        info!("Generated self-signed TLS certificate");
        Ok(Self {
            cert_chain: vec![cert.cert_der],
            key: cert.key_der,
        })
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}
