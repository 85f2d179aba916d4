//! Self-signed certificate generation
//!
//! Tunnel peers authenticate nothing beyond the TLS handshake itself, so a
//! fresh certificate per process is enough when no PEM material is
//! configured.

use crate::CertError;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime};

const VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Generate a self-signed certificate
///
/// - Valid for one year from now
/// - SANs: localhost, 127.0.0.1, ::1
/// - Random serial number
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "tunproxy");
    dn.push(DnType::OrganizationName, "tunproxy");
    params.distinguished_name = dn;

    let localhost =
        Ia5String::try_from("localhost").map_err(|e| CertError::GenerationFailed(e.to_string()))?;
    params.subject_alt_names = vec![
        SanType::DnsName(localhost),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| CertError::GenerationFailed(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}
