//! PEM file loading

use crate::CertError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Read {
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertError::Read {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_self_signed_cert;

    #[test]
    fn test_load_generated_pem() {
        let dir = tempfile::tempdir().unwrap();
        let cert = generate_self_signed_cert().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, &cert.pem_cert).unwrap();
        std::fs::write(&key_path, &cert.pem_key).unwrap();

        let certs = load_certs(&cert_path).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0], cert.cert_der);
        assert!(load_private_key(&key_path).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, CertError::Read { .. }));
    }

    #[test]
    fn test_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a pem file\n").unwrap();

        assert!(matches!(
            load_private_key(&path),
            Err(CertError::NoPrivateKey(_))
        ));
        assert!(matches!(load_certs(&path), Err(CertError::NoCertificates(_))));
    }
}
