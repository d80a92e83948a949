//! PEM certificate loading for the encrypted WebSocket listener.

use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Builds a TLS acceptor from a PEM certificate chain and private key.
///
/// The key may be PKCS#8, PKCS#1 or SEC1 encoded; the first key found in
/// `key_file` is used.
pub fn load_tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(format!("protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("build server config: {e}")))?;

    info!("🔒 TLS configured: cert='{}' key='{}'", cert_file, key_file);
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::Tls(format!("certificate file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::Tls(format!("private key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::Tls(format!("parse private key: {e}")))?
        .ok_or_else(|| ServerError::Tls(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_identity(dir: &TempDir) -> (String, String) {
        let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, identity.cert.pem()).unwrap();
        std::fs::write(&key_path, identity.key_pair.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn test_load_pem_pair() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_identity(&dir);
        assert!(load_tls_acceptor(&cert, &key).is_ok());
    }

    #[test]
    fn test_missing_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.pem").to_string_lossy().into_owned();
        assert!(matches!(
            load_tls_acceptor(&missing, &missing),
            Err(ServerError::Tls(_))
        ));
    }

    #[test]
    fn test_key_file_without_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (cert, _key) = write_identity(&dir);
        // The certificate file carries no private key block.
        assert!(matches!(load_tls_acceptor(&cert, &cert), Err(ServerError::Tls(_))));
    }
}
