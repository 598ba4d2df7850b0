//! TLS acceptor setup for the WebSocket listener
//!
//! Loads the server certificate chain and private key from PEM files.
//! Client certificates are not requested.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Error type for TLS setup
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("{}: {}", path, e)))
}

/// Build a TLS acceptor from a PEM certificate chain and private key
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(e.to_string()))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert!(err.to_string().contains("Certificate error"));

        let err = TlsError::PrivateKeyError("key error".to_string());
        assert!(err.to_string().contains("Private key error"));

        let err = TlsError::ConfigError("config error".to_string());
        assert!(err.to_string().contains("TLS config error"));
    }

    #[test]
    fn test_missing_files() {
        let result = load_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(TlsError::Io(_))));
    }

    #[test]
    fn test_file_without_certificates() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();
        let path = cert.path().to_str().unwrap();

        let result = load_acceptor(path, path);
        assert!(matches!(result, Err(TlsError::CertificateError(_))));
    }
}
