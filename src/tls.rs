use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read cert file '{path}': {source}")]
    CertFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read key file '{path}': {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("no valid certificates found in '{0}'")]
    NoCerts(String),
    #[error("no valid private key found in '{0}'")]
    NoKey(String),
    #[error("failed to parse client CA bundle: {0}")]
    ClientCaParse(#[source] std::io::Error),
    #[error("client CA bundle contains no usable certificates")]
    NoClientCa,
    #[error("failed to build client certificate verifier: {0}")]
    ClientVerifier(#[from] VerifierBuilderError),
    #[error("failed to build TLS config: {0}")]
    RustlsConfig(#[from] rustls::Error),
}

/// Builds the HTTPS server identity. When a client CA bundle is given, client
/// certificates signed by it are verified, but connections without one are
/// still accepted.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_pem: Option<&str>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_display = cert_path.display().to_string();
    let key_display = key_path.display().to_string();

    let cert_data = fs::read(cert_path).map_err(|e| TlsError::CertFileRead {
        path: cert_display.clone(),
        source: e,
    })?;
    let key_data = fs::read(key_path).map_err(|e| TlsError::KeyFileRead {
        path: key_display.clone(),
        source: e,
    })?;

    let certs = parse_certs(&cert_data).map_err(|e| TlsError::CertFileRead {
        path: cert_display.clone(),
        source: e,
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_display));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_data.as_slice()))
        .map_err(|e| TlsError::KeyFileRead {
            path: key_display.clone(),
            source: e,
        })?
        .ok_or(TlsError::NoKey(key_display))?;

    let builder = ServerConfig::builder();
    let config = match client_ca_pem {
        Some(pem) => {
            let roots = client_ca_roots(pem)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    Ok(Arc::new(config))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, std::io::Error> {
    rustls_pemfile::certs(&mut BufReader::new(pem)).collect()
}

fn client_ca_roots(pem: &str) -> Result<RootCertStore, TlsError> {
    let certs = parse_certs(pem.as_bytes()).map_err(TlsError::ClientCaParse)?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(TlsError::NoClientCa);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let err = load_tls_config(
            Path::new("/nonexistent/tls.crt"),
            Path::new("/nonexistent/tls.key"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TlsError::CertFileRead { ref path, .. } if path == "/nonexistent/tls.crt"));
    }

    #[test]
    fn test_empty_client_ca_bundle() {
        assert!(matches!(client_ca_roots(""), Err(TlsError::NoClientCa)));
        assert!(matches!(
            client_ca_roots("not a pem bundle"),
            Err(TlsError::NoClientCa)
        ));
    }
}
