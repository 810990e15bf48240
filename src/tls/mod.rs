//! Certificates for the client-facing side and upstream trust

mod ca;
mod cache;
mod mitm;

pub use ca::{CertificateAuthority, GeneratedCa};
pub use cache::CertificateCache;
pub use mitm::{server_config, CertificateProvider, MitmCertificateGenerator};

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Client config for server handshakes, trusting the public web roots.
pub fn upstream_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Client config trusting only the certificates in a PEM file.
pub fn upstream_client_config_from_pem(path: impl AsRef<Path>) -> Result<Arc<ClientConfig>> {
    let pem = std::fs::read(path.as_ref()).map_err(|e| {
        Error::certificate(format!(
            "Failed to read upstream CA '{}': {}",
            path.as_ref().display(),
            e
        ))
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(&pem[..]))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::certificate(format!("Invalid upstream CA PEM: {}", e)))?;
    trusting(certs)
}

/// Client config trusting exactly `certs`.
pub fn trusting(
    certs: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::certificate(format!("Invalid trust anchor: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(Error::certificate("No trust anchors found"));
    }
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}
