//! Per-host certificates for the client-facing handshake

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::time::Duration;

use super::ca::CertificateAuthority;
use super::cache::CertificateCache;
use crate::error::{Error, Result};

/// Supplies the chain and key presented to a client for a host name.
pub trait CertificateProvider: Send + Sync {
    fn certificate_for(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;

    /// Root clients must trust to accept the issued chains.
    fn ca_cert_der(&self) -> &CertificateDer<'static>;
}

/// Issues leaf certificates from a local CA and caches them per host.
pub struct MitmCertificateGenerator {
    ca: CertificateAuthority,
    cache: CertificateCache,
}

impl std::fmt::Debug for MitmCertificateGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmCertificateGenerator")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl MitmCertificateGenerator {
    pub fn new(ca: CertificateAuthority) -> Self {
        Self {
            ca,
            cache: CertificateCache::default(),
        }
    }

    pub fn with_cache(ca: CertificateAuthority, capacity: usize, ttl: Duration) -> Self {
        Self {
            ca,
            cache: CertificateCache::new(capacity, ttl),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

impl CertificateProvider for MitmCertificateGenerator {
    fn certificate_for(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let host = host.to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&host) {
            tracing::trace!(host = %host, "Using cached certificate");
            return Ok(cached);
        }

        tracing::debug!(host = %host, "Issuing certificate");
        let (leaf, key) = self.ca.issue(&host)?;
        let chain = vec![leaf, self.ca.cert_der().clone()];
        self.cache.insert(host, chain.clone(), key.clone_key());
        Ok((chain, key))
    }

    fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca.cert_der()
    }
}

/// Server config for one client handshake, presenting at most one ALPN id.
///
/// `None` presents no ALPN so the client falls back to its default.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: Option<&[u8]>,
) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;
    config.alpn_protocols = alpn.map(|id| vec![id.to_vec()]).unwrap_or_default();
    Ok(config)
}
