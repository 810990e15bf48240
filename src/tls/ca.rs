//! Interception certificate authority

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{Error, Result};

const CA_COMMON_NAME: &str = "Tlsplice Interception CA";
const CA_ORGANIZATION: &str = "Tlsplice";

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

/// A freshly generated CA in PEM form
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
}

impl GeneratedCa {
    /// Generate a self-signed CA valid for ten years
    pub fn generate() -> Result<Self> {
        let mut params = ca_params();
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Write certificate and key; the key file is made owner-only on Unix.
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), &self.key_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path.as_ref())?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path.as_ref(), perms)?;
        }

        Ok(())
    }
}

/// CA used to sign the per-host certificates presented to clients.
pub struct CertificateAuthority {
    key_pair: KeyPair,
    /// Issuer used for signing, rebuilt from the loaded certificate's name.
    issuer: Certificate,
    cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

        let mut reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in PEM"))?
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

        let issuer = CertificateParams::from_ca_cert_der(&cert_der)
            .and_then(|params| params.self_signed(&key_pair))
            .map_err(|e| Error::certificate(format!("Failed to prepare CA issuer: {}", e)))?;

        Ok(Self {
            key_pair,
            issuer,
            cert_der,
        })
    }

    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;
        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Issue a one-day leaf certificate for `host`.
    ///
    /// IP literals get an IP SAN, everything else a DNS SAN.
    pub fn issue(&self, host: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, host);
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|e| {
                Error::certificate(format!("Invalid hostname '{}': {}", host, e))
            })?),
        }];
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_after = params.not_before + time::Duration::days(1);

        let leaf_key = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;

        Ok((
            CertificateDer::from(cert.der().to_vec()),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        ))
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsplice_test_support::test_report;

    fn load_generated() -> CertificateAuthority {
        let generated = GeneratedCa::generate().unwrap();
        CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap()
    }

    #[test]
    fn test_generate_ca_pem() {
        let t = test_report!("Generated CA is PEM encoded");
        let ca = GeneratedCa::generate().unwrap();
        t.assert_contains("certificate", &ca.cert_pem, "BEGIN CERTIFICATE");
        t.assert_contains("key", &ca.key_pem, "BEGIN PRIVATE KEY");
    }

    #[test]
    fn test_issue_for_dns_and_ip() {
        let t = test_report!("Leaf certificates issue for names and IP literals");
        let ca = load_generated();
        let (dns, key) = ca.issue("api.example.com").unwrap();
        t.assert_true("dns cert", !dns.is_empty());
        t.assert_true("dns key", !key.secret_der().is_empty());

        let (v4, _) = ca.issue("203.0.113.9").unwrap();
        t.assert_true("ipv4 cert", !v4.is_empty());
        let (v6, _) = ca.issue("::1").unwrap();
        t.assert_true("ipv6 cert", !v6.is_empty());
    }

    #[test]
    fn test_garbage_pem_rejected() {
        let t = test_report!("Unparseable CA material is a certificate error");
        let generated = GeneratedCa::generate().unwrap();
        let err = CertificateAuthority::from_pem("not a cert", &generated.key_pem)
            .err()
            .unwrap();
        t.assert_true("Certificate error", matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_save_and_load() {
        let t = test_report!("CA survives save and reload from files");
        let generated = GeneratedCa::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        generated.save(&cert_path, &key_path).unwrap();

        let ca = CertificateAuthority::from_files(&cert_path, &key_path).unwrap();
        t.assert_true("issues after reload", ca.issue("test.com").is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            t.assert_eq("key mode", &(mode & 0o777), &0o600u32);
        }
    }
}
