//! TLS configuration and dev-CA helpers.
//!
//! The fronting dial needs a rustls client config trusting the public web
//! PKI; tests and local development need a throwaway CA that can issue
//! certificates for arbitrary front domains.

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Client config trusting the public web PKI. Used for the real fronting
/// dial; SNI is supplied per connection.
pub fn webpki_client_config() -> rustls::ClientConfig {
    ensure_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Client config trusting a single CA given as PEM. Used against dev CDNs.
pub fn ca_client_config(ca_cert_pem: &str) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse CA cert")?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert).context("add CA to root store")?;
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Server config for a host certificate (PEM chain + key).
pub fn server_config(cert_pem: &str, key_pem: &str) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse server certs")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("parse server key")?
        .context("no private key found")?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server config")
}

/// A leaf certificate issued by a [`DevCa`].
#[derive(Clone)]
pub struct HostCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Throwaway CA: cert, key, and the rcgen objects needed to sign leaves.
pub struct DevCa {
    pub cert_pem: String,
    pub key_pem: String,
    key_pair: KeyPair,
    params: CertificateParams,
}

impl DevCa {
    /// Generate a new self-signed dev CA.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Hydra Dev CA");
        dn.push(DnType::OrganizationName, "Hydra");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().context("generate CA key pair")?;
        let cert = params
            .clone()
            .self_signed(&key_pair)
            .context("self-sign CA cert")?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            key_pair,
            params,
        })
    }

    /// Issue a leaf certificate covering the given server names.
    pub fn issue_host_cert(&self, names: &[&str]) -> Result<HostCert> {
        let ca_cert = self
            .params
            .clone()
            .self_signed(&self.key_pair)
            .context("rebuild CA cert for signing")?;

        let san_list: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(san_list).context("create host cert params")?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names.first().copied().unwrap_or("hydra-host"));
        dn.push(DnType::OrganizationName, "Hydra");
        params.distinguished_name = dn;

        let host_key = KeyPair::generate().context("generate host key pair")?;
        let cert = params
            .signed_by(&host_key, &ca_cert, &self.key_pair)
            .context("sign host cert")?;

        Ok(HostCert {
            cert_pem: cert.pem(),
            key_pem: host_key.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_dev_ca_succeeds() {
        let ca = DevCa::generate().unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn issue_host_cert_succeeds() {
        let ca = DevCa::generate().unwrap();
        let host = ca.issue_host_cert(&["front.test", "127.0.0.1"]).unwrap();
        assert!(host.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(host.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn server_config_from_issued_cert() {
        let ca = DevCa::generate().unwrap();
        let host = ca.issue_host_cert(&["front.test"]).unwrap();
        assert!(server_config(&host.cert_pem, &host.key_pem).is_ok());
    }

    #[test]
    fn client_config_trusts_dev_ca() {
        let ca = DevCa::generate().unwrap();
        assert!(ca_client_config(&ca.cert_pem).is_ok());
    }

    #[test]
    fn webpki_config_builds() {
        let config = webpki_client_config();
        drop(config);
    }
}
