use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

/// Certificates are valid for one day: a session CA never outlives the
/// process by much, and short validity keeps an exfiltrated key useless.
const CERT_VALIDITY: Duration = Duration::days(1);

/// Ephemeral certificate authority for one proxy session.
///
/// Generated in memory at proxy construction, installed into the container
/// trust store after boot, discarded when the session ends. Never touches
/// disk on the host.
pub struct ProxyCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl ProxyCa {
    pub fn generate() -> Result<Self> {
        // Both `ring` and `aws-lc-rs` providers end up feature-enabled
        // transitively (via reqwest/hyper-rustls), which leaves rustls
        // unable to pick a default on its own. Installing one explicitly
        // (idempotent: later calls are a harmless no-op) is required
        // before any `ServerConfig` can be built.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca_key = KeyPair::generate().context("Failed to generate CA key")?;
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "FTL Proxy CA");
        dn.push(DnType::OrganizationName, "FTL");
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + CERT_VALIDITY;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("Failed to self-sign CA certificate")?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// CA certificate as PEM, for trust-store installation.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA certificate as DER, for building client-side trust in tests.
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Server TLS config presenting a leaf certificate for `hostname`,
    /// minted on first use and cached. The lock covers mint-and-insert:
    /// concurrent connections to a new host mint once.
    pub fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let mut cache = self.leaf_cache.lock().expect("leaf cache lock poisoned");
        if let Some(config) = cache.get(hostname) {
            return Ok(config.clone());
        }

        let (cert_der, key_der) = self.mint_leaf(hostname)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .context("Failed to build leaf server config")?;
        let config = Arc::new(config);
        cache.insert(hostname.to_string(), config.clone());
        Ok(config)
    }

    /// Mint a per-host leaf: CN and SAN set to the hostname, signed by the
    /// session CA, one-day validity.
    fn mint_leaf(&self, hostname: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let leaf_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .with_context(|| format!("Invalid certificate host name: {}", hostname))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + CERT_VALIDITY;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("Failed to sign leaf certificate for {}", hostname))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((leaf_cert.der().clone(), key_der))
    }
}

/// Trust roots the proxy uses when dialling upstream servers: the host's
/// native store, plus any extra roots the caller supplies (tests, corporate
/// interception chains).
pub fn upstream_root_store(extra_roots: &[CertificateDer<'static>]) -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    for cert in extra_roots {
        let _ = roots.add(cert.clone());
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_pem_shape() {
        let ca = ProxyCa::generate().unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_leaf_minting_and_cache() {
        let ca = ProxyCa::generate().unwrap();
        let first = ca.server_config_for("api.example.com").unwrap();
        let second = ca.server_config_for("api.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.server_config_for("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_leaf_for_ip_hostname() {
        let ca = ProxyCa::generate().unwrap();
        assert!(ca.server_config_for("127.0.0.1").is_ok());
    }

    #[test]
    fn test_distinct_sessions_distinct_cas() {
        let a = ProxyCa::generate().unwrap();
        let b = ProxyCa::generate().unwrap();
        assert_ne!(a.ca_cert_pem(), b.ca_cert_pem());
    }
}
