//! Root CA and per-host leaf certificate minting
//!
//! Leaf certificates are cached for the lifetime of the authority. Generation is
//! serialized per hostname: the first caller for a name mints while concurrent
//! callers for the same name wait on the same cell and receive the same `Arc`.
//! A failed mint leaves the cell empty so a later call retries.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use crate::error::CertificateError;

pub type CertResult<T> = std::result::Result<T, CertificateError>;

/// A minted leaf certificate and its private key
pub struct LeafCertificate {
    hostname: String,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: Vec<u8>,
    key_pem: String,
    root_der: CertificateDer<'static>,
}

impl LeafCertificate {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PKCS#8 private key
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// Chain presented to clients: leaf then root
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.root_der.clone()]
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
    pub cached: usize,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,
}

type CertCell = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Signs per-host leaf certificates with a root CA key
pub struct CertificateAuthority {
    issuer: Certificate,
    issuer_key: KeyPair,
    root_der: CertificateDer<'static>,
    root_pem: String,
    cache: DashMap<String, CertCell>,
    stats: CacheStats,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load a root CA from PEM certificate and key files
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CertResult<Self> {
        let cert_pem = fs::read_to_string(cert_path.as_ref())?;
        let key_pem = fs::read_to_string(key_path.as_ref())?;
        let authority = Self::from_pem(&cert_pem, &key_pem)?;
        info!(cert = %cert_path.as_ref().display(), "Loaded root CA");
        Ok(authority)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CertResult<Self> {
        let issuer_key = KeyPair::from_pem(key_pem)
            .map_err(|e| CertificateError::Parse(format!("CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CertificateError::Parse(format!("CA certificate: {e}")))?;

        // Leaves are signed through an rcgen issuer rebuilt from the loaded
        // subject and key; clients are served the original root bytes.
        let issuer = params.self_signed(&issuer_key)?;

        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::Parse("no certificate in CA PEM".to_string()))?
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        Ok(Self::with_issuer(issuer, issuer_key, root_der, cert_pem.to_string()))
    }

    /// Create a fresh self-signed root CA
    pub fn generate(common_name: &str) -> CertResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Interpose");
        params.distinguished_name = dn;

        let issuer_key = KeyPair::generate()?;
        let issuer = params.self_signed(&issuer_key)?;
        let root_der = issuer.der().clone();
        let root_pem = issuer.pem();

        Ok(Self::with_issuer(issuer, issuer_key, root_der, root_pem))
    }

    fn with_issuer(
        issuer: Certificate,
        issuer_key: KeyPair,
        root_der: CertificateDer<'static>,
        root_pem: String,
    ) -> Self {
        Self {
            issuer,
            issuer_key,
            root_der,
            root_pem,
            cache: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Persist the root certificate and key as PEM
    pub fn save_to_files(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CertResult<()> {
        fs::write(cert_path.as_ref(), self.root_pem.as_bytes())
            .map_err(|e| CertificateError::Write(format!("{}: {e}", cert_path.as_ref().display())))?;
        fs::write(key_path.as_ref(), self.issuer_key.serialize_pem().as_bytes())
            .map_err(|e| CertificateError::Write(format!("{}: {e}", key_path.as_ref().display())))?;
        Ok(())
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Leaf certificate for `hostname`, minting it on first use
    pub fn get_certificate(&self, hostname: &str) -> CertResult<Arc<LeafCertificate>> {
        let host = normalize_hostname(hostname);
        if host.is_empty() {
            return Err(CertificateError::Generation("empty hostname".to_string()));
        }

        // Clone the cell out so the shard lock is released before minting.
        let cell: CertCell = self
            .cache
            .entry(host.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(leaf) = cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(leaf.clone());
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let mut minted = false;
        let leaf = cell.get_or_try_init(|| {
            minted = true;
            self.mint(&host).map(Arc::new)
        })?;
        if minted {
            self.stats.generated.fetch_add(1, Ordering::Relaxed);
            debug!(host = %host, "Minted leaf certificate");
        }
        Ok(leaf.clone())
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            generated: self.stats.generated.load(Ordering::Relaxed),
            cached: self.cache.len(),
        }
    }

    fn mint(&self, host: &str) -> CertResult<LeafCertificate> {
        // SAN becomes an IP address entry when `host` parses as one.
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer, &self.issuer_key)?;

        Ok(LeafCertificate {
            hostname: host.to_string(),
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
            key_pem: key.serialize_pem(),
            root_der: self.root_der.clone(),
        })
    }
}

/// Cache key for a hostname: trimmed, lower-cased, without brackets or a trailing dot
fn normalize_hostname(hostname: &str) -> String {
    hostname
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::SanType;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::generate("Interpose Test CA").unwrap()
    }

    #[test]
    fn test_get_certificate_is_idempotent() {
        let ca = authority();
        let first = ca.get_certificate("example.com").unwrap();
        let second = ca.get_certificate("example.com").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(first.key_pem(), second.key_pem());

        let metrics = ca.metrics();
        assert_eq!(metrics.generated, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.cached, 1);
    }

    #[test]
    fn test_hostname_normalized() {
        let ca = authority();
        let lower = ca.get_certificate("example.com").unwrap();
        let upper = ca.get_certificate("  Example.COM. ").unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
        assert_eq!(upper.hostname(), "example.com");
    }

    #[test]
    fn test_distinct_hosts_get_distinct_certificates() {
        let ca = authority();
        let a = ca.get_certificate("a.example").unwrap();
        let b = ca.get_certificate("b.example").unwrap();
        assert_ne!(a.cert_der(), b.cert_der());
        assert_eq!(ca.metrics().generated, 2);
    }

    #[test]
    fn test_leaf_subject_alt_name() {
        let ca = authority();
        let leaf = ca.get_certificate("example.com").unwrap();
        let params = CertificateParams::from_ca_cert_der(leaf.cert_der()).unwrap();
        assert!(params
            .subject_alt_names
            .iter()
            .any(|san| matches!(san, SanType::DnsName(name) if name.as_str() == "example.com")));

        let leaf = ca.get_certificate("127.0.0.1").unwrap();
        let params = CertificateParams::from_ca_cert_der(leaf.cert_der()).unwrap();
        assert!(params
            .subject_alt_names
            .iter()
            .any(|san| matches!(san, SanType::IpAddress(_))));
    }

    #[test]
    fn test_chain_ends_with_root() {
        let ca = authority();
        let leaf = ca.get_certificate("example.com").unwrap();
        let chain = leaf.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(&chain[1], ca.ca_cert_der());
        assert!(matches!(leaf.key_der(), PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_concurrent_requests_mint_once() {
        let ca = Arc::new(authority());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ca = ca.clone();
                std::thread::spawn(move || ca.get_certificate("race.example").unwrap())
            })
            .collect();

        let leaves: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for leaf in &leaves[1..] {
            assert!(Arc::ptr_eq(&leaves[0], leaf));
        }
        assert_eq!(ca.metrics().generated, 1);
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let ca = authority();
        assert!(matches!(
            ca.get_certificate("   "),
            Err(CertificateError::Generation(_))
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");

        let ca = authority();
        ca.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateAuthority::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.ca_cert_der(), ca.ca_cert_der());
        assert_eq!(loaded.ca_cert_pem(), ca.ca_cert_pem());

        let leaf = loaded.get_certificate("example.com").unwrap();
        assert_eq!(&leaf.chain()[1], ca.ca_cert_der());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CertificateAuthority::from_pem_files(
            dir.path().join("missing.pem"),
            dir.path().join("missing.key"),
        );
        assert!(matches!(missing, Err(CertificateError::Read(_))));

        let garbage = CertificateAuthority::from_pem("not a certificate", "not a key");
        assert!(matches!(garbage, Err(CertificateError::Parse(_))));
    }
}
