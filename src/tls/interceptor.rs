use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::debug;

use super::authority::{CertificateAuthority, LeafCertificate};
use crate::error::{ProxyError, Result};

const ALPN_HTTP11: &[u8] = b"http/1.1";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Terminates client TLS with minted certificates and opens TLS to the real upstream
pub struct TlsInterceptor {
    authority: Arc<CertificateAuthority>,
    client_config: Arc<ClientConfig>,
}

impl TlsInterceptor {
    /// Create an interceptor that trusts `roots` for upstream connections
    pub fn new(authority: Arc<CertificateAuthority>, roots: RootCertStore) -> Result<Self> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            authority,
            client_config: Arc::new(config),
        })
    }

    /// Trust the bundled webpki roots plus any PEM certificates in `extra_roots`
    pub fn with_webpki_roots(authority: Arc<CertificateAuthority>, extra_roots: Option<&Path>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = extra_roots {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
            debug!(path = %path.display(), "Added upstream trust roots");
        }
        Self::new(authority, roots)
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Leaf certificate for `host`. Minting runs on the blocking pool.
    pub async fn certificate_for(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let authority = self.authority.clone();
        let host = host.to_string();
        let leaf = tokio::task::spawn_blocking(move || authority.get_certificate(&host))
            .await
            .map_err(|e| ProxyError::Internal(format!("certificate task failed: {e}")))??;
        Ok(leaf)
    }

    pub fn server_config_for(&self, leaf: &LeafCertificate) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(leaf.chain(), leaf.key_der())?;
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        Ok(Arc::new(config))
    }

    /// Server-side handshake with the client using `leaf`
    pub async fn accept_client<S>(&self, stream: S, leaf: &LeafCertificate) -> Result<server::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = TlsAcceptor::from(self.server_config_for(leaf)?);
        acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("client side for {}: {e}", leaf.hostname())))
    }

    /// Client-side handshake with the real upstream, SNI = `host`
    pub async fn connect_upstream<S>(&self, stream: S, host: &str) -> Result<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::TlsHandshake(format!("invalid server name {host}: {e}")))?;
        TlsConnector::from(self.client_config.clone())
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("upstream {host}: {e}")))
    }
}

/// Read every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::InvalidConfig(format!("cannot open {}: {e}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::InvalidConfig(format!("invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::InvalidConfig(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}
