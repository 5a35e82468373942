//! TLS interception
//!
//! `CertificateAuthority` mints per-host leaf certificates signed by a root CA;
//! `TlsInterceptor` uses them to terminate the client's TLS session and opens a
//! verified TLS session to the real upstream.

pub mod authority;
pub mod interceptor;

pub use authority::{CacheMetrics, CertificateAuthority, LeafCertificate};
pub use interceptor::{load_certs, TlsInterceptor};
