//! TLS configuration and certificate selection.
//!
//! One TLS listener may serve several vhosts. Certificates are indexed by
//! the domains of the vhosts that declared them; the SNI name picks the
//! certificate by exact domain, then wildcard domain, then the first pair
//! loaded for the address.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;

use crate::routing::matcher::{normalize_domain, wildcard_of};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoKey(PathBuf),

    #[error("unusable certificate pair {cert}: {source}")]
    Rustls {
        cert: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("no certificates configured")]
    Empty,
}

/// A certificate pair and the domains it is served for.
#[derive(Debug, Clone)]
pub struct CertBinding {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub domains: Vec<String>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TlsError + '_ {
    move |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path).map_err(io_error(path))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(path))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(path).map_err(io_error(path))?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(io_error(path))?
        .ok_or_else(|| TlsError::NoKey(path.to_path_buf()))
}

/// Load one certificate pair into a signing key.
pub fn load_certified_key(cert_file: &Path, key_file: &Path) -> Result<CertifiedKey, TlsError> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|source| TlsError::Rustls {
            cert: cert_file.to_path_buf(),
            source,
        })?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI-driven certificate selection.
#[derive(Debug)]
pub struct SniResolver {
    by_domain: HashMap<String, Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

impl SniResolver {
    /// Load every binding. A pair that fails to load is logged and skipped;
    /// it is an error only if nothing loads.
    pub fn load(bindings: &[CertBinding]) -> Result<Self, TlsError> {
        let mut by_domain = HashMap::new();
        let mut fallback = None;
        let mut last_error = None;

        for binding in bindings {
            let key = match load_certified_key(&binding.cert_file, &binding.key_file) {
                Ok(key) => Arc::new(key),
                Err(e) => {
                    tracing::error!(cert = %binding.cert_file.display(), error = %e, "Skipping certificate");
                    last_error = Some(e);
                    continue;
                }
            };
            for domain in &binding.domains {
                by_domain
                    .entry(normalize_domain(domain))
                    .or_insert_with(|| key.clone());
            }
            fallback.get_or_insert(key);
        }

        match fallback {
            Some(fallback) => Ok(Self {
                by_domain,
                fallback,
            }),
            None => Err(last_error.unwrap_or(TlsError::Empty)),
        }
    }

    pub fn select(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        server_name
            .map(normalize_domain)
            .and_then(|name| {
                self.by_domain
                    .get(&name)
                    .or_else(|| self.by_domain.get(&wildcard_of(&name)))
            })
            .unwrap_or(&self.fallback)
            .clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.select(client_hello.server_name()))
    }
}

/// Server config for one TLS listener.
pub fn server_config(bindings: &[CertBinding]) -> Result<RustlsConfig, TlsError> {
    let resolver = SniResolver::load(bindings)?;
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Rustls {
            cert: bindings
                .first()
                .map(|b| b.cert_file.clone())
                .unwrap_or_default(),
            source,
        })?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let err = load_certified_key(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "not a certificate\n").unwrap();
        assert!(matches!(load_certs(&cert), Err(TlsError::NoCertificate(_))));
    }

    #[test]
    fn nothing_loadable_is_an_error() {
        let bindings = vec![CertBinding {
            cert_file: PathBuf::from("/nonexistent/cert.pem"),
            key_file: PathBuf::from("/nonexistent/key.pem"),
            domains: vec!["example.com".to_string()],
        }];
        assert!(SniResolver::load(&bindings).is_err());
        assert!(matches!(SniResolver::load(&[]), Err(TlsError::Empty)));
    }
}
