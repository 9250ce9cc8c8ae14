//! Static TLS material loading
//!
//! The proxy serves a single virtual host, so the certificate chain and
//! the passphrase-protected private key are read from disk once at
//! startup and reused for every handshake. A load failure is fatal before
//! the listener binds.

use anyhow::{bail, Context, Result};
use pingora_openssl::pkey::{PKey, Private};
use pingora_openssl::x509::X509;
use sasmap_core::ProxySettings;
use tracing::debug;

/// Parsed certificate chain and decrypted private key.
pub struct TlsMaterial {
    certs: Vec<X509>,
    key: PKey<Private>,
}

impl TlsMaterial {
    /// Leaf certificate first, then the chain.
    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }
}

/// Certificate loader that reads the configured PEM files
pub struct CertificateLoader {
    cert_path: String,
    key_path: String,
    passphrase: String,
}

impl CertificateLoader {
    pub fn new(settings: &ProxySettings) -> Self {
        Self {
            cert_path: settings.tls_cert_path.clone(),
            key_path: settings.tls_key_path.clone(),
            passphrase: settings.tls_passphrase.clone(),
        }
    }

    /// Read and parse the certificate chain and private key.
    pub fn load(&self) -> Result<TlsMaterial> {
        let cert_pem = std::fs::read(&self.cert_path)
            .with_context(|| format!("failed to read certificate file {}", self.cert_path))?;
        let certs = X509::stack_from_pem(&cert_pem)
            .with_context(|| format!("failed to parse certificates in {}", self.cert_path))?;
        if certs.is_empty() {
            bail!("no certificates found in {}", self.cert_path);
        }

        let key_pem = std::fs::read(&self.key_path)
            .with_context(|| format!("failed to read private key file {}", self.key_path))?;
        let key = PKey::private_key_from_pem_passphrase(&key_pem, self.passphrase.as_bytes())
            .with_context(|| format!("failed to decrypt private key {}", self.key_path))?;

        debug!("Loaded {} certificate(s) and private key", certs.len());
        Ok(TlsMaterial { certs, key })
    }
}
