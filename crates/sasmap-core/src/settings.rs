//! Process configuration
//!
//! All six runtime values are required and sourced from the environment.
//! A missing or empty value prevents startup entirely.

use crate::error::ConfigError;

/// Environment variable names, matching the deployment's existing .env files.
pub const ENV_STORAGE_ACCOUNT: &str = "STORAGE_ACCOUNT";
pub const ENV_BLOB_CONTAINER: &str = "BLOB_CONTAINER";
pub const ENV_SSL_KEY: &str = "SSL_KEY";
pub const ENV_SSL_CERT: &str = "SSL_CERT";
pub const ENV_SSL_PASSPHRASE: &str = "SSL_PASSPHRASE";
pub const ENV_SSL_HOST: &str = "SSL_HOST";

/// The listener port is fixed; only the bind hostname is configurable.
pub const LISTEN_PORT: u16 = 443;

/// Public DNS suffix of the storage provider's blob endpoint.
pub const BLOB_ENDPOINT_SUFFIX: &str = "blob.core.windows.net";

/// Runtime configuration for the proxy process.
///
/// Constructed once at startup and passed by reference into the token
/// provisioner and the proxy setup.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Storage account name, e.g. `mystorageaccount`.
    pub account: String,
    /// Container holding the source-map assets; also the mount prefix.
    pub container: String,
    /// Path to the PEM-encoded TLS private key.
    pub tls_key_path: String,
    /// Path to the PEM-encoded TLS certificate chain.
    pub tls_cert_path: String,
    /// Passphrase protecting the TLS private key.
    pub tls_passphrase: String,
    /// Hostname the HTTPS listener binds to.
    pub bind_host: String,
}

impl ProxySettings {
    /// Read settings from the process environment, failing on the first
    /// missing value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary lookup function.
    ///
    /// `from_env` delegates here; tests use it to drop variables one at a
    /// time without touching process-global state.
    pub fn load<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            account: require(&lookup, ENV_STORAGE_ACCOUNT)?,
            container: require(&lookup, ENV_BLOB_CONTAINER)?,
            tls_key_path: require(&lookup, ENV_SSL_KEY)?,
            tls_cert_path: require(&lookup, ENV_SSL_CERT)?,
            tls_passphrase: require(&lookup, ENV_SSL_PASSPHRASE)?,
            bind_host: require(&lookup, ENV_SSL_HOST)?,
        })
    }

    /// Path prefix under which requests are intercepted and forwarded.
    pub fn mount_prefix(&self) -> String {
        format!("/{}", self.container)
    }

    /// Hostname of the upstream storage endpoint.
    pub fn upstream_host(&self) -> String {
        format!("{}.{}", self.account, BLOB_ENDPOINT_SUFFIX)
    }

    /// Public HTTPS origin of the upstream storage endpoint.
    pub fn upstream_origin(&self) -> String {
        format!("https://{}", self.upstream_host())
    }

    /// Socket address the HTTPS listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, LISTEN_PORT)
    }
}

fn require<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Err(ConfigError::MissingVar(name)),
        Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyVar(name)),
        Some(value) => Ok(value),
    }
}
