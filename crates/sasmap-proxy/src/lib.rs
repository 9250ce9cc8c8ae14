//! Sasmap proxy - Pingora-based SAS-injecting reverse proxy
//!
//! Terminates HTTPS for a single virtual host and forwards requests under
//! the container mount prefix to the storage origin, appending the
//! startup-provisioned SAS query string to every upstream path. All other
//! paths get the default 404 response.

pub mod proxy;
pub mod server;
pub mod tls;

pub use proxy::{ProxyContext, SourceMapProxy};
pub use server::{setup_proxy_server, ProxyShutdownSignal};
pub use tls::{CertificateLoader, TlsMaterial};
