use crate::proxy::SourceMapProxy;
use crate::tls::{CertificateLoader, TlsMaterial};
use anyhow::Result;
use async_trait::async_trait;
use pingora::server::RunArgs;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::listeners::TlsAccept;
use pingora_core::protocols::tls::TlsRef;
use pingora_core::server::configuration::Opt;
use pingora_proxy::http_proxy_service;
use sasmap_core::ProxySettings;
use sasmap_sas::SasToken;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Serves the startup-loaded certificate chain for every handshake.
struct StaticCertHandler {
    material: Arc<TlsMaterial>,
}

#[async_trait]
impl TlsAccept for StaticCertHandler {
    async fn certificate_callback(&self, ssl_ref: &mut TlsRef) -> () {
        use pingora_openssl::ext;
        use pingora_openssl::ssl::SslRef;

        // TlsRef is a type alias for SslRef when using OpenSSL
        let ssl: &mut SslRef = unsafe { std::mem::transmute(ssl_ref) };

        for (i, cert) in self.material.certs().iter().enumerate() {
            if i == 0 {
                // First certificate is the leaf certificate
                if let Err(e) = ext::ssl_use_certificate(ssl, cert) {
                    debug!("Failed to set certificate: {}", e);
                    return;
                }
            } else if let Err(e) = ext::ssl_add_chain_cert(ssl, cert) {
                debug!("Failed to add chain certificate {}: {}", i, e);
                return;
            }
        }

        if let Err(e) = ext::ssl_use_private_key(ssl, self.material.key()) {
            debug!("Failed to set private key: {}", e);
        }
    }
}

/// Custom shutdown signal trait that callers can implement
pub trait ProxyShutdownSignal: Send + Sync {
    /// Wait for the shutdown signal to be triggered
    fn wait_for_signal(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Bridge between our custom trait and Pingora's ShutdownSignalWatch
struct ShutdownSignalBridge {
    signal: Box<dyn ProxyShutdownSignal>,
}

impl ShutdownSignalBridge {
    fn new(signal: Box<dyn ProxyShutdownSignal>) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl pingora::server::ShutdownSignalWatch for ShutdownSignalBridge {
    async fn recv(&self) -> pingora::server::ShutdownSignal {
        self.signal.wait_for_signal().await;
        pingora::server::ShutdownSignal::FastShutdown
    }
}

/// Setup and run the HTTPS listener.
///
/// Called only after the SAS token has been provisioned; this function
/// blocks for the lifetime of the server.
pub fn setup_proxy_server(
    settings: Arc<ProxySettings>,
    sas: SasToken,
    shutdown_signal: Box<dyn ProxyShutdownSignal>,
) -> Result<()> {
    // TLS material is validated before anything binds.
    let material = Arc::new(CertificateLoader::new(&settings).load()?);

    let proxy = SourceMapProxy::new(settings.clone(), sas);

    let opt = Opt {
        daemon: false,
        ..Default::default()
    };

    let mut server = pingora_core::server::Server::new(opt)?;
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);

    let tls_callbacks: Box<dyn TlsAccept + Send + Sync> =
        Box::new(StaticCertHandler { material });
    let tls_settings = TlsSettings::with_callbacks(tls_callbacks)
        .map_err(|e| anyhow::anyhow!("Failed to create TLS settings: {}", e))?;

    let listen_addr = settings.listen_addr();
    proxy_service.add_tls_with_settings(&listen_addr, None, tls_settings);
    server.add_service(proxy_service);

    info!(
        "source map proxy service live on https://{} -> {}",
        listen_addr,
        settings.upstream_origin()
    );

    let run_args = RunArgs {
        shutdown_signal: Box::new(ShutdownSignalBridge::new(shutdown_signal)),
    };
    server.run(run_args);

    Ok(())
}
