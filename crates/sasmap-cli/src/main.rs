//! Sasmap CLI - single entrypoint for the source-map proxy
//!
//! Startup is an explicit two-phase sequence: provision the SAS token
//! first, then bind the HTTPS listener. The proxy never serves before
//! authorization is ready, and a failure in either phase terminates the
//! process before any listener exists.

use clap::Parser;
use sasmap_core::ProxySettings;
use sasmap_proxy::{setup_proxy_server, ProxyShutdownSignal};
use sasmap_sas::SasProvisioner;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "HTTPS reverse proxy that injects a read-only SAS token into source-map requests",
    long_about = None
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SASMAP_LOG_LEVEL")]
    log_level: String,

    /// Log format: compact, full
    #[arg(long, default_value = "compact", env = "SASMAP_LOG_FORMAT")]
    log_format: String,
}

/// Shutdown signal implementation for Ctrl+C
struct CtrlCShutdownSignal;

impl ProxyShutdownSignal for CtrlCShutdownSignal {
    fn wait_for_signal(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl-c signal");
            info!("Received Ctrl+C, initiating graceful shutdown...");
        })
    }
}

fn init_tracing(cli: &Cli) {
    // If RUST_LOG is set, use it directly; otherwise use our default
    // filter with the sasmap crates at the requested level and noisy
    // dependencies at warn.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .expect("Invalid RUST_LOG environment variable")
    } else {
        tracing_subscriber::EnvFilter::new(format!(
            "sasmap_cli={level},\
             sasmap_core={level},\
             sasmap_sas={level},\
             sasmap_proxy={level},\
             pingora=warn,\
             pingora_core=warn,\
             pingora_proxy=warn,\
             reqwest=warn",
            level = cli.log_level
        ))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format.as_str() {
        "full" => builder.init(),
        _ => builder.compact().init(),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Phase 0: configuration. Any missing value aborts startup here.
    let settings = Arc::new(ProxySettings::from_env()?);

    info!(
        "Starting sasmap for container {} on account {}",
        settings.container, settings.account
    );

    // Phase 1: provision the delegation token. The listener must not bind
    // without it, so this is awaited to completion on a dedicated runtime.
    let rt = tokio::runtime::Runtime::new()?;
    let provisioner = SasProvisioner::new(&settings);
    let sas = rt.block_on(provisioner.provision())?;

    // Phase 2: serve. Blocks for the process lifetime.
    setup_proxy_server(settings, sas, Box::new(CtrlCShutdownSignal))
}
