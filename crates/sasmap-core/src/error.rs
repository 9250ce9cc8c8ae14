//! Common error types used across the sasmap crates

use thiserror::Error;

/// Configuration errors
///
/// Always fatal at startup: the proxy must not start serving without a
/// complete configuration, so there is no degraded mode to represent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("environment variable {0} must not be empty")]
    EmptyVar(&'static str),
}
