//! SAS provisioning error types

use thiserror::Error;

/// Errors raised while provisioning the delegation token.
///
/// Every variant is fatal to startup; there is no retry and no partial
/// service without a valid token.
#[derive(Error, Debug)]
pub enum SasError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("delegation key request failed: {0}")]
    DelegationKey(String),

    #[error("invalid delegation key: {0}")]
    InvalidKey(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to parse response: {0}")]
    Xml(#[from] quick_xml::DeError),
}
