//! Sasmap SAS - one-shot user delegation SAS provisioning
//!
//! This crate produces the single read-only shared access signature the
//! proxy appends to every forwarded request. Provisioning happens exactly
//! once, before the listener binds:
//!
//! 1. acquire a bearer token from the ambient Azure AD credential chain;
//! 2. request a user delegation key from the blob service;
//! 3. sign a container-scoped, read-only SAS valid for about a day;
//! 4. serialize it to its canonical query-string form.
//!
//! The token is never refreshed. Once its validity window ends the
//! upstream service rejects proxied reads until the process is restarted.

pub mod credentials;
pub mod error;
pub mod provisioner;
pub mod token;

pub use credentials::AzureAdCredential;
pub use error::SasError;
pub use provisioner::{SasProvisioner, UserDelegationKey};
pub use token::SasToken;
