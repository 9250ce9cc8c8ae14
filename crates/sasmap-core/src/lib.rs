//! Sasmap core - shared configuration and error types
//!
//! Everything the proxy needs to know at runtime is captured in
//! [`ProxySettings`], built exactly once at startup. Business logic takes
//! the settings by reference; nothing does ambient environment lookups
//! after startup.

pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::{ProxySettings, LISTEN_PORT};
