//! ldapbridge Core Library
//!
//! Configuration, error and domain types shared by the directory bridge crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AuthConfig, AuthMode, BridgeConfig, ConfigStore, LdapSettings};
pub use error::{Error, Result};

/// ldapbridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder replaced by the (escaped) username in search filters
pub const USERNAME_PLACEHOLDER: &str = "%u";

/// Rules that open every directory-derived permission spec so that rights
/// never accumulate across logins
pub const BASELINE_RULES: [&str; 3] = ["resetkeys", "resetchannels", "-@all"];
