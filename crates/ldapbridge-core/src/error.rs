//! Error types for ldapbridge

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    // Internal Errors
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::UnknownSetting(_) => "UnknownSetting",
            Error::InvalidValue { .. } => "InvalidValue",
            Error::InvalidEndpoint { .. } => "InvalidEndpoint",
            Error::InternalError(_) => "InternalError",
            Error::Io(_) => "InternalError",
            Error::Other(_) => "InternalError",
        }
    }

    /// Whether the error was caused by an operator-supplied value
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::UnknownSetting(_)
                | Error::InvalidValue { .. }
                | Error::InvalidEndpoint { .. }
        )
    }
}
