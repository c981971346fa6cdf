//! Error types for the authentication engine

use thiserror::Error;

pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Permission table error: {0}")]
    PermissionTable(String),

    #[error(transparent)]
    Configuration(#[from] ldapbridge_core::Error),

    #[error("All directory endpoints are unavailable")]
    AllEndpointsUnavailable,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Fallback cache persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::PermissionTable(_) => "PermissionTableError",
            AuthError::Configuration(e) => e.code(),
            AuthError::AllEndpointsUnavailable => "AllEndpointsUnavailable",
            AuthError::Tls(_) => "ConfigurationError",
            AuthError::Persistence(_) | AuthError::Io(_) | AuthError::Serialization(_) => {
                "PersistenceError"
            }
            AuthError::PasswordHash(_) | AuthError::Internal(_) => "InternalError",
        }
    }
}
