//! Error handling for the portal session client

use portal_session_auth::{AuthError, DecodeError, GatewayError, RefreshError, StorageError};
use std::fmt;
use thiserror::Error;

/// Unified error type for the portal session client
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Authentication endpoint errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Token refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    /// Errors from requests sent through the gateway
    #[error("Request error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Token error: {0}")]
    Token(#[from] DecodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The user may not use this portal
    #[error("Access denied: {0}")]
    AccessDenied(String),
}

impl Error {
    /// Create a new access denied error
    pub fn access_denied<T: fmt::Display>(msg: T) -> Self {
        Error::AccessDenied(msg.to_string())
    }

    /// `true` when the caller should be sent back to the login page
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Gateway(GatewayError::Unauthorized)
                | Error::Refresh(_)
                | Error::Auth(AuthError::Rejected { .. })
                | Error::Auth(AuthError::MissingSession)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
