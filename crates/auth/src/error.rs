use http::StatusCode;
use thiserror::Error;

/// トークンのデコードエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed token: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn malformed<T: Into<String>>(reason: T) -> Self {
        Self::Malformed(reason.into())
    }
}

/// 認証APIのエラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Credentials rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: StatusCode, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Missing session")]
    MissingSession,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] DecodeError),
}

/// リフレッシュサイクルの終端エラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Refresh call timed out")]
    Timeout,

    #[error("Refresh transport failure: {0}")]
    Transport(String),

    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh cycle ended without a result")]
    Interrupted,

    #[error("Session was cleared while refreshing")]
    Superseded,
}

impl From<AuthError> for RefreshError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Rejected { message, .. } => RefreshError::Rejected(message),
            AuthError::InvalidToken(e) => RefreshError::Rejected(e.to_string()),
            AuthError::MissingSession => RefreshError::MissingRefreshToken,
            other => RefreshError::Transport(other.to_string()),
        }
    }
}

/// ゲートウェイのエラー型
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: StatusCode, message: String },

    #[error("Request failed ({status}): {message}")]
    Client {
        status: StatusCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Network(err.to_string())
    }
}

/// 永続化ストレージのエラー型
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
