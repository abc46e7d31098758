//! Session client for the feedback portals
//!
//! This crate provides the client half of portal authentication:
//! token decoding, the session store and its persistence, the backend auth
//! endpoints, single-flight token refresh, and the request gateway every API
//! call goes through.

mod api;
mod error;
mod fetch;
mod gateway;
mod refresh;
mod session;
mod storage;
mod token;
mod types;

use std::time::Duration;

pub use api::{
    AuthBackend, HttpAuthBackend, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, REFRESH_TOKEN_HEADER,
    VALIDATE_PATH,
};
pub use error::{AuthError, DecodeError, GatewayError, RefreshError, StorageError};
pub use fetch::{ApiRequest, ApiResponse};
pub use gateway::RequestGateway;
pub use refresh::{RefreshCoordinator, DEFAULT_REFRESH_TIMEOUT};
pub use session::{Clock, FixedClock, SessionEvent, SessionStatus, SessionStore, SystemClock};
pub use storage::{
    FilePersistence, MemoryPersistence, PersistPolicy, PersistedSnapshot, SessionPersistence,
    DEFAULT_STORAGE_KEY,
};
pub use token::{Liveness, TokenClaims, TokenCodec, DEFAULT_EXPIRY_WINDOW_SECS};
pub use types::{AuthResponse, LoginRequest, Session, TokenPair, TokenValidation, User, UserPatch};

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Refresh before sending when the token is about to expire
    pub auto_refresh_token: bool,
    pub persist_policy: PersistPolicy,
    pub refresh_timeout: Duration,
    pub expiry_window_secs: i64,
    /// Application-level error codes that mean "token invalid"
    pub invalid_token_codes: Vec<String>,
    pub storage_key: String,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            persist_policy: PersistPolicy::UserOnly,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            expiry_window_secs: DEFAULT_EXPIRY_WINDOW_SECS,
            invalid_token_codes: vec![
                "TOKEN_INVALID".to_string(),
                "INVALID_TOKEN".to_string(),
                "TOKEN_EXPIRED".to_string(),
            ],
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}
