//! Typed client for the backend's authentication endpoints.
//!
//! These calls never go through the request gateway: the gateway depends on
//! them to recover from authorization failures.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response};

use crate::error::AuthError;
use crate::types::{AuthResponse, LoginRequest, TokenValidation};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REFRESH_PATH: &str = "/api/auth/refresh-token";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
pub const VALIDATE_PATH: &str = "/api/auth/validate";

/// Header carrying the refresh token on refresh calls
pub const REFRESH_TOKEN_HEADER: &str = "Refresh-Token";

/// 認証バックエンド
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, AuthError>;

    async fn logout(&self, access_token: Option<&str>) -> Result<(), AuthError>;

    async fn validate(&self, access_token: &str) -> Result<TokenValidation, AuthError>;
}

/// HTTP implementation of [`AuthBackend`]
#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
    url: String,
    http_client: Client,
}

impl HttpAuthBackend {
    pub fn new(url: &str, http_client: Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, AuthError> {
        debug!("POST {} for {}", LOGIN_PATH, request.username);

        let response = self
            .http_client
            .post(self.endpoint(LOGIN_PATH))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<AuthResponse>().await?)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, AuthError> {
        debug!("POST {}", REFRESH_PATH);

        let response = self
            .http_client
            .post(self.endpoint(REFRESH_PATH))
            .header(REFRESH_TOKEN_HEADER, refresh_token)
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<AuthResponse>().await?)
    }

    async fn logout(&self, access_token: Option<&str>) -> Result<(), AuthError> {
        let mut request = self.http_client.post(self.endpoint(LOGOUT_PATH));
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn validate(&self, access_token: &str) -> Result<TokenValidation, AuthError> {
        let response = self
            .http_client
            .get(self.endpoint(VALIDATE_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<TokenValidation>().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    let message = error_message(&error_text).unwrap_or_else(|| status.to_string());

    if status.is_server_error() {
        Err(AuthError::Server { status, message })
    } else {
        Err(AuthError::Rejected { status, message })
    }
}

/// `message` or `error` from a JSON error body, else the raw text.
pub(crate) fn error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        Err(_) => Some(body.trim().to_string()),
    }
}
