//! Every outbound API call goes through [`RequestGateway`].
//!
//! The gateway attaches the bearer token, recognises authorization failures
//! and recovers from them with one refresh-and-retry. Everything else
//! (network failures, 5xx, validation 4xx) is handed back untouched and is
//! never retried here.

use log::{debug, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::fetch::{ApiRequest, ApiResponse};
use crate::refresh::RefreshCoordinator;
use crate::session::SessionStore;
use crate::token::TokenCodec;
use crate::AuthOptions;

/// リクエストゲートウェイ
#[derive(Clone)]
pub struct RequestGateway {
    url: String,
    http_client: Client,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    options: AuthOptions,
}

impl RequestGateway {
    pub fn new(
        url: &str,
        http_client: Client,
        store: Arc<SessionStore>,
        coordinator: RefreshCoordinator,
        options: AuthOptions,
    ) -> Self {
        Self {
            url: url.to_string(),
            http_client,
            store,
            coordinator,
            options,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send `request`, recovering from one authorization failure.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        if !request.auth {
            let response = self.execute(&request, None).await?;
            return into_result(response);
        }

        let token = self.usable_token().await?;
        let response = self.execute(&request, token.as_deref()).await?;
        if !self.is_auth_failure(&response) {
            return into_result(response);
        }

        debug!(
            "{} {} was rejected ({}), attempting recovery",
            request.method, request.path, response.status
        );

        if self.store.refresh_token().is_none() {
            self.store.clear();
            return Err(GatewayError::Unauthorized);
        }

        let session = self
            .coordinator
            .refresh_if_stale(token.as_deref())
            .await
            .map_err(|e| {
                warn!("Refresh failed for {} {}: {}", request.method, request.path, e);
                GatewayError::Unauthorized
            })?;

        let retry = self
            .execute(&request, session.access_token.as_deref())
            .await?;
        if self.is_auth_failure(&retry) {
            warn!("{} {} still unauthorized after refresh", request.method, request.path);
            self.store.clear();
            return Err(GatewayError::Unauthorized);
        }

        into_result(retry)
    }

    /// GET `path` and deserialize the (envelope-unwrapped) payload
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.send(ApiRequest::get(path)).await?.data()
    }

    /// The token to attach, refreshing first when it is about to expire.
    async fn usable_token(&self) -> Result<Option<String>, GatewayError> {
        let (token, committed_at) = match self.store.access_token_committed() {
            Some(pair) => pair,
            None => return Ok(None),
        };
        let claims = match TokenCodec::decode(&token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Not attaching undecodable access token: {}", e);
                return Ok(None);
            }
        };

        let now = self.store.now();
        let window = refresh_window(self.options.expiry_window_secs, claims.expires_at, committed_at);
        if !TokenCodec::is_expiring_soon(&claims, now, window) {
            return Ok(Some(token));
        }

        if self.options.auto_refresh_token && self.store.refresh_token().is_some() {
            debug!("Access token expiring, refreshing before send");
            return match self.coordinator.refresh_if_stale(Some(&token)).await {
                Ok(session) => Ok(session.access_token),
                Err(e) => {
                    warn!("Pre-emptive refresh failed: {}", e);
                    Err(GatewayError::Unauthorized)
                }
            };
        }

        if TokenCodec::is_expired(&claims, now) {
            Ok(None)
        } else {
            Ok(Some(token))
        }
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, GatewayError> {
        let url = request.url(&self.url)?;
        debug!(
            "{} {} (auth: {})",
            request.method,
            url,
            if token.is_some() { "bearer" } else { "none" }
        );

        let mut builder = self
            .http_client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn is_auth_failure(&self, response: &ApiResponse) -> bool {
        if response.status == reqwest::StatusCode::UNAUTHORIZED {
            return true;
        }
        response.status.is_client_error()
            && response
                .error_code()
                .map(|code| self.options.invalid_token_codes.iter().any(|c| *c == code))
                .unwrap_or(false)
    }
}

/// Pre-emptive refresh window for a token. Short-lived tokens get at most
/// half their lifetime, so a freshly issued one is never refreshed again.
fn refresh_window(window: i64, expires_at: i64, committed_at: Option<i64>) -> i64 {
    match committed_at {
        Some(at) => window.min(expires_at.saturating_sub(at) / 2).max(0),
        None => window,
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, GatewayError> {
    let status = response.status;
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return Ok(response);
    }

    let message = crate::api::error_message(&response.text())
        .unwrap_or_else(|| format!("Request failed with {}", status));

    if status.is_server_error() {
        Err(GatewayError::Server { status, message })
    } else {
        Err(GatewayError::Client {
            status,
            message,
            details: serde_json::from_slice(&response.body).ok(),
        })
    }
}
