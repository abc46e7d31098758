//! Replayable request description and buffered response for the gateway

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::error::GatewayError;

/// A request the gateway can send, and re-send after a refresh
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Attach the session's bearer token (default `true`)
    pub auth: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            auth: true,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: &str) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: &str) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a header; invalid names or values are skipped
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, GatewayError> {
        self.body = Some(serde_json::to_vec(body)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Send without credentials (login-style calls)
    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    pub(crate) fn url(&self, base: &str) -> Result<Url, url::ParseError> {
        let base = base.trim_end_matches('/');
        let mut path = self.path.as_str();
        // ベースURLが既に /api で終わる場合は二重にしない
        if base.ends_with("/api") && (path == "/api" || path.starts_with("/api/")) {
            path = &path[4..];
        }
        let separator = if path.starts_with('/') || path.is_empty() { "" } else { "/" };

        let mut url = Url::parse(&format!("{}{}{}", base, separator, path))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Deserialize the payload, unwrapping the backend's
    /// `{statusCode, message, data}` envelope when present.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        let value: serde_json::Value = if self.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&self.body)?
        };

        let is_envelope = value
            .as_object()
            .map(|o| o.contains_key("data") && (o.contains_key("statusCode") || o.contains_key("message")))
            .unwrap_or(false);

        let payload = match value {
            serde_json::Value::Object(mut o) if is_envelope => {
                o.remove("data").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        };
        Ok(serde_json::from_value(payload)?)
    }

    /// JSON `code` field of an error body, if any
    pub(crate) fn error_code(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        value.get("code").and_then(|c| c.as_str()).map(str::to_string)
    }
}
