use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// ユーザー情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid user id: {}", other))),
    }
}

impl User {
    pub fn new(id: &str, username: &str) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            email: None,
            first_name: None,
            last_name: None,
            roles: BTreeSet::new(),
            active: true,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Apply `patch` and return the new value; `self` is left untouched.
    pub fn patched(&self, patch: &UserPatch) -> User {
        let mut next = self.clone();
        if let Some(username) = &patch.username {
            next.username = username.clone();
        }
        if let Some(email) = &patch.email {
            next.email = Some(email.clone());
        }
        if let Some(first_name) = &patch.first_name {
            next.first_name = Some(first_name.clone());
        }
        if let Some(last_name) = &patch.last_name {
            next.last_name = Some(last_name.clone());
        }
        if let Some(roles) = &patch.roles {
            next.roles = roles.clone();
        }
        if let Some(active) = patch.active {
            next.active = active;
        }
        next
    }
}

/// プロフィール更新用の部分的なユーザー情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// セッション情報
///
/// `user` is present iff `access_token` is present and decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<Arc<User>>,
}

impl Session {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }
}

/// アクセストークンとリフレッシュトークンの組
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// ログイン・リフレッシュのレスポンス
///
/// Accepts both `{accessToken, refreshToken, user}` and the flat
/// `{accessToken, refreshToken, userId, username, email, roles}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}

impl AuthResponse {
    /// The user carried by the response, if any.
    pub fn user(&self) -> Option<User> {
        if let Some(user) = &self.user {
            return Some(user.clone());
        }

        let id = match self.user_id.as_ref()? {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let username = self.username.clone().unwrap_or_else(|| id.clone());

        Some(User {
            id,
            first_name: Some(username.clone()),
            username,
            email: self.email.clone(),
            last_name: None,
            roles: self.roles.clone().unwrap_or_default().into_iter().collect(),
            active: true,
        })
    }

    pub fn tokens(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

/// サインイン認証情報
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// トークン検証のレスポンス
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
}
