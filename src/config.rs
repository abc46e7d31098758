//! Configuration options for a portal session

use portal_session_auth::{
    AuthOptions, PersistPolicy, DEFAULT_EXPIRY_WINDOW_SECS, DEFAULT_REFRESH_TIMEOUT,
    DEFAULT_STORAGE_KEY,
};
use portal_session_guard::{
    EdgeOptions, GuardOptions, RoleHomes, DEFAULT_COOKIE_NAME, DEFAULT_LOGIN_ROUTE,
};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Configuration options for a portal session
#[derive(Debug, Clone)]
pub struct PortalOptions {
    /// Base URL of the backend API
    pub api_url: String,

    /// Whether to refresh an expiring token before sending a request
    pub auto_refresh_token: bool,

    /// What survives a reload
    pub persist_policy: PersistPolicy,

    /// Name of the persisted record
    pub storage_key: String,

    /// Directory for the persisted record; in memory when unset
    pub storage_path: Option<PathBuf>,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    pub refresh_timeout: Duration,

    /// Seconds before expiry at which a token counts as expiring
    pub expiry_window_secs: i64,

    /// Minimum time between backend validations of a live token
    pub validation_interval: Duration,

    /// Period of the background session keeper
    pub keeper_interval: Duration,

    /// Roles a user must hold to log in to this portal; empty admits anyone
    pub required_roles: Vec<String>,

    pub login_route: String,

    pub role_homes: RoleHomes,

    /// Name of the credential cookie read at the edge
    pub cookie_name: String,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auto_refresh_token: true,
            persist_policy: PersistPolicy::UserOnly,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            storage_path: None,
            request_timeout: Some(Duration::from_secs(30)),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            expiry_window_secs: DEFAULT_EXPIRY_WINDOW_SECS,
            validation_interval: Duration::from_secs(10 * 60),
            keeper_interval: Duration::from_secs(5 * 60),
            required_roles: Vec::new(),
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            role_homes: RoleHomes::default(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

impl PortalOptions {
    /// Defaults overridden by `PORTAL_API_URL`, `PORTAL_PERSIST_TOKENS` and
    /// `PORTAL_STORAGE_PATH`.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(url) = env::var("PORTAL_API_URL") {
            if !url.trim().is_empty() {
                options.api_url = url.trim().to_string();
            }
        }
        if let Ok(value) = env::var("PORTAL_PERSIST_TOKENS") {
            if matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                options.persist_policy = PersistPolicy::Full;
            }
        }
        if let Ok(path) = env::var("PORTAL_STORAGE_PATH") {
            if !path.trim().is_empty() {
                options.storage_path = Some(PathBuf::from(path.trim()));
            }
        }

        options
    }

    /// Set the backend API URL
    pub fn with_api_url(mut self, value: &str) -> Self {
        self.api_url = value.to_string();
        self
    }

    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    pub fn with_persist_policy(mut self, value: PersistPolicy) -> Self {
        self.persist_policy = value;
        self
    }

    pub fn with_storage_key(mut self, value: &str) -> Self {
        self.storage_key = value.to_string();
        self
    }

    pub fn with_storage_path<P: Into<PathBuf>>(mut self, value: P) -> Self {
        self.storage_path = Some(value.into());
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_refresh_timeout(mut self, value: Duration) -> Self {
        self.refresh_timeout = value;
        self
    }

    pub fn with_expiry_window_secs(mut self, value: i64) -> Self {
        self.expiry_window_secs = value;
        self
    }

    pub fn with_validation_interval(mut self, value: Duration) -> Self {
        self.validation_interval = value;
        self
    }

    pub fn with_keeper_interval(mut self, value: Duration) -> Self {
        self.keeper_interval = value;
        self
    }

    /// Restrict login to users holding one of `roles`
    pub fn with_required_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_login_route(mut self, value: &str) -> Self {
        self.login_route = value.to_string();
        self
    }

    pub fn with_role_homes(mut self, value: RoleHomes) -> Self {
        self.role_homes = value;
        self
    }

    pub fn with_cookie_name(mut self, value: &str) -> Self {
        self.cookie_name = value.to_string();
        self
    }

    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            auto_refresh_token: self.auto_refresh_token,
            persist_policy: self.persist_policy,
            refresh_timeout: self.refresh_timeout,
            expiry_window_secs: self.expiry_window_secs,
            storage_key: self.storage_key.clone(),
            ..AuthOptions::default()
        }
    }

    /// Guard for a subtree open to `required_roles`
    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions::new(self.required_roles.iter().cloned())
            .with_login_route(&self.login_route)
            .with_role_homes(self.role_homes.clone())
    }

    pub fn edge_options(&self) -> EdgeOptions {
        EdgeOptions::default()
            .with_cookie_name(&self.cookie_name)
            .with_login_route(&self.login_route)
            .with_role_homes(self.role_homes.clone())
    }
}
