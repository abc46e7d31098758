//! Request-time redirects driven by the credential cookie.
//!
//! This runs before any page is rendered and sees only the cookie, never
//! the client-side store. The decoded claims are unverified, so the result
//! is a routing convenience; the backend still enforces access.

use http::header::{COOKIE, LOCATION};
use http::{Request, Response, StatusCode};
use log::debug;
use portal_session_auth::{Clock, SystemClock, TokenClaims, TokenCodec};

use crate::access::{RoleHomes, DEFAULT_LOGIN_ROUTE};
use crate::roles::{intersects, ADMIN_ROLES};

pub const DEFAULT_COOKIE_NAME: &str = "accessToken";

/// A protected path prefix and the roles expected under it
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub prefix: String,
    /// Empty means any authenticated viewer
    pub roles: Vec<String>,
}

impl RouteRule {
    pub fn new<I, S>(prefix: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.to_string(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn authenticated(prefix: &str) -> Self {
        Self::new(prefix, Vec::<String>::new())
    }
}

/// エッジオプション
#[derive(Debug, Clone)]
pub struct EdgeOptions {
    pub cookie_name: String,
    pub login_route: String,
    /// Query parameter carrying the attempted path on login redirects
    pub redirect_param: String,
    pub public_paths: Vec<String>,
    pub protected: Vec<RouteRule>,
    pub role_homes: RoleHomes,
}

impl Default for EdgeOptions {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            redirect_param: "redirect".to_string(),
            public_paths: vec![
                "/auth/login".to_string(),
                "/auth/register".to_string(),
                "/auth/forgot-password".to_string(),
            ],
            protected: vec![
                RouteRule::new("/admin", ADMIN_ROLES.iter().copied()),
                RouteRule::authenticated("/dashboard"),
                RouteRule::authenticated("/profile"),
                RouteRule::authenticated("/projects"),
            ],
            role_homes: RoleHomes::default(),
        }
    }
}

impl EdgeOptions {
    pub fn with_cookie_name(mut self, name: &str) -> Self {
        self.cookie_name = name.to_string();
        self
    }

    pub fn with_login_route(mut self, route: &str) -> Self {
        self.login_route = route.to_string();
        self
    }

    pub fn with_public_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protected(mut self, rules: Vec<RouteRule>) -> Self {
        self.protected = rules;
        self
    }

    pub fn with_rule(mut self, rule: RouteRule) -> Self {
        self.protected.push(rule);
        self
    }

    pub fn with_role_homes(mut self, homes: RoleHomes) -> Self {
        self.role_homes = homes;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDecision {
    Pass,
    Redirect(String),
}

impl EdgeDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, EdgeDecision::Pass)
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            EdgeDecision::Pass => None,
            EdgeDecision::Redirect(location) => Some(location),
        }
    }

    /// `307 Temporary Redirect` for redirects, `None` to pass through.
    pub fn into_response(self) -> Result<Option<Response<()>>, http::Error> {
        match self {
            EdgeDecision::Pass => Ok(None),
            EdgeDecision::Redirect(location) => Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(LOCATION, location)
                .body(())
                .map(Some),
        }
    }
}

/// エッジリダイレクター
#[derive(Debug, Clone, Default)]
pub struct EdgeRedirector {
    options: EdgeOptions,
}

impl EdgeRedirector {
    pub fn new(options: EdgeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EdgeOptions {
        &self.options
    }

    /// Decide for an incoming request using the wall clock.
    pub fn route<B>(&self, request: &Request<B>) -> EdgeDecision {
        self.route_at(request, SystemClock.now())
    }

    pub fn route_at<B>(&self, request: &Request<B>, now: i64) -> EdgeDecision {
        let token = self.cookie_token(request);
        self.decide(
            request.uri().path(),
            request.uri().query(),
            token.as_deref(),
            now,
        )
    }

    /// Core decision over the path, query and cookie value.
    ///
    /// Expired but decodable tokens are still routed by role on protected
    /// paths, where the client refreshes them on the first API call. On
    /// public paths only a live token sends the viewer away, so a session
    /// whose refresh failed can still reach the login page.
    pub fn decide(&self, path: &str, query: Option<&str>, token: Option<&str>, now: i64) -> EdgeDecision {
        let claims = token.and_then(|t| match TokenCodec::decode(t) {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!("Ignoring undecodable credential cookie: {}", e);
                None
            }
        });
        if let Some(claims) = &claims {
            if TokenCodec::is_expired(claims, now) {
                debug!("Credential cookie is expired, routing by role anyway");
            }
        }

        if self
            .options
            .public_paths
            .iter()
            .any(|p| matches_prefix(path, p))
        {
            return match claims {
                Some(claims) if !TokenCodec::is_expired(&claims, now) => {
                    EdgeDecision::Redirect(self.home(&claims))
                }
                _ => EdgeDecision::Pass,
            };
        }

        let rule = match self
            .options
            .protected
            .iter()
            .filter(|r| matches_prefix(path, &r.prefix))
            .max_by_key(|r| r.prefix.len())
        {
            Some(rule) => rule,
            None => return EdgeDecision::Pass,
        };

        let claims = match claims {
            Some(claims) => claims,
            None => return EdgeDecision::Redirect(self.login_location(path, query)),
        };

        if !rule.roles.is_empty() && !intersects(&claims.roles, &rule.roles) {
            let home = self.home(&claims);
            debug!("{} expects {:?}, sending viewer to {}", rule.prefix, rule.roles, home);
            return EdgeDecision::Redirect(home);
        }

        EdgeDecision::Pass
    }

    fn home(&self, claims: &TokenClaims) -> String {
        self.options.role_homes.home_for(&claims.roles).to_string()
    }

    fn login_location(&self, path: &str, query: Option<&str>) -> String {
        let attempted = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        };
        format!(
            "{}?{}={}",
            self.options.login_route,
            self.options.redirect_param,
            urlencoding::encode(&attempted)
        )
    }

    fn cookie_token<B>(&self, request: &Request<B>) -> Option<String> {
        request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.options.cookie_name)
            .map(|(_, value)| match urlencoding::decode(value) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => value.to_string(),
            })
            .filter(|value| !value.is_empty())
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}
