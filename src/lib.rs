//! Portal session client
//!
//! Client-side session handling for the feedback portals: a single session
//! store, a request gateway that recovers from expired credentials with one
//! shared refresh, a route guard and an edge redirector.
//!
//! ```no_run
//! use portal_session::prelude::*;
//!
//! # async fn run() -> Result<(), Error> {
//! let portal = Portal::new(PortalOptions::from_env().with_required_roles(["admin"]))?;
//! portal.hydrate(None).await;
//! portal.login("alice", "secret").await?;
//! let departments: Vec<String> = portal.gateway().get_json("/api/departments").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;

use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub use portal_session_auth as auth;
pub use portal_session_guard as guard;

use crate::auth::{
    AuthBackend, Clock, FilePersistence, HttpAuthBackend, LoginRequest, MemoryPersistence,
    RefreshCoordinator, RequestGateway, Session, SessionPersistence, SessionStore, SystemClock,
    TokenCodec, TokenPair, User,
};
use crate::config::PortalOptions;
use crate::error::{Error, Result};
use crate::guard::{roles, AccessGuard, EdgeRedirector, GuardOptions, MountedGuard, Navigator};

/// The main entry point: one session and everything built around it
pub struct Portal {
    options: PortalOptions,
    store: Arc<SessionStore>,
    backend: Arc<dyn AuthBackend>,
    gateway: RequestGateway,
    /// Store-clock second of the last successful backend validation
    last_validated: Mutex<Option<i64>>,
}

impl Portal {
    /// Create a portal talking HTTP to `options.api_url`
    pub fn new(options: PortalOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build()?;

        let persistence: Arc<dyn SessionPersistence> = match &options.storage_path {
            Some(dir) => Arc::new(FilePersistence::new(dir, &options.storage_key)),
            None => Arc::new(MemoryPersistence::new()),
        };
        let backend = Arc::new(HttpAuthBackend::new(&options.api_url, http_client.clone()));

        Ok(Self::from_parts(
            options,
            http_client,
            backend,
            persistence,
            Arc::new(SystemClock),
        ))
    }

    /// Assemble a portal from explicit collaborators
    pub fn from_parts(
        options: PortalOptions,
        http_client: Client,
        backend: Arc<dyn AuthBackend>,
        persistence: Arc<dyn SessionPersistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth_options = options.auth_options();
        let store = Arc::new(SessionStore::with_clock(
            persistence,
            auth_options.persist_policy,
            clock,
        ));
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), auth_options.refresh_timeout);
        let gateway = RequestGateway::new(
            &options.api_url,
            http_client,
            store.clone(),
            coordinator,
            auth_options,
        );

        Self {
            options,
            store,
            backend,
            gateway,
            last_validated: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &PortalOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        self.gateway.coordinator()
    }

    /// Restore the persisted session, refresh it when its access token is
    /// missing or stale, and only then mark the store hydrated. Guards see
    /// a single settled state instead of a logged-in flash.
    pub async fn hydrate(&self, carried: Option<TokenPair>) -> Session {
        let session = self.store.restore(carried);

        if self.options.auto_refresh_token && session.refresh_token.is_some() {
            let stale = match session.access_token.as_deref().map(TokenCodec::decode) {
                Some(Ok(claims)) => TokenCodec::is_expiring_soon(
                    &claims,
                    self.store.now(),
                    self.options.expiry_window_secs,
                ),
                _ => true,
            };
            if stale {
                debug!("Restored session is stale, refreshing before hydration completes");
                if let Err(e) = self.coordinator().refresh().await {
                    warn!("Could not refresh restored session: {}", e);
                }
            }
        }

        self.store.mark_hydrated();
        self.store.get()
    }

    /// Log in and store the session.
    ///
    /// When `required_roles` is configured, a user holding none of them is
    /// refused with [`Error::AccessDenied`] and nothing is stored.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let response = self
            .backend
            .login(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;

        let user = match response.user() {
            Some(user) => user,
            None => {
                let claims = TokenCodec::decode(&response.access_token)?;
                let id = claims.subject.unwrap_or_else(|| username.to_string());
                User::new(&id, username).with_roles(claims.roles)
            }
        };

        let required = &self.options.required_roles;
        if !required.is_empty() && !roles::intersects(&user.roles, required) {
            warn!("User {} lacks the roles required by this portal", user.username);
            return Err(Error::access_denied(format!(
                "user {} has none of the roles {:?}",
                user.username, required
            )));
        }

        let session = self
            .store
            .set_session(user, response.access_token, response.refresh_token)?;
        *self.last_validated.lock() = Some(self.store.now());
        info!("Logged in as {}", username);
        Ok(session)
    }

    /// Tell the backend (best effort) and clear the local session.
    pub async fn logout(&self) {
        let token = self.store.access_token();
        if let Err(e) = self.backend.logout(token.as_deref()).await {
            warn!("Backend logout failed, clearing locally anyway: {}", e);
        }
        *self.last_validated.lock() = None;
        self.store.clear();
    }

    /// `true` when the session is usable after this call.
    ///
    /// Stale tokens are refreshed. A live token is checked with the backend
    /// at most once per `validation_interval`; an invalid answer or a failed
    /// check leads to a refresh.
    pub async fn ensure_valid_session(&self) -> bool {
        let token = match self.store.access_token() {
            Some(token) => token,
            None => return false,
        };
        let now = self.store.now();

        let claims = match TokenCodec::decode(&token) {
            Ok(claims) => claims,
            Err(_) => return self.refresh().await,
        };
        if TokenCodec::is_expiring_soon(&claims, now, self.options.expiry_window_secs) {
            return self.refresh().await;
        }

        let interval = self.options.validation_interval.as_secs() as i64;
        let last_validated = *self.last_validated.lock();
        if let Some(last) = last_validated {
            if now - last < interval {
                return true;
            }
        }

        match self.backend.validate(&token).await {
            Ok(validation) if validation.valid => {
                *self.last_validated.lock() = Some(now);
                true
            }
            Ok(_) => {
                info!("Backend reports the access token invalid");
                self.refresh().await
            }
            Err(e) => {
                warn!("Token validation failed: {}", e);
                self.refresh().await
            }
        }
    }

    async fn refresh(&self) -> bool {
        let observed = self.store.access_token();
        match self.coordinator().refresh_if_stale(observed.as_deref()).await {
            Ok(_) => {
                *self.last_validated.lock() = Some(self.store.now());
                true
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                false
            }
        }
    }

    /// Periodically run [`ensure_valid_session`](Self::ensure_valid_session)
    /// while someone is logged in. Abort the handle to stop it.
    pub fn spawn_session_keeper(self: &Arc<Self>) -> JoinHandle<()> {
        let portal = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(portal.options.keeper_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if portal.store.access_token().is_some() && !portal.ensure_valid_session().await {
                    debug!("Session keeper could not keep the session alive");
                }
            }
        })
    }

    /// Guard options for this portal's protected subtree
    pub fn guard_options(&self) -> GuardOptions {
        self.options.guard_options()
    }

    pub fn guard(&self, options: GuardOptions) -> AccessGuard {
        AccessGuard::new(options)
    }

    pub fn mount_guard(&self, options: GuardOptions, navigator: Arc<dyn Navigator>) -> MountedGuard {
        MountedGuard::mount(self.store.clone(), options, navigator)
    }

    pub fn edge(&self) -> EdgeRedirector {
        EdgeRedirector::new(self.options.edge_options())
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{ApiRequest, GatewayError, Session, SessionEvent, SessionStatus, User};
    pub use crate::config::PortalOptions;
    pub use crate::error::Error;
    pub use crate::guard::{EdgeDecision, GuardOptions, GuardState, Navigator, Render};
    pub use crate::Portal;
}
