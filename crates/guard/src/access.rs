//! Route protection.
//!
//! [`check_access`] is the pure capability check; [`AccessGuard`] is the
//! per-view state machine built on it; [`MountedGuard`] wires a guard to a
//! [`SessionStore`] and a [`Navigator`].

use log::{debug, info};
use parking_lot::Mutex;
use portal_session_auth::{Session, SessionStore, TokenCodec};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::roles::{intersects, primary_role};

pub const DEFAULT_LOGIN_ROUTE: &str = "/auth/login";

/// Appended to the login route when a session the guard had accepted ends
pub const SESSION_EXPIRED_QUERY: &str = "error=session_expired";
pub const DEFAULT_HOME_ROUTE: &str = "/dashboard";

/// ロールごとのホーム画面
#[derive(Debug, Clone)]
pub struct RoleHomes {
    homes: Vec<(String, String)>,
    default_home: String,
}

impl Default for RoleHomes {
    fn default() -> Self {
        Self {
            homes: vec![
                ("super_admin".to_string(), "/admin/dashboard".to_string()),
                ("admin".to_string(), "/admin/dashboard".to_string()),
            ],
            default_home: DEFAULT_HOME_ROUTE.to_string(),
        }
    }
}

impl RoleHomes {
    /// No role-specific homes, everyone lands on `default_home`
    pub fn new(default_home: &str) -> Self {
        Self {
            homes: Vec::new(),
            default_home: default_home.to_string(),
        }
    }

    pub fn with_home(mut self, role: &str, path: &str) -> Self {
        let role = crate::roles::normalize_role(role);
        self.homes.retain(|(r, _)| *r != role);
        self.homes.push((role, path.to_string()));
        self
    }

    pub fn with_default(mut self, path: &str) -> Self {
        self.default_home = path.to_string();
        self
    }

    /// Home of the highest-privilege role that has one configured.
    pub fn home_for<I, S>(&self, roles: I) -> &str
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roles: Vec<String> = roles
            .into_iter()
            .map(|r| crate::roles::normalize_role(r.as_ref()))
            .collect();

        let primary = primary_role(&roles);
        if let Some((_, home)) = self.homes.iter().find(|(r, _)| r == primary.as_str()) {
            if roles.iter().any(|r| r == primary.as_str()) {
                return home;
            }
        }
        self.homes
            .iter()
            .find(|(r, _)| roles.contains(r))
            .map(|(_, home)| home.as_str())
            .unwrap_or(self.default_home.as_str())
    }

    pub fn default_home(&self) -> &str {
        &self.default_home
    }
}

/// ガードオプション
#[derive(Debug, Clone)]
pub struct GuardOptions {
    /// Roles allowed to view the subtree; empty means any logged-in user
    pub allowed_roles: Vec<String>,
    pub login_route: String,
    /// Where a logged-in user without a matching role goes. Falls back to
    /// the user's role home.
    pub access_denied_route: Option<String>,
    pub role_homes: RoleHomes,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            allowed_roles: Vec::new(),
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            access_denied_route: None,
            role_homes: RoleHomes::default(),
        }
    }
}

impl GuardOptions {
    pub fn new<I, S>(allowed_roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_allowed_roles(allowed_roles)
    }

    pub fn with_allowed_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_login_route(mut self, route: &str) -> Self {
        self.login_route = route.to_string();
        self
    }

    pub fn with_access_denied_route(mut self, route: &str) -> Self {
        self.access_denied_route = Some(route.to_string());
        self
    }

    pub fn with_role_homes(mut self, homes: RoleHomes) -> Self {
        self.role_homes = homes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotLoggedIn,
    RoleMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The session has not been hydrated yet
    Pending,
    Granted,
    Denied(DenyReason),
}

/// Decide whether `session` may view a subtree open to `allowed`.
///
/// `None` means hydration has not finished. A session counts as logged in
/// when it has a user and a decodable, unexpired access token.
pub fn check_access<A: AsRef<str>>(
    session: Option<&Session>,
    allowed: &[A],
    now: i64,
) -> AccessDecision {
    let session = match session {
        Some(session) => session,
        None => return AccessDecision::Pending,
    };

    let logged_in = session
        .access_token
        .as_deref()
        .and_then(|t| TokenCodec::decode(t).ok())
        .map(|claims| !TokenCodec::is_expired(&claims, now))
        .unwrap_or(false);

    let user = match (&session.user, logged_in) {
        (Some(user), true) => user,
        _ => return AccessDecision::Denied(DenyReason::NotLoggedIn),
    };

    if allowed.is_empty() || intersects(&user.roles, allowed) {
        AccessDecision::Granted
    } else {
        AccessDecision::Denied(DenyReason::RoleMismatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Unknown,
    Authorized,
    Unauthorized,
}

/// What the host should draw for the guarded subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    /// Neutral placeholder while hydration is pending
    Loading,
    Children,
    Nothing,
}

/// アクセスガード
#[derive(Debug)]
pub struct AccessGuard {
    options: GuardOptions,
    state: GuardState,
    redirect: Option<String>,
}

impl AccessGuard {
    pub fn new(options: GuardOptions) -> Self {
        Self {
            options,
            state: GuardState::Unknown,
            redirect: None,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn options(&self) -> &GuardOptions {
        &self.options
    }

    /// Where the guard sent the viewer, once it has.
    pub fn redirected_to(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn render(&self) -> Render {
        match self.state {
            GuardState::Unknown => Render::Loading,
            GuardState::Authorized => Render::Children,
            GuardState::Unauthorized => Render::Nothing,
        }
    }

    /// Feed the current session. Returns the route to navigate to on the
    /// transition into `Unauthorized`, and `None` on every other call.
    pub fn evaluate(&mut self, session: Option<&Session>, now: i64) -> Option<String> {
        if self.state == GuardState::Unauthorized {
            return None;
        }

        match check_access(session, &self.options.allowed_roles, now) {
            AccessDecision::Pending => None,
            AccessDecision::Granted => {
                if self.state != GuardState::Authorized {
                    debug!("Access granted");
                }
                self.state = GuardState::Authorized;
                None
            }
            AccessDecision::Denied(reason) => {
                let was_authorized = self.state == GuardState::Authorized;
                let target = self.fallback(reason, session, was_authorized);
                info!("Access denied ({:?}), redirecting to {}", reason, target);
                self.state = GuardState::Unauthorized;
                self.redirect = Some(target.clone());
                Some(target)
            }
        }
    }

    fn fallback(&self, reason: DenyReason, session: Option<&Session>, was_authorized: bool) -> String {
        match reason {
            DenyReason::NotLoggedIn if was_authorized => {
                let separator = if self.options.login_route.contains('?') { '&' } else { '?' };
                format!("{}{}{}", self.options.login_route, separator, SESSION_EXPIRED_QUERY)
            }
            DenyReason::NotLoggedIn => self.options.login_route.clone(),
            DenyReason::RoleMismatch => match &self.options.access_denied_route {
                Some(route) => route.clone(),
                None => {
                    let roles = session
                        .and_then(|s| s.user.as_ref())
                        .map(|u| u.roles.iter().cloned().collect::<Vec<_>>())
                        .unwrap_or_default();
                    self.options.role_homes.home_for(roles).to_string()
                }
            },
        }
    }
}

/// Performs client-side navigation for a mounted guard
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// An [`AccessGuard`] following a [`SessionStore`].
///
/// Dropping it (or calling [`unmount`](Self::unmount)) stops the watcher
/// task; no navigation happens after that.
pub struct MountedGuard {
    guard: Arc<Mutex<AccessGuard>>,
    mounted: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl MountedGuard {
    /// Must be called within a tokio runtime.
    pub fn mount(
        store: Arc<SessionStore>,
        options: GuardOptions,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let guard = Arc::new(Mutex::new(AccessGuard::new(options)));
        let mounted = Arc::new(Mutex::new(true));

        // イベントを取りこぼさないよう、評価より先に購読する
        let mut events = store.subscribe();
        step(&store, &guard, &mounted, navigator.as_ref());

        let task = {
            let guard = guard.clone();
            let mounted = mounted.clone();
            tokio::spawn(async move {
                loop {
                    if guard.lock().state() == GuardState::Unauthorized {
                        break;
                    }
                    match events.recv().await {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            step(&store, &guard, &mounted, navigator.as_ref());
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Guard watcher finished");
            })
        };

        Self {
            guard,
            mounted,
            task: Some(task),
        }
    }

    pub fn state(&self) -> GuardState {
        self.guard.lock().state()
    }

    pub fn render(&self) -> Render {
        self.guard.lock().render()
    }

    pub fn redirected_to(&self) -> Option<String> {
        self.guard.lock().redirected_to().map(str::to_string)
    }

    pub fn unmount(self) {}
}

impl Drop for MountedGuard {
    fn drop(&mut self) {
        *self.mounted.lock() = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn step(
    store: &SessionStore,
    guard: &Mutex<AccessGuard>,
    mounted: &Mutex<bool>,
    navigator: &dyn Navigator,
) {
    let session = store.is_hydrated().then(|| store.get());
    let target = guard.lock().evaluate(session.as_ref(), store.now());

    if let Some(target) = target {
        let mounted = mounted.lock();
        if *mounted {
            navigator.navigate(&target);
        } else {
            debug!("Guard unmounted, dropping redirect to {}", target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use portal_session_auth::{FixedClock, MemoryPersistence, PersistPolicy, TokenPair, User};
    use serde_json::json;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;

    fn token(role: &str, exp: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(json!({"sub": "u1", "role": role, "exp": exp}).to_string());
        format!("h.{}.s", payload)
    }

    fn session(roles: &[&str], exp: i64) -> Session {
        Session {
            access_token: Some(token(roles.first().copied().unwrap_or("user"), exp)),
            refresh_token: None,
            user: Some(Arc::new(User::new("u1", "alice").with_roles(roles.iter().copied()))),
        }
    }

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::with_clock(
            Arc::new(MemoryPersistence::new()),
            PersistPolicy::UserOnly,
            Arc::new(FixedClock::new(NOW)),
        ))
    }

    #[derive(Default)]
    struct RecordingNavigator {
        routes: Mutex<Vec<String>>,
    }

    impl RecordingNavigator {
        fn routes(&self) -> Vec<String> {
            self.routes.lock().clone()
        }
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, route: &str) {
            self.routes.lock().push(route.to_string());
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_check_access() {
        let admin = session(&["ROLE_ADMIN"], NOW + 60);
        assert_eq!(check_access::<&str>(None, &["admin"], NOW), AccessDecision::Pending);
        assert_eq!(check_access(Some(&admin), &["admin"], NOW), AccessDecision::Granted);
        assert_eq!(check_access::<&str>(Some(&admin), &[], NOW), AccessDecision::Granted);
        assert_eq!(
            check_access(Some(&admin), &["employee"], NOW),
            AccessDecision::Denied(DenyReason::RoleMismatch)
        );
        assert_eq!(
            check_access(Some(&Session::default()), &["admin"], NOW),
            AccessDecision::Denied(DenyReason::NotLoggedIn)
        );
        assert_eq!(
            check_access(Some(&session(&["admin"], NOW - 1)), &["admin"], NOW),
            AccessDecision::Denied(DenyReason::NotLoggedIn)
        );
    }

    #[test]
    fn test_unknown_never_renders_children_or_redirects() {
        let mut guard = AccessGuard::new(GuardOptions::new(["admin"]));
        assert_eq!(guard.render(), Render::Loading);
        assert_eq!(guard.evaluate(None, NOW), None);
        assert_eq!(guard.state(), GuardState::Unknown);
        assert_eq!(guard.render(), Render::Loading);
    }

    #[test]
    fn test_redirects_exactly_once() {
        let mut guard = AccessGuard::new(GuardOptions::new(["admin"]));
        let admin = session(&["admin"], NOW + 60);

        assert_eq!(guard.evaluate(Some(&admin), NOW), None);
        assert_eq!(guard.render(), Render::Children);

        let target = guard.evaluate(Some(&Session::default()), NOW);
        assert_eq!(target.as_deref(), Some("/auth/login?error=session_expired"));
        assert_eq!(guard.render(), Render::Nothing);

        // 終端状態: 再ログインしても再描画しない
        assert_eq!(guard.evaluate(Some(&Session::default()), NOW), None);
        assert_eq!(guard.evaluate(Some(&admin), NOW), None);
        assert_eq!(guard.state(), GuardState::Unauthorized);
    }

    #[test]
    fn test_never_authorized_goes_to_plain_login() {
        let mut guard = AccessGuard::new(GuardOptions::new(["admin"]).with_login_route("/login?tab=staff"));
        assert_eq!(guard.evaluate(Some(&Session::default()), NOW).as_deref(), Some("/login?tab=staff"));

        let mut guard = AccessGuard::new(GuardOptions::new(["admin"]).with_login_route("/login?tab=staff"));
        guard.evaluate(Some(&session(&["admin"], NOW + 60)), NOW);
        assert_eq!(
            guard.evaluate(Some(&session(&["admin"], NOW + 60)), NOW + 60).as_deref(),
            Some("/login?tab=staff&error=session_expired")
        );
    }

    #[test]
    fn test_role_mismatch_fallbacks() {
        let employee = session(&["employee"], NOW + 60);
        let admin = session(&["admin"], NOW + 60);

        let mut guard = AccessGuard::new(GuardOptions::new(["admin"]));
        assert_eq!(guard.evaluate(Some(&employee), NOW).as_deref(), Some(DEFAULT_HOME_ROUTE));

        let mut guard = AccessGuard::new(
            GuardOptions::new(["employee"]).with_access_denied_route("/access-denied"),
        );
        assert_eq!(guard.evaluate(Some(&admin), NOW).as_deref(), Some("/access-denied"));

        let mut guard = AccessGuard::new(GuardOptions::new(["employee"]));
        assert_eq!(guard.evaluate(Some(&admin), NOW).as_deref(), Some("/admin/dashboard"));
    }

    #[test]
    fn test_role_homes() {
        let homes = RoleHomes::new("/").with_home("ROLE_EMPLOYEE", "/employee");
        assert_eq!(homes.home_for(["employee", "user"]), "/employee");
        assert_eq!(homes.home_for(["user"]), "/");
        assert_eq!(RoleHomes::default().home_for(["super_admin"]), "/admin/dashboard");
    }

    #[tokio::test]
    async fn test_mounted_guard_waits_for_hydration() {
        let store = store();
        let navigator = Arc::new(RecordingNavigator::default());
        let guard = MountedGuard::mount(store.clone(), GuardOptions::new(["admin"]), navigator.clone());

        settle().await;
        assert_eq!(guard.render(), Render::Loading);
        assert!(navigator.routes().is_empty());

        store.hydrate(Some(TokenPair {
            access_token: token("admin", NOW + 600),
            refresh_token: None,
        }));
        settle().await;
        assert_eq!(guard.render(), Render::Children);
        assert!(navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_redirects_to_login_once() {
        let store = store();
        store
            .set_session(User::new("u1", "alice").with_roles(["admin"]), token("admin", NOW - 1), None)
            .unwrap();
        let navigator = Arc::new(RecordingNavigator::default());

        let guard = MountedGuard::mount(store.clone(), GuardOptions::new(["admin"]), navigator.clone());
        store.clear();
        store.clear();
        settle().await;

        assert_eq!(navigator.routes(), vec![DEFAULT_LOGIN_ROUTE.to_string()]);
        assert_eq!(guard.state(), GuardState::Unauthorized);
        assert_eq!(guard.render(), Render::Nothing);
    }

    #[tokio::test]
    async fn test_logout_after_authorized_redirects_once() {
        let store = store();
        store
            .set_session(User::new("u1", "alice").with_roles(["admin"]), token("admin", NOW + 600), None)
            .unwrap();
        let navigator = Arc::new(RecordingNavigator::default());
        let guard = MountedGuard::mount(store.clone(), GuardOptions::new(["admin"]), navigator.clone());
        assert_eq!(guard.render(), Render::Children);

        store.clear();
        settle().await;
        store
            .set_session(User::new("u1", "alice").with_roles(["admin"]), token("admin", NOW + 600), None)
            .unwrap();
        store.clear();
        settle().await;

        assert_eq!(navigator.routes(), vec!["/auth/login?error=session_expired".to_string()]);
    }

    #[tokio::test]
    async fn test_unmounted_guard_never_navigates() {
        let store = store();
        let navigator = Arc::new(RecordingNavigator::default());
        let guard = MountedGuard::mount(store.clone(), GuardOptions::new(["admin"]), navigator.clone());

        guard.unmount();
        store.hydrate(None);
        settle().await;

        assert!(navigator.routes().is_empty());
    }
}
