//! Route guards for the feedback portals
//!
//! Two layers decide whether a viewer may see a page: [`EdgeRedirector`]
//! runs per request on the credential cookie, and [`AccessGuard`] runs in
//! the client against the session store once it is hydrated.

mod access;
mod edge;
pub mod roles;

pub use access::{
    check_access, AccessDecision, AccessGuard, DenyReason, GuardOptions, GuardState,
    MountedGuard, Navigator, Render, RoleHomes, DEFAULT_HOME_ROUTE, DEFAULT_LOGIN_ROUTE,
    SESSION_EXPIRED_QUERY,
};
pub use edge::{EdgeDecision, EdgeOptions, EdgeRedirector, RouteRule, DEFAULT_COOKIE_NAME};
pub use roles::Role;
