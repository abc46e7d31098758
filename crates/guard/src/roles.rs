//! Role names and the helpers both portals share.
//!
//! Backends disagree on spelling (`ROLE_ADMIN`, `Admin`, `admin`), so every
//! comparison goes through [`normalize_role`].

use std::fmt;

pub const ADMIN_ROLES: &[&str] = &["admin", "super_admin"];
pub const EMPLOYEE_ROLES: &[&str] = &["user", "employee", "admin", "super_admin"];

/// 権限の高い順のロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    User,
    Employee,
    Moderator,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Employee => "employee",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Employee => "Employee",
            Role::Moderator => "Moderator",
            Role::Admin => "Administrator",
            Role::SuperAdmin => "Super Admin",
        }
    }

    pub fn parse(role: &str) -> Option<Role> {
        match normalize_role(role).as_str() {
            "user" => Some(Role::User),
            "employee" => Some(Role::Employee),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            "super_admin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase and strip a leading `ROLE_` prefix.
pub fn normalize_role(role: &str) -> String {
    let role = role.trim();
    let stripped = match role.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("role_") => &role[5..],
        _ => role,
    };
    stripped.to_ascii_lowercase()
}

pub fn roles_match(a: &str, b: &str) -> bool {
    normalize_role(a) == normalize_role(b)
}

pub fn has_role<I, S>(roles: I, target: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    roles.into_iter().any(|r| roles_match(r.as_ref(), target))
}

/// `true` when `roles` and `allowed` share at least one role
pub fn intersects<I, S, A>(roles: I, allowed: &[A]) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    A: AsRef<str>,
{
    roles
        .into_iter()
        .any(|r| allowed.iter().any(|a| roles_match(r.as_ref(), a.as_ref())))
}

pub fn is_admin<I, S>(roles: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    intersects(roles, ADMIN_ROLES)
}

pub fn is_employee<I, S>(roles: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    intersects(roles, EMPLOYEE_ROLES)
}

pub fn can_access_admin<I, S>(roles: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    is_admin(roles)
}

pub fn can_access_employee<I, S>(roles: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    is_employee(roles)
}

/// Highest-privilege known role; `User` when nothing is recognised.
pub fn primary_role<I, S>(roles: I) -> Role
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    roles
        .into_iter()
        .filter_map(|r| Role::parse(r.as_ref()))
        .max()
        .unwrap_or(Role::User)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_role() {
        assert_eq!(normalize_role("ROLE_ADMIN"), "admin");
        assert_eq!(normalize_role("role_Employee"), "employee");
        assert_eq!(normalize_role(" Super_Admin "), "super_admin");
        assert_eq!(normalize_role("ROLE"), "role");
    }

    #[test]
    fn test_admin_checks() {
        assert!(is_admin(["ROLE_ADMIN"]));
        assert!(is_admin(vec!["user".to_string(), "super_admin".to_string()]));
        assert!(!is_admin(["moderator"]));
        assert!(!can_access_admin(Vec::<String>::new()));
    }

    #[test]
    fn test_employee_checks() {
        assert!(can_access_employee(["user"]));
        assert!(can_access_employee(["ADMIN"]));
        assert!(!can_access_employee(["moderator"]));
        assert!(has_role(["Moderator"], "moderator"));
    }

    #[test]
    fn test_primary_role_priority() {
        assert_eq!(primary_role(["user", "admin", "moderator"]), Role::Admin);
        assert_eq!(primary_role(["employee", "ROLE_SUPER_ADMIN"]), Role::SuperAdmin);
        assert_eq!(primary_role(["moderator", "employee"]), Role::Moderator);
        assert_eq!(primary_role(["guest"]), Role::User);
        assert_eq!(Role::SuperAdmin.display_name(), "Super Admin");
    }
}
