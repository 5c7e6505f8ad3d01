//! Feature-level authorization consulted during the relay handshake.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The feature a terminal connection needs.
pub const TERMINAL_FEATURE: &str = "terminal";

/// Features a regular user is denied unless overridden.
pub const DEFAULT_DENIED_FEATURES: &[&str] = &["agent", "terminal", "server"];

/// Features that can never be denied, so users can always reach their
/// settings and log out.
pub const ALWAYS_ALLOWED_FEATURES: &[&str] = &["settings"];

/// Decides whether a user may use a feature.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, user_id: &str, feature: &str) -> bool;
}

/// Grants everything. For single-user and development setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _user_id: &str, _feature: &str) -> bool {
        true
    }
}

/// Per-user override of the default denied list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPermissions {
    pub is_admin: bool,
    pub denied_features: Vec<String>,
    /// Ignore `denied_features` and inherit the policy defaults.
    pub use_defaults: bool,
}

/// Admin/default/override permission model.
///
/// Admins may use everything. Users with an entry in `users` (and
/// `use_defaults` unset) are checked against their own denied list;
/// everyone else against `default_denied`. Always-allowed features win
/// over any denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    pub admins: Vec<String>,
    pub default_denied: Vec<String>,
    pub users: HashMap<String, UserPermissions>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            default_denied: DEFAULT_DENIED_FEATURES.iter().map(|f| f.to_string()).collect(),
            users: HashMap::new(),
        }
    }
}

impl PermissionPolicy {
    fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|a| a == user_id)
            || self.users.get(user_id).is_some_and(|u| u.is_admin)
    }

    fn denied_for(&self, user_id: &str) -> &[String] {
        match self.users.get(user_id) {
            Some(user) if !user.use_defaults => &user.denied_features,
            _ => &self.default_denied,
        }
    }
}

impl Authorizer for PermissionPolicy {
    fn authorize(&self, user_id: &str, feature: &str) -> bool {
        if ALWAYS_ALLOWED_FEATURES.contains(&feature) || self.is_admin(user_id) {
            return true;
        }
        !self.denied_for(user_id).iter().any(|f| f == feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PermissionPolicy {
        let mut users = HashMap::new();
        users.insert(
            "trusted@example.com".to_string(),
            UserPermissions {
                denied_features: vec!["agent".into()],
                ..Default::default()
            },
        );
        users.insert(
            "inherits@example.com".to_string(),
            UserPermissions {
                denied_features: Vec::new(),
                use_defaults: true,
                ..Default::default()
            },
        );
        users.insert(
            "locked@example.com".to_string(),
            UserPermissions {
                denied_features: vec!["settings".into(), "notes".into()],
                ..Default::default()
            },
        );
        PermissionPolicy {
            admins: vec!["root@example.com".into()],
            users,
            ..Default::default()
        }
    }

    #[test]
    fn allow_all_allows() {
        assert!(AllowAll.authorize("anyone", TERMINAL_FEATURE));
    }

    #[test]
    fn unknown_users_get_the_default_denied_list() {
        let policy = policy();
        assert!(!policy.authorize("stranger@example.com", TERMINAL_FEATURE));
        assert!(policy.authorize("stranger@example.com", "notes"));
    }

    #[test]
    fn admins_are_allowed_everything() {
        let policy = policy();
        assert!(policy.authorize("root@example.com", TERMINAL_FEATURE));
        assert!(policy.authorize("root@example.com", "server"));
        assert!(policy.authorize("root@example.com", "agent"));
    }

    #[test]
    fn overrides_replace_the_defaults() {
        let policy = policy();
        assert!(policy.authorize("trusted@example.com", TERMINAL_FEATURE));
        assert!(!policy.authorize("trusted@example.com", "agent"));
    }

    #[test]
    fn use_defaults_ignores_the_override_list() {
        let policy = policy();
        assert!(!policy.authorize("inherits@example.com", TERMINAL_FEATURE));
    }

    #[test]
    fn settings_cannot_be_denied() {
        let policy = policy();
        assert!(policy.authorize("locked@example.com", "settings"));
        assert!(!policy.authorize("locked@example.com", "notes"));
    }

    #[test]
    fn deserializes_from_toml() {
        let policy: PermissionPolicy = toml::from_str(
            r#"
admins = ["root@example.com"]

[users."dev@example.com"]
denied_features = []
"#,
        )
        .unwrap();
        assert_eq!(policy.default_denied, vec!["agent", "terminal", "server"]);
        assert!(policy.authorize("dev@example.com", TERMINAL_FEATURE));
    }
}
