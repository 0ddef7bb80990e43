//! Authorization role attached to an identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authorization level. Absence of a profile record means `User`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    /// Admin satisfies every requirement; user satisfies only `User`.
    pub fn satisfies(&self, required: Role) -> bool {
        match required {
            Role::User => true,
            Role::Admin => *self == Role::Admin,
        }
    }

    /// Read the role out of a profile's `role` field. Anything but `"admin"` is `User`.
    pub fn from_profile_value(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("admin") => Role::Admin,
            _ => Role::User,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_from_profile_value() {
        assert_eq!(Role::from_profile_value(Some(&json!("admin"))), Role::Admin);
        assert_eq!(Role::from_profile_value(Some(&json!("user"))), Role::User);
        assert_eq!(Role::from_profile_value(Some(&json!("Admin"))), Role::User);
        assert_eq!(Role::from_profile_value(Some(&json!(true))), Role::User);
        assert_eq!(Role::from_profile_value(None), Role::User);
    }

    #[test]
    fn test_role_satisfies() {
        assert!(Role::Admin.satisfies(Role::User));
        assert!(Role::Admin.satisfies(Role::Admin));
        assert!(Role::User.satisfies(Role::User));
        assert!(!Role::User.satisfies(Role::Admin));
    }
}
