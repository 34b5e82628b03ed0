//! JWT claims and user roles.

use serde::{Deserialize, Serialize};

/// Permission allowing lifecycle operations on instances.
pub const MANAGE_INSTANCE: &str = "manage:instance";

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Can read instance state.
    #[default]
    User,
    /// Can do everything.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user or service id).
    pub sub: String,

    #[serde(default)]
    pub iss: Option<String>,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    #[serde(default)]
    pub iat: Option<i64>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Single-role alternative to `roles`.
    #[serde(default)]
    pub role: Option<String>,

    /// Fine-grained capabilities such as `manage:instance`.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Claims {
    /// Effective role: admin if any role claim says so.
    pub fn effective_role(&self) -> Role {
        let is_admin = self
            .role
            .iter()
            .chain(self.roles.iter())
            .any(|r| r.eq_ignore_ascii_case("admin"));

        if is_admin { Role::Admin } else { Role::User }
    }

    pub fn is_admin(&self) -> bool {
        self.effective_role() == Role::Admin
    }

    /// Admins hold every permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_admin() || self.permissions.iter().any(|p| p == permission)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.sub)
    }
}
