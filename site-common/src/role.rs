//! Role types for the access model.

use serde::{Deserialize, Serialize};

/// Role stored on a user profile.
///
/// The role is only ever read from the profile row. Anything that cannot
/// resolve a profile falls back to [`Role::User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Site administrator - manages posts, comments and users.
    Admin,
    /// Regular account - owns a dashboard and its own posts/comments.
    #[default]
    User,
}

impl Role {
    /// All role variants for iteration.
    pub const ALL: [Role; 2] = [Role::Admin, Role::User];

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Parse a role string, falling back to [`Role::User`] for anything unknown.
    pub fn parse_or_default(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}
