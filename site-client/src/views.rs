//! Site views and their access requirements.

use serde::Serialize;

use crate::auth::RoleRequirement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Public,
    Guarded(RoleRequirement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct View {
    pub name: &'static str,
    /// Route pattern; `:param` segments match any single segment.
    pub path: &'static str,
    pub access: Access,
}

pub const VIEWS: &[View] = &[
    View { name: "home", path: "/", access: Access::Public },
    View { name: "about", path: "/about", access: Access::Public },
    View { name: "services", path: "/services", access: Access::Public },
    View { name: "blog", path: "/blog", access: Access::Public },
    View { name: "blog_post", path: "/blog/:slug", access: Access::Public },
    View { name: "contact", path: "/contact", access: Access::Public },
    View { name: "login", path: "/login", access: Access::Public },
    View { name: "register", path: "/register", access: Access::Public },
    View { name: "forgot_password", path: "/forgot-password", access: Access::Public },
    View {
        name: "dashboard",
        path: "/dashboard",
        access: Access::Guarded(RoleRequirement::UserOnly),
    },
    View {
        name: "admin",
        path: "/admin",
        access: Access::Guarded(RoleRequirement::AdminOnly),
    },
];

/// The view whose pattern matches `path`. Trailing slashes and query strings
/// are ignored.
pub fn find(path: &str) -> Option<&'static View> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments = split(path);
    VIEWS.iter().find(|view| {
        let pattern = split(view.path);
        pattern.len() == segments.len()
            && pattern
                .iter()
                .zip(&segments)
                .all(|(p, s)| p.starts_with(':') || p == s)
    })
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
