//! Route guard: decides whether a protected view renders or redirects.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use site_common::Role;

use super::AuthFacade;

pub const LOGIN_PATH: &str = "/login";
pub const ADMIN_HOME_PATH: &str = "/admin";
pub const USER_HOME_PATH: &str = "/dashboard";

/// Role a protected view demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRequirement {
    /// Any signed-in caller.
    Any,
    AdminOnly,
    UserOnly,
}

/// Navigation the caller must perform. `replace` drops the guarded view from
/// history so back-navigation cannot loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub to: &'static str,
    pub replace: bool,
}

impl Redirect {
    fn replace(to: &'static str) -> Self {
        Self { to, replace: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardState {
    /// Check in flight; render a loading indicator.
    Checking,
    Authorized,
    Unauthorized { redirect: Redirect },
}

pub struct RouteGuard {
    facade: Arc<AuthFacade>,
    requirement: RoleRequirement,
}

impl RouteGuard {
    pub fn new(facade: Arc<AuthFacade>, requirement: RoleRequirement) -> Self {
        Self {
            facade,
            requirement,
        }
    }

    pub fn requirement(&self) -> RoleRequirement {
        self.requirement
    }

    /// Run the check once.
    pub async fn check(&self) -> GuardState {
        if !self.facade.is_authenticated().await {
            return GuardState::Unauthorized {
                redirect: Redirect::replace(LOGIN_PATH),
            };
        }
        if self.requirement == RoleRequirement::Any {
            return GuardState::Authorized;
        }

        let role = self
            .facade
            .current_user_with_profile()
            .await
            .map(|u| u.role())
            .unwrap_or(Role::User);
        decide(self.requirement, role)
    }
}

fn decide(requirement: RoleRequirement, role: Role) -> GuardState {
    match (requirement, role) {
        (RoleRequirement::AdminOnly, Role::User) => GuardState::Unauthorized {
            redirect: Redirect::replace(USER_HOME_PATH),
        },
        (RoleRequirement::UserOnly, Role::Admin) => GuardState::Unauthorized {
            redirect: Redirect::replace(ADMIN_HOME_PATH),
        },
        _ => GuardState::Authorized,
    }
}

/// Keeps a guard's state current, re-running the check on every auth event.
///
/// The task is aborted when the watcher is dropped.
pub struct GuardWatcher {
    state: watch::Receiver<GuardState>,
    task: JoinHandle<()>,
}

impl GuardWatcher {
    pub fn spawn(guard: RouteGuard) -> Self {
        // Subscribe before the first check so no event is missed in between.
        let mut events = guard.facade.subscribe();
        let (tx, rx) = watch::channel(GuardState::Checking);

        let task = tokio::spawn(async move {
            let _ = tx.send(guard.check().await);
            loop {
                match events.recv().await {
                    Ok(event) => tracing::debug!("Auth event {:?}, re-checking guard", event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Guard missed {} auth events, re-checking", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let _ = tx.send(GuardState::Checking);
                let state = guard.check().await;
                if tx.send(state).is_err() {
                    break;
                }
            }
        });

        Self { state: rx, task }
    }

    pub fn state(&self) -> GuardState {
        *self.state.borrow()
    }

    /// A receiver for following state changes.
    pub fn receiver(&self) -> watch::Receiver<GuardState> {
        self.state.clone()
    }
}

impl Drop for GuardWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
