//! Authentication: the facade, its session backends and the route guard.

pub mod errors;
mod facade;
pub mod guard;
pub mod session;

pub use errors::{classify, AuthErrorKind};
pub use facade::{AuthFacade, LoginOutcome, RegisterOutcome, ResetOutcome, UserWithProfile};
pub use guard::{GuardState, GuardWatcher, Redirect, RoleRequirement, RouteGuard};
pub use session::{
    LegacySession, LegacySessionProvider, ProviderSessionProvider, SessionChain, SessionGrant,
    SessionProvider,
};

/// Auth state change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut,
    TokenRefreshed,
}
