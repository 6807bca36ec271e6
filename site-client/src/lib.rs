//! Site client.
//!
//! The access model of the site: an auth facade over interchangeable session
//! backends, a route guard, typed record-store repositories and the profile
//! reconciliation job. Every remote collaborator is injected, so the whole
//! slice runs against [`test_util`] fakes as well as a live backend.

pub mod auth;
pub mod client_state;
pub mod config;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod records;
pub mod storage;
pub mod test_util;
pub mod views;

pub use auth::{AuthEvent, AuthFacade, GuardState, RoleRequirement, RouteGuard};
pub use config::Config;
pub use error::{IdentityError, RecordError, SetupError, StorageError};
pub use identity::{HostedIdentity, IdentityProvider};
pub use records::{HostedRecordStore, RecordStore};
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
