//! Site Common Types
//!
//! Shared types used by both the site client and the backend service.

pub mod identity;
pub mod records;
pub mod role;

pub use identity::{
    error_codes, ErrorBody, IdentityUser, PasswordGrant, RecoverRequest, RefreshGrant, Session,
    SignUpRequest, SignUpResponse, UserMetadata, VerifyKind, VerifyRequest,
};
pub use records::{
    ChangeEvent, ChangeKind, Comment, Direction, NewComment, NewPost, NewProfile, Post, PostPatch,
    RecordQuery, Table, UserProfile,
};
pub use role::Role;
