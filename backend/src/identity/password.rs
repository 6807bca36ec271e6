//! Argon2id password hashing.
//!
//! Hashes are stored as PHC strings (`$argon2id$v=19$m=...`), so verification
//! reads its parameters from the stored hash and keeps working after the
//! configured cost changes.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::error::{ApiError, Result};

pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// Hash checked when the account does not exist, so unknown emails take
    /// as long as wrong passwords.
    decoy_hash: String,
}

impl PasswordHasher {
    /// Hasher with the given memory cost (KiB) and iteration count.
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| ApiError::Internal(format!("invalid argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let decoy_hash = hash_with(&argon2, &uuid::Uuid::new_v4().to_string())?;
        Ok(Self { argon2, decoy_hash })
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        hash_with(&self.argon2, password)
    }

    /// `Ok(false)` on mismatch, `Err` only when the stored hash is malformed.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| ApiError::Internal(format!("invalid password hash: {}", e)))?;
        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// Verify against the decoy hash. Always `false`.
    pub fn verify_decoy(&self, password: &str) -> bool {
        matches!(self.verify(password, &self.decoy_hash), Ok(true))
    }
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {}", e)))
}
