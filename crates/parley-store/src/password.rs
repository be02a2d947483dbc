//! Password hashing.
//!
//! Argon2id with per-hash random salts via the PHC string format. The
//! store never sees plaintext beyond these two functions, and login timing
//! does not reveal whether a username exists: unknown users burn a
//! verification against a throwaway hash.

use crate::error::StoreError;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use std::sync::OnceLock;

/// Hash a plaintext password into a PHC string.
///
/// # Errors
///
/// Returns [`StoreError::PasswordHash`] if the hasher fails.
pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::PasswordHash(e.to_string()))
}

/// Verify a plaintext password against a stored PHC string.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Burn a verification so unknown-user logins cost the same as
/// wrong-password logins.
pub fn dummy_verify(password: &str) {
    static DUMMY: OnceLock<String> = OnceLock::new();
    let hash = DUMMY.get_or_init(|| {
        hash_password("parley-dummy-password").expect("argon2 hashing cannot fail at startup")
    });
    let _ = verify_password(password, hash);
}
