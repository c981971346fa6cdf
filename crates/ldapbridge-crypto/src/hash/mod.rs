//! Password hashing
//!
//! Hashes are Argon2id PHC strings (`$argon2id$v=19$...`) with a fresh salt
//! per call. Verification goes through the PHC parser, so any other format
//! is rejected.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

pub use argon2::password_hash::Error as HashError;

/// PHC identifier every hash produced here starts with
pub const PASSWORD_SCHEME: &str = "$argon2id$";

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> Result<String, HashError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Check a password against a hash produced by [`hash_password`].
///
/// Malformed hashes never verify.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
