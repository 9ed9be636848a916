//! Passphrase-based key derivation.
//!
//! Keys written by an instance configured with a passphrase are sealed with a
//! symmetric key derived here using Argon2id.

use crate::error::{PkiError, Result};
use argon2::Argon2;
use rand::RngCore;

/// The length of the salt used for key derivation.
pub const SALT_LENGTH: usize = 32;

/// The length of the derived key.
pub const KEY_LENGTH: usize = 32;

/// Generate a random salt for key derivation.
///
/// # Example
///
/// ```
/// use privca::crypto::password::{generate_salt, SALT_LENGTH};
///
/// let salt = generate_salt();
/// assert_eq!(salt.len(), SALT_LENGTH);
/// ```
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit sealing key from a passphrase and salt using Argon2id
/// with default parameters.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LENGTH]> {
    if salt.len() != SALT_LENGTH {
        return Err(PkiError::KeyDerivationError(format!(
            "Salt must be {} bytes, got {}",
            SALT_LENGTH,
            salt.len()
        )));
    }

    let mut output = [0u8; KEY_LENGTH];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|e| PkiError::KeyDerivationError(format!("Argon2 error: {}", e)))?;

    Ok(output)
}
