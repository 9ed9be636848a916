//! Cryptographic operations module.
//!
//! This module provides the key material primitives used by the CA:
//!
//! - RSA and ECDSA key pair generation
//! - Passphrase-based key derivation using Argon2
//! - At-rest sealing of private keys with AES-256-GCM
//!
//! # Example
//!
//! ```rust
//! use privca::crypto::encryption::{open_private_key, seal_private_key};
//! use privca::crypto::keygen::{generate_key, KeyAlgorithm};
//!
//! # fn example() -> privca::error::Result<()> {
//! let key = generate_key(KeyAlgorithm::default())?;
//!
//! let sealed = seal_private_key(&key.private_key_pem(), "secure-passphrase")?;
//! let opened = open_private_key(&sealed, "secure-passphrase")?;
//! assert_eq!(opened, key.private_key_pem());
//! # Ok(())
//! # }
//! ```

pub mod encryption;
pub mod keygen;
pub mod password;
