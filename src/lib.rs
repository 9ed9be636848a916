//! privca: a private certificate authority
//!
//! This library runs a small CA over an on-disk directory laid out the way
//! OpenSSL's `ca` command expects. It can:
//!
//! - Create a self-signed root CA (RSA or ECDSA keys)
//! - Issue server, client and subordinate CA certificates under that root
//! - Certify caller-held public keys without ever seeing a private key
//! - Revoke certificates and publish a signed CRL
//! - Seal persisted private keys with a passphrase
//!
//! # Architecture
//!
//! `cert` turns requests into signed PEM without touching disk, `storage`
//! owns the directory, ledger and counters, and [`pki::PkiHandle`] ties the
//! two together under one instance-wide lock. All operations return
//! `Result` types; a failed mutation leaves no partial state behind.
//!
//! # Example
//!
//! ```rust,no_run
//! use privca::cert::request::CertificateConfiguration;
//! use privca::config::PkiConfig;
//! use privca::PkiHandle;
//!
//! fn example() -> privca::Result<()> {
//!     let pki = PkiHandle::initialize("./pki", PkiConfig::from_env())?;
//!     let root = pki.create_root_ca(&CertificateConfiguration::new("Example Root"))?;
//!     println!("Root CA serial {}", root.serial);
//!     Ok(())
//! }
//! ```

pub mod cert;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pki;
pub mod storage;

// Re-export commonly used types
pub use error::{PkiError, Result};
pub use pki::PkiHandle;
