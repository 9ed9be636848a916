//! On-disk PKI state.
//!
//! A PKI instance is a directory in the classic CA layout: `private/`,
//! `certs/`, `newcerts/`, `keys/`, `crl/`, `intermediate/` plus the
//! `index.txt` ledger and the `serial` and `crlnumber` counters.

pub mod index;
pub mod layout;
pub mod lock;
pub mod serial;
pub mod store;
