//! Certificate requests, profiles and signing.
//!
//! Everything here is free of disk I/O: requests are validated and turned
//! into signed PEM, and PEM is parsed back into summaries.

pub mod builder;
pub mod ca;
pub mod crl;
pub mod extensions;
pub mod loader;
pub mod request;
