//! Serial number allocation.
//!
//! The `serial` file holds the next serial to hand out as uppercase hex, the
//! same format OpenSSL's `ca` command keeps. The allocator caches the value
//! and only writes it back once a certificate has been durably recorded, so
//! a failed issuance never consumes a serial. The `crlnumber` file uses the
//! same format and is driven by the same type.
//!
//! Callers must hold the instance write lock between [`SerialAllocator::reserve`]
//! and [`SerialAllocator::commit`].

use crate::error::{PkiError, Result};
use crate::storage::layout::write_atomic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// A positive certificate serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber(u128);

impl SerialNumber {
    pub const FIRST: SerialNumber = SerialNumber(1);

    pub fn new(value: u128) -> Self {
        SerialNumber(value)
    }

    pub fn value(self) -> u128 {
        self.0
    }

    /// The following serial, or `None` once the counter is exhausted.
    pub fn next(self) -> Option<SerialNumber> {
        self.0.checked_add(1).map(SerialNumber)
    }

    /// Uppercase hex with an even number of digits, e.g. `01`, `0A`, `01F2`.
    pub fn to_hex(self) -> String {
        hex::encode_upper(self.to_der_bytes())
    }

    /// Parse hex as written by [`SerialNumber::to_hex`] (case-insensitive).
    pub fn from_hex(hex: &str) -> Option<SerialNumber> {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() > 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(SerialNumber)
    }

    /// Minimal big-endian magnitude bytes.
    pub fn to_der_bytes(self) -> Vec<u8> {
        let bytes = self.0.to_be_bytes();
        let first = bytes
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(bytes.len() - 1);
        bytes[first..].to_vec()
    }

    /// Read back a serial from certificate bytes; `None` if wider than 128 bits.
    pub fn from_der_bytes(bytes: &[u8]) -> Option<SerialNumber> {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let significant = &bytes[first..];
        if significant.len() > 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf[16 - significant.len()..].copy_from_slice(significant);
        Some(SerialNumber(u128::from_be_bytes(buf)))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for SerialNumber {
    type Err = PkiError;

    /// Accepts hex, optionally prefixed with `0x`. Zero is not a valid serial.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim();
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits);
        match SerialNumber::from_hex(digits) {
            Some(serial) if serial.0 > 0 => Ok(serial),
            _ => Err(PkiError::ValidationError(format!(
                "invalid serial number '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = PkiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SerialNumber> for String {
    fn from(value: SerialNumber) -> Self {
        value.to_hex()
    }
}

/// Monotonic counter persisted as a hex file.
#[derive(Debug)]
pub struct SerialAllocator {
    path: PathBuf,
    next: SerialNumber,
}

impl SerialAllocator {
    /// Read the counter file.
    ///
    /// A missing, empty, non-hex or zero value is an [`PkiError::AllocationError`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PkiError::AllocationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let next = SerialNumber::from_hex(&contents)
            .filter(|serial| serial.0 > 0)
            .ok_or_else(|| {
                PkiError::AllocationError(format!(
                    "{} does not hold a hex serial: {:?}",
                    path.display(),
                    contents.trim()
                ))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            next,
        })
    }

    /// The value the next [`SerialAllocator::reserve`] without override returns.
    pub fn peek(&self) -> SerialNumber {
        self.next
    }

    /// Pick the serial for a pending certificate without persisting anything.
    ///
    /// An override must not be below the counter, which keeps it greater
    /// than every serial handed out so far.
    pub fn reserve(&self, requested: Option<SerialNumber>) -> Result<SerialNumber> {
        match requested {
            None => Ok(self.next),
            Some(serial) if serial >= self.next => Ok(serial),
            Some(serial) => Err(PkiError::ValidationError(format!(
                "serial {} is not above the last allocated serial (next is {})",
                serial, self.next
            ))),
        }
    }

    /// Durably advance the counter past `used`.
    ///
    /// On failure the cached value is left untouched.
    pub fn commit(&mut self, used: SerialNumber) -> Result<()> {
        let next = used
            .next()
            .ok_or_else(|| PkiError::AllocationError("serial space exhausted".to_string()))?;
        write_atomic(&self.path, format!("{}\n", next).as_bytes()).map_err(|e| {
            PkiError::AllocationError(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), next = %next, "advanced counter");
        self.next = next;
        Ok(())
    }
}
