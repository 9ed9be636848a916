//! Key pair generation for roots and leaves.
//!
//! ECDSA keys are generated directly by rcgen. RSA keys are generated with the
//! `rsa` crate, serialized to PKCS#8 and loaded into rcgen for signing.

use crate::error::{PkiError, Result};
use rcgen::{KeyPair, SignatureAlgorithm};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Smallest RSA modulus the engine will generate or accept.
pub const MIN_RSA_BITS: usize = 2048;

/// RSA modulus used for roots when no size is requested.
pub const DEFAULT_ROOT_RSA_BITS: usize = 4096;

/// RSA modulus used for leaves when no size is requested.
pub const DEFAULT_LEAF_RSA_BITS: usize = 2048;

/// NIST curves supported for ECDSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    /// Length of an uncompressed SEC1 point on this curve.
    pub fn uncompressed_point_len(self) -> usize {
        match self {
            EcCurve::P256 => 65,
            EcCurve::P384 => 97,
            EcCurve::P521 => 133,
        }
    }
}

/// Asymmetric key algorithm with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyAlgorithm {
    /// RSA with the given modulus size in bits. `None` takes the default
    /// size for the key's role, see [`KeyAlgorithm::resolved`].
    Rsa { bits: Option<usize> },
    /// ECDSA over a NIST curve.
    Ecdsa(EcCurve),
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Ecdsa(EcCurve::P256)
    }
}

impl KeyAlgorithm {
    /// The rcgen signature algorithm used when this key signs.
    pub fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::Rsa { .. } => &rcgen::PKCS_RSA_SHA256,
            KeyAlgorithm::Ecdsa(EcCurve::P256) => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::Ecdsa(EcCurve::P384) => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ecdsa(EcCurve::P521) => &rcgen::PKCS_ECDSA_P521_SHA512,
        }
    }

    /// Reject parameter combinations the generator will not produce.
    pub fn check_supported(&self) -> Result<()> {
        match self {
            KeyAlgorithm::Rsa { bits: Some(bits) } if *bits < MIN_RSA_BITS => {
                Err(PkiError::UnsupportedAlgorithm(format!(
                    "RSA keys must be at least {} bits, got {}",
                    MIN_RSA_BITS, bits
                )))
            }
            KeyAlgorithm::Rsa { bits: Some(bits) } if *bits > 8192 || bits % 8 != 0 => Err(
                PkiError::UnsupportedAlgorithm(format!("unsupported RSA key size {}", bits)),
            ),
            _ => Ok(()),
        }
    }
}

impl KeyAlgorithm {
    /// Fill in an unsized RSA request with `default_bits`.
    ///
    /// Roots resolve with [`DEFAULT_ROOT_RSA_BITS`]; [`generate_key`]
    /// resolves anything left with [`DEFAULT_LEAF_RSA_BITS`].
    pub fn resolved(self, default_bits: usize) -> Self {
        match self {
            KeyAlgorithm::Rsa { bits: None } => KeyAlgorithm::Rsa {
                bits: Some(default_bits),
            },
            other => other,
        }
    }

    /// Whether a key of algorithm `actual` satisfies this declaration.
    /// An unsized RSA declaration accepts any RSA key.
    pub fn accepts(&self, actual: KeyAlgorithm) -> bool {
        match (self, actual) {
            (KeyAlgorithm::Rsa { bits: None }, KeyAlgorithm::Rsa { .. }) => true,
            (declared, actual) => *declared == actual,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits: None } => write!(f, "rsa"),
            KeyAlgorithm::Rsa { bits: Some(bits) } => write!(f, "rsa:{}", bits),
            KeyAlgorithm::Ecdsa(EcCurve::P256) => write!(f, "p256"),
            KeyAlgorithm::Ecdsa(EcCurve::P384) => write!(f, "p384"),
            KeyAlgorithm::Ecdsa(EcCurve::P521) => write!(f, "p521"),
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = PkiError;

    /// Accepts `rsa`, `rsa:<bits>`, `ecdsa`, `p256`, `p384`, `p521`
    /// (case-insensitive, `ecdsa-` prefix and `-` inside curve names allowed).
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "");
        let curve_name = normalized
            .strip_prefix("ecdsa")
            .map(|rest| rest.trim_start_matches(':'))
            .unwrap_or(&normalized);

        match curve_name {
            "" | "p256" | "prime256v1" | "secp256r1" => return Ok(KeyAlgorithm::Ecdsa(EcCurve::P256)),
            "p384" | "secp384r1" => return Ok(KeyAlgorithm::Ecdsa(EcCurve::P384)),
            "p521" | "secp521r1" => return Ok(KeyAlgorithm::Ecdsa(EcCurve::P521)),
            _ => {}
        }

        if normalized == "rsa" {
            return Ok(KeyAlgorithm::Rsa { bits: None });
        }
        if let Some(bits) = normalized.strip_prefix("rsa:") {
            let bits = bits.parse::<usize>().map_err(|_| {
                PkiError::UnsupportedAlgorithm(format!("invalid RSA key size: {}", bits))
            })?;
            return Ok(KeyAlgorithm::Rsa { bits: Some(bits) });
        }

        Err(PkiError::UnsupportedAlgorithm(format!(
            "unknown key algorithm: {}",
            s
        )))
    }
}

impl TryFrom<String> for KeyAlgorithm {
    type Error = PkiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyAlgorithm> for String {
    fn from(value: KeyAlgorithm) -> Self {
        value.to_string()
    }
}

/// A freshly generated key pair.
pub struct GeneratedKey {
    algorithm: KeyAlgorithm,
    key_pair: KeyPair,
}

impl GeneratedKey {
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// PKCS#8 PEM of the private key.
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// SubjectPublicKeyInfo PEM of the public half.
    pub fn public_key_pem(&self) -> String {
        self.key_pair.public_key_pem()
    }
}

impl fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Generate a new key pair from the OS random source.
///
/// An unsized RSA request gets [`DEFAULT_LEAF_RSA_BITS`].
///
/// # Example
///
/// ```
/// use privca::crypto::keygen::{generate_key, EcCurve, KeyAlgorithm};
///
/// let key = generate_key(KeyAlgorithm::Ecdsa(EcCurve::P256)).unwrap();
/// assert!(key.private_key_pem().contains("BEGIN PRIVATE KEY"));
/// ```
pub fn generate_key(algorithm: KeyAlgorithm) -> Result<GeneratedKey> {
    let algorithm = algorithm.resolved(DEFAULT_LEAF_RSA_BITS);
    algorithm.check_supported()?;

    let key_pair = match algorithm {
        KeyAlgorithm::Ecdsa(_) => KeyPair::generate_for(algorithm.signature_algorithm())
            .map_err(|e| PkiError::SigningError(format!("key generation failed: {}", e)))?,
        KeyAlgorithm::Rsa { bits } => generate_rsa(bits.unwrap_or(DEFAULT_LEAF_RSA_BITS))?,
    };

    debug!(algorithm = %algorithm, "generated key pair");
    Ok(GeneratedKey {
        algorithm,
        key_pair,
    })
}

fn generate_rsa(bits: usize) -> Result<KeyPair> {
    let private_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| PkiError::SigningError(format!("RSA key generation failed: {}", e)))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::SigningError(format!("RSA key encoding failed: {}", e)))?;

    KeyPair::from_pem(&pem)
        .map_err(|e| PkiError::SigningError(format!("RSA key rejected by signer: {}", e)))
}

/// Load a persisted PKCS#8 PEM private key for signing.
pub fn load_key_pair(pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(pem)
        .map_err(|e| PkiError::CorruptState(format!("unreadable private key: {}", e)))
}
