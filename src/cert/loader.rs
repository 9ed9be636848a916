//! Reading certificates and public keys back from PEM.
//!
//! Issued certificates are stored as PEM. This module extracts the DER with
//! `rustls-pemfile`, parses it with `x509-parser`, and turns caller-supplied
//! public keys into something rcgen can certify.

use crate::cert::request::ExternalKey;
use crate::crypto::keygen::{EcCurve, KeyAlgorithm};
use crate::error::{PkiError, Result};
use crate::storage::serial::SerialNumber;
use rustls_pemfile::Item;
use std::io::Cursor;
use time::OffsetDateTime;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

/// Fields of a parsed certificate needed for summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub serial: SerialNumber,
    pub subject: String,
    pub issuer: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
}

/// Extract the DER bytes of the first certificate in a PEM string.
///
/// # Example
///
/// ```rust,no_run
/// use privca::cert::loader::load_certificate_der;
///
/// # fn example() -> privca::error::Result<()> {
/// let pem = std::fs::read_to_string("certs/01.pem")?;
/// let der = load_certificate_der(&pem)?;
/// # Ok(())
/// # }
/// ```
pub fn load_certificate_der(pem_str: &str) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(pem_str.as_bytes());

    loop {
        match rustls_pemfile::read_one(&mut cursor)
            .map_err(|e| PkiError::CorruptState(format!("Failed to read PEM: {}", e)))?
        {
            Some(Item::X509Certificate(cert_der)) => return Ok(cert_der.to_vec()),
            Some(_) => continue,
            None => {
                return Err(PkiError::CorruptState(
                    "PEM does not contain a certificate".to_string(),
                ))
            }
        }
    }
}

/// Parse the summary fields of a PEM certificate.
pub fn certificate_info(pem_str: &str) -> Result<CertificateInfo> {
    let der = load_certificate_der(pem_str)?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| PkiError::CorruptState(format!("Failed to parse certificate: {}", e)))?;

    let serial = SerialNumber::from_der_bytes(cert.raw_serial()).ok_or_else(|| {
        PkiError::CorruptState("certificate serial wider than 128 bits".to_string())
    })?;
    let validity = cert.validity();

    Ok(CertificateInfo {
        serial,
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
        is_ca: cert.is_ca(),
    })
}

fn timestamp(seconds: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| PkiError::CorruptState(format!("certificate time out of range: {}", e)))
}

/// Turn a caller-supplied public key into an rcgen SPKI, checking that it
/// really is the declared algorithm.
pub fn load_external_key(external: &ExternalKey) -> Result<rcgen::SubjectPublicKeyInfo> {
    external.algorithm.check_supported()?;

    let block = pem::parse(external.public_key_pem.trim())
        .map_err(|e| PkiError::ValidationError(format!("Invalid public key PEM: {}", e)))?;
    if block.tag() != "PUBLIC KEY" {
        return Err(PkiError::ValidationError(format!(
            "Expected a PUBLIC KEY block, got {}",
            block.tag()
        )));
    }
    let der = block.contents();

    let actual = public_key_algorithm(der)?;
    if !external.algorithm.accepts(actual) {
        return Err(PkiError::ValidationError(format!(
            "Public key is {} but {} was declared",
            actual, external.algorithm
        )));
    }

    rcgen::SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| PkiError::ValidationError(format!("Unusable public key: {}", e)))
}

/// Identify the algorithm of a DER SubjectPublicKeyInfo.
fn public_key_algorithm(der: &[u8]) -> Result<KeyAlgorithm> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| PkiError::ValidationError(format!("Invalid public key: {}", e)))?;
    let parsed = spki
        .parsed()
        .map_err(|e| PkiError::ValidationError(format!("Invalid public key: {}", e)))?;

    match parsed {
        PublicKey::RSA(rsa) => Ok(KeyAlgorithm::Rsa {
            bits: Some(rsa.key_size()),
        }),
        PublicKey::EC(point) => [EcCurve::P256, EcCurve::P384, EcCurve::P521]
            .into_iter()
            .find(|curve| curve.uncompressed_point_len() == point.data().len())
            .map(KeyAlgorithm::Ecdsa)
            .ok_or_else(|| {
                PkiError::UnsupportedAlgorithm("EC public key on an unsupported curve".to_string())
            }),
        _ => Err(PkiError::UnsupportedAlgorithm(
            "public key is neither RSA nor ECDSA".to_string(),
        )),
    }
}
