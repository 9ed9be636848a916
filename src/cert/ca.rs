//! Certificate authority signing operations.
//!
//! These functions build and sign certificates. They do not touch disk; the
//! caller allocates the serial beforehand and persists the result afterwards.

use crate::cert::builder::{distinguished_name, set_serial, set_validity, subject_alt_names};
use crate::cert::extensions::{self, extensions_for};
use crate::cert::request::{CertificateConfiguration, CertificateType, Expiration};
use crate::error::{PkiError, Result};
use crate::storage::serial::SerialNumber;
use rcgen::{CertificateParams, Issuer, KeyPair, PublicKeyData};
use std::fmt;
use time::OffsetDateTime;

/// The active root: its certificate and signing key.
pub struct RootMaterial {
    pub certificate_pem: String,
    pub key: KeyPair,
}

impl fmt::Debug for RootMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

/// A freshly signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub serial: SerialNumber,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub pem: String,
}

/// The profile a root request resolves to. Roots are always authorities.
pub fn root_type(request: &CertificateConfiguration) -> Result<CertificateType> {
    match request.certificate_type {
        None => Ok(CertificateType::Authority),
        Some(t) if t.is_authority() => Ok(t),
        Some(t) => Err(PkiError::ValidationError(format!(
            "a root CA cannot have certificate type '{}'",
            t
        ))),
    }
}

/// The profile a leaf request resolves to. Untyped requests are servers.
pub fn leaf_type(request: &CertificateConfiguration) -> CertificateType {
    request.certificate_type.unwrap_or(CertificateType::Server)
}

fn base_params(
    request: &CertificateConfiguration,
    certificate_type: CertificateType,
    serial: SerialNumber,
    not_before: OffsetDateTime,
    default_expiration: Expiration,
) -> Result<(CertificateParams, OffsetDateTime)> {
    let not_after = request
        .expiration
        .unwrap_or(default_expiration)
        .resolve(not_before)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&request.subject);
    params.subject_alt_names = subject_alt_names(&request.san_data)?;
    extensions::apply(&mut params, extensions_for(certificate_type));
    set_validity(&mut params, not_before, not_after);
    set_serial(&mut params, serial);

    Ok((params, not_after))
}

/// Create a self-signed root CA certificate.
///
/// # Arguments
///
/// * `request` - Subject, SANs, validity and (authority) type of the root
/// * `key` - The root key pair; it signs its own certificate
/// * `serial` - Serial allocated for the root
/// * `not_before` - Start of validity
/// * `default_years` - Validity used when the request has no expiration
///
/// # Example
///
/// ```
/// use privca::cert::ca::create_root_certificate;
/// use privca::cert::request::CertificateConfiguration;
/// use privca::crypto::keygen::{generate_key, KeyAlgorithm};
/// use privca::storage::serial::SerialNumber;
///
/// # fn example() -> privca::error::Result<()> {
/// let key = generate_key(KeyAlgorithm::default())?;
/// let request = CertificateConfiguration::new("My Root CA");
/// let now = time::OffsetDateTime::now_utc();
/// let root = create_root_certificate(&request, key.key_pair(), SerialNumber::FIRST, now, 10)?;
/// assert!(root.pem.contains("BEGIN CERTIFICATE"));
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub fn create_root_certificate(
    request: &CertificateConfiguration,
    key: &KeyPair,
    serial: SerialNumber,
    not_before: OffsetDateTime,
    default_years: u32,
) -> Result<SignedCertificate> {
    let certificate_type = root_type(request)?;
    request.validate_for(certificate_type)?;

    let default_expiration = Expiration::Relative {
        years: default_years,
        months: 0,
        days: 0,
    };
    let (params, not_after) =
        base_params(request, certificate_type, serial, not_before, default_expiration)?;

    let certificate = params
        .self_signed(key)
        .map_err(|e| PkiError::SigningError(format!("Failed to create root CA: {}", e)))?;

    Ok(SignedCertificate {
        serial,
        not_before,
        not_after,
        pem: certificate.pem(),
    })
}

/// Sign a certificate for `subject_key` under the active root.
///
/// # Arguments
///
/// * `request` - What to issue; its type defaults to `server`
/// * `subject_key` - Public key being certified, generated or external
/// * `root` - The active root certificate and key
/// * `serial` - Serial allocated for this certificate
/// * `not_before` - Start of validity
/// * `default_days` - Validity used when the request has no expiration
pub fn sign_certificate(
    request: &CertificateConfiguration,
    subject_key: &impl PublicKeyData,
    root: &RootMaterial,
    serial: SerialNumber,
    not_before: OffsetDateTime,
    default_days: u32,
) -> Result<SignedCertificate> {
    let certificate_type = leaf_type(request);
    request.validate_for(certificate_type)?;

    let (mut params, not_after) = base_params(
        request,
        certificate_type,
        serial,
        not_before,
        Expiration::Days(i64::from(default_days)),
    )?;
    params.use_authority_key_identifier_extension = true;

    let issuer = Issuer::from_ca_cert_pem(&root.certificate_pem, &root.key)
        .map_err(|e| PkiError::CorruptState(format!("Unreadable root certificate: {}", e)))?;

    let certificate = params.signed_by(subject_key, &issuer).map_err(|e| {
        PkiError::SigningError(format!("Failed to sign certificate {}: {}", serial, e))
    })?;

    Ok(SignedCertificate {
        serial,
        not_before,
        not_after,
        pem: certificate.pem(),
    })
}
