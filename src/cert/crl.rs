//! Certificate revocation list rendering.

use crate::cert::ca::RootMaterial;
use crate::error::{PkiError, Result};
use crate::storage::index::{EntryStatus, IndexEntry};
use crate::storage::serial::SerialNumber;
use rcgen::{CertificateRevocationListParams, Issuer, KeyIdMethod, RevokedCertParams};
use time::{Duration, OffsetDateTime};

/// Render a CRL listing every revoked entry, signed by the root.
///
/// # Arguments
///
/// * `root` - The active root certificate and key
/// * `entries` - Ledger entries; only revoked ones are listed
/// * `crl_number` - Sequence number of this CRL
/// * `this_update` - Issue time of the CRL
/// * `validity_days` - Distance to `nextUpdate`
pub fn render_crl(
    root: &RootMaterial,
    entries: &[IndexEntry],
    crl_number: SerialNumber,
    this_update: OffsetDateTime,
    validity_days: u32,
) -> Result<String> {
    let revoked_certs = entries
        .iter()
        .filter(|entry| entry.status == EntryStatus::Revoked)
        .filter_map(|entry| {
            entry.revocation.map(|revocation| RevokedCertParams {
                serial_number: rcgen::SerialNumber::from_slice(&entry.serial.to_der_bytes()),
                revocation_time: revocation.revoked_at,
                reason_code: Some(revocation.reason.to_rcgen()),
                invalidity_date: None,
            })
        })
        .collect();

    let params = CertificateRevocationListParams {
        this_update,
        next_update: this_update + Duration::days(i64::from(validity_days)),
        crl_number: rcgen::SerialNumber::from_slice(&crl_number.to_der_bytes()),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::Sha256,
    };

    let issuer = Issuer::from_ca_cert_pem(&root.certificate_pem, &root.key)
        .map_err(|e| PkiError::CorruptState(format!("Unreadable root certificate: {}", e)))?;
    let crl = params
        .signed_by(&issuer)
        .map_err(|e| PkiError::SigningError(format!("Failed to sign CRL: {}", e)))?;

    crl.pem()
        .map_err(|e| PkiError::SigningError(format!("Failed to encode CRL: {}", e)))
}
