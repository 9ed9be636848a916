//! Certificate builder utilities.
//!
//! Translates the request model into rcgen certificate parameters: subject
//! name, subject alternative names, validity window and serial number.

use crate::cert::request::{SanData, Subject};
use crate::error::{PkiError, Result};
use crate::storage::serial::SerialNumber;
use rcgen::string::Ia5String;
use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
use std::net::IpAddr;
use time::OffsetDateTime;

/// id-at-streetAddress (2.5.4.9)
const OID_STREET_ADDRESS: [u64; 4] = [2, 5, 4, 9];

/// id-at-postalCode (2.5.4.17)
const OID_POSTAL_CODE: [u64; 4] = [2, 5, 4, 17];

/// Build a DistinguishedName from a validated subject.
///
/// # Example
///
/// ```
/// use privca::cert::builder::distinguished_name;
/// use privca::cert::request::Subject;
///
/// let mut subject = Subject::new("example.com");
/// subject.organization = vec!["Example Org".to_string()];
/// let dn = distinguished_name(&subject);
/// assert_eq!(dn.iter().count(), 2);
/// ```
pub fn distinguished_name(subject: &Subject) -> DistinguishedName {
    let mut dn = DistinguishedName::new();

    for (name, values) in subject.optional_attributes() {
        let dn_type = match name {
            "country" => DnType::CountryName,
            "organization" => DnType::OrganizationName,
            "organizational_unit" => DnType::OrganizationalUnitName,
            "locality" => DnType::LocalityName,
            "province" => DnType::StateOrProvinceName,
            "street_address" => DnType::CustomDnType(OID_STREET_ADDRESS.to_vec()),
            _ => DnType::CustomDnType(OID_POSTAL_CODE.to_vec()),
        };
        if let Some(value) = values.first() {
            dn.push(dn_type, value.trim());
        }
    }
    dn.push(DnType::CommonName, subject.common_name.trim());

    dn
}

/// Parse SAN data into rcgen entries.
///
/// Every value must parse; a single bad entry fails the whole request with
/// [`PkiError::InvalidSan`] rather than being dropped.
pub fn subject_alt_names(san: &SanData) -> Result<Vec<SanType>> {
    let mut entries = Vec::with_capacity(
        san.dns_names.len() + san.ip_addresses.len() + san.email_addresses.len() + san.uris.len(),
    );

    for name in &san.dns_names {
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(PkiError::InvalidSan(format!("invalid DNS name '{}'", name)));
        }
        entries.push(SanType::DnsName(ia5(name, "DNS name")?));
    }

    for ip in &san.ip_addresses {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| PkiError::InvalidSan(format!("invalid IP address '{}'", ip)))?;
        entries.push(SanType::IpAddress(addr));
    }

    for email in &san.email_addresses {
        let email = email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                entries.push(SanType::Rfc822Name(ia5(email, "email address")?));
            }
            _ => {
                return Err(PkiError::InvalidSan(format!(
                    "invalid email address '{}'",
                    email
                )))
            }
        }
    }

    for uri in &san.uris {
        let uri = uri.trim();
        match uri.split_once(':') {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
                entries.push(SanType::URI(ia5(uri, "URI")?));
            }
            _ => return Err(PkiError::InvalidSan(format!("invalid URI '{}'", uri))),
        }
    }

    Ok(entries)
}

fn ia5(value: &str, kind: &str) -> Result<Ia5String> {
    Ia5String::try_from(value)
        .map_err(|_| PkiError::InvalidSan(format!("{} '{}' is not ASCII", kind, value)))
}

/// Set the validity window of a certificate.
pub fn set_validity(
    params: &mut CertificateParams,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) {
    params.not_before = not_before;
    params.not_after = not_after;
}

/// Set the serial number of a certificate.
pub fn set_serial(params: &mut CertificateParams, serial: SerialNumber) {
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial.to_der_bytes()));
}

/// Current time truncated to whole seconds, the resolution X.509 encodes.
pub fn issuance_time() -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
        .map_err(|e| PkiError::SigningError(format!("system clock out of range: {}", e)))
}
