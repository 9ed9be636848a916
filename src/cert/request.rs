//! The issuance request model.
//!
//! A [`CertificateConfiguration`] describes what a caller wants issued. It is
//! plain data: it serializes to and from JSON so transports can bind it
//! directly, and [`CertificateConfiguration::validate`] performs the checks
//! that do not depend on PKI state.

use crate::crypto::keygen::KeyAlgorithm;
use crate::error::{PkiError, Result};
use crate::storage::serial::SerialNumber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

/// Subject distinguished name.
///
/// Every attribute except the common name is a list to carry multi-valued
/// RDN semantics on the wire. At most one value per attribute is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subject {
    pub common_name: String,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub country: Vec<String>,
    pub province: Vec<String>,
    pub locality: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Named optional attributes, in the order they are encoded.
    pub(crate) fn optional_attributes(&self) -> [(&'static str, &[String]); 7] {
        [
            ("country", &self.country),
            ("organization", &self.organization),
            ("organizational_unit", &self.organizational_unit),
            ("locality", &self.locality),
            ("province", &self.province),
            ("street_address", &self.street_address),
            ("postal_code", &self.postal_code),
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(PkiError::ValidationError(
                "subject common name is required".to_string(),
            ));
        }
        if self.common_name.contains(char::is_control) {
            return Err(PkiError::ValidationError(
                "subject common name contains control characters".to_string(),
            ));
        }
        for (name, values) in self.optional_attributes() {
            if values.len() > 1 {
                return Err(PkiError::ValidationError(format!(
                    "subject {} accepts a single value, got {}",
                    name,
                    values.len()
                )));
            }
            if values
                .iter()
                .any(|v| v.trim().is_empty() || v.contains(char::is_control))
            {
                return Err(PkiError::ValidationError(format!(
                    "subject {} must be non-empty printable text",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Subject alternative names. Every list is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanData {
    /// IP literals, parsed at issuance; any unparsable value fails the request.
    pub ip_addresses: Vec<String>,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub uris: Vec<String>,
}

impl SanData {
    pub fn is_empty(&self) -> bool {
        self.ip_addresses.is_empty()
            && self.dns_names.is_empty()
            && self.email_addresses.is_empty()
            && self.uris.is_empty()
    }
}

/// When a certificate stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiration {
    /// An absolute not-after instant.
    NotAfter(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// A calendar offset from issuance time.
    Relative { years: u32, months: u32, days: u32 },
    /// A whole number of days from issuance time. Must be positive.
    Days(i64),
}

impl Expiration {
    /// Compute the not-after instant for a certificate valid from `not_before`.
    ///
    /// Certificates carry whole seconds in UTC, so an absolute instant is
    /// truncated to match what gets encoded.
    pub fn resolve(&self, not_before: OffsetDateTime) -> Result<OffsetDateTime> {
        let not_after = match *self {
            Expiration::NotAfter(at) => at
                .to_offset(UtcOffset::UTC)
                .replace_nanosecond(0)
                .map_err(|e| PkiError::ValidationError(e.to_string()))?,
            Expiration::Days(days) => {
                if days <= 0 {
                    return Err(PkiError::ValidationError(format!(
                        "validity days must be positive, got {}",
                        days
                    )));
                }
                not_before
                    .checked_add(Duration::days(days))
                    .ok_or_else(|| out_of_range(days))?
            }
            Expiration::Relative {
                years,
                months,
                days,
            } => add_calendar_offset(not_before, years, months, days)?,
        };

        if not_after <= not_before {
            return Err(PkiError::ValidationError(
                "expiration must lie after the start of validity".to_string(),
            ));
        }
        Ok(not_after)
    }
}

fn out_of_range(value: impl fmt::Display) -> PkiError {
    PkiError::ValidationError(format!("expiration offset {} is out of range", value))
}

/// Shift by years and months on the calendar, clamping the day to the end
/// of the target month, then add whole days.
fn add_calendar_offset(
    start: OffsetDateTime,
    years: u32,
    months: u32,
    days: u32,
) -> Result<OffsetDateTime> {
    let month_index =
        i64::from(start.month() as u8) - 1 + i64::from(months) + 12 * i64::from(years);
    let year = i32::try_from(i64::from(start.year()) + month_index.div_euclid(12))
        .map_err(|_| out_of_range(format!("{}y{}m", years, months)))?;
    let month = time::Month::try_from((month_index.rem_euclid(12) + 1) as u8)
        .map_err(|e| PkiError::ValidationError(e.to_string()))?;
    let day = start.day().min(month.length(year));

    let date = Date::from_calendar_date(year, month, day)
        .map_err(|_| out_of_range(format!("{}y{}m", years, months)))?;
    start
        .replace_date(date)
        .checked_add(Duration::days(i64::from(days)))
        .ok_or_else(|| out_of_range(format!("{}d", days)))
}

/// Certificate profile requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateType {
    Server,
    Client,
    /// A CA that may sign further CAs.
    Authority,
    /// A CA restricted to signing end-entity certificates.
    AuthorityNoSubs,
}

impl CertificateType {
    pub fn is_authority(self) -> bool {
        matches!(
            self,
            CertificateType::Authority | CertificateType::AuthorityNoSubs
        )
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateType::Server => "server",
            CertificateType::Client => "client",
            CertificateType::Authority => "authority",
            CertificateType::AuthorityNoSubs => "authority-no-subs",
        };
        f.write_str(name)
    }
}

impl FromStr for CertificateType {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(CertificateType::Server),
            "client" => Ok(CertificateType::Client),
            "authority" => Ok(CertificateType::Authority),
            "authority-no-subs" => Ok(CertificateType::AuthorityNoSubs),
            other => Err(PkiError::ValidationError(format!(
                "unknown certificate type '{}', expected server|client|authority|authority-no-subs",
                other
            ))),
        }
    }
}

/// A caller-held public key to certify instead of a generated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalKey {
    /// SubjectPublicKeyInfo in PEM (`PUBLIC KEY`).
    pub public_key_pem: String,
    pub algorithm: KeyAlgorithm,
}

/// Where the subject key pair comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Generate a fresh key pair, optionally overriding the configured algorithm.
    #[default]
    Generated,
    GeneratedWith(KeyAlgorithm),
    /// Certify a caller-supplied public key; no private key is produced.
    External(ExternalKey),
}

/// What a caller wants issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfiguration {
    pub subject: Subject,
    pub san_data: SanData,
    pub expiration: Option<Expiration>,
    pub certificate_type: Option<CertificateType>,
    pub key_source: KeySource,
    pub serial_number: Option<SerialNumber>,
}

impl CertificateConfiguration {
    /// A request for `common_name` with every other field defaulted.
    ///
    /// # Example
    ///
    /// ```
    /// use privca::cert::request::{CertificateConfiguration, CertificateType};
    ///
    /// let request = CertificateConfiguration::new("svc.local")
    ///     .with_type(CertificateType::Server)
    ///     .with_dns_names(["svc.local"])
    ///     .with_valid_days(90);
    /// assert!(request.validate().is_ok());
    /// ```
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            subject: Subject::new(common_name),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, certificate_type: CertificateType) -> Self {
        self.certificate_type = Some(certificate_type);
        self
    }

    pub fn with_dns_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.san_data.dns_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_ip_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.san_data
            .ip_addresses
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn with_valid_days(mut self, days: i64) -> Self {
        self.expiration = Some(Expiration::Days(days));
        self
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_key_source(mut self, key_source: KeySource) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn with_serial_number(mut self, serial: SerialNumber) -> Self {
        self.serial_number = Some(serial);
        self
    }

    /// Validate as a leaf request; an untyped request is a server request.
    pub fn validate(&self) -> Result<()> {
        self.validate_for(self.certificate_type.unwrap_or(CertificateType::Server))
    }

    /// Checks that need no PKI state: subject, SAN syntax, expiration sanity,
    /// and the server requirement of at least one DNS name or IP.
    pub fn validate_for(&self, certificate_type: CertificateType) -> Result<()> {
        self.subject.validate()?;
        crate::cert::builder::subject_alt_names(&self.san_data)?;

        if let Some(Expiration::Days(days)) = self.expiration {
            if days <= 0 {
                return Err(PkiError::ValidationError(format!(
                    "validity days must be positive, got {}",
                    days
                )));
            }
        }
        if let Some(Expiration::Relative {
            years: 0,
            months: 0,
            days: 0,
        }) = self.expiration
        {
            return Err(PkiError::ValidationError(
                "relative expiration must not be zero".to_string(),
            ));
        }

        if certificate_type == CertificateType::Server
            && self.san_data.dns_names.is_empty()
            && self.san_data.ip_addresses.is_empty()
        {
            return Err(PkiError::ValidationError(
                "server certificates require at least one DNS name or IP address".to_string(),
            ));
        }

        if let KeySource::GeneratedWith(algorithm) = &self.key_source {
            algorithm.check_supported()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_validate_requires_common_name() {
        let request = CertificateConfiguration::new("  ");
        match request.validate() {
            Err(PkiError::ValidationError(msg)) => assert!(msg.contains("common name")),
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_multi_valued_attribute() {
        let mut request = CertificateConfiguration::new("Test Root");
        request.subject.organization = vec!["A".to_string(), "B".to_string()];
        assert!(matches!(
            request.validate(),
            Err(PkiError::ValidationError(_))
        ));
    }

    #[test]
    fn test_server_requires_dns_or_ip() {
        let request = CertificateConfiguration::new("svc.local").with_type(CertificateType::Server);
        assert!(matches!(
            request.validate(),
            Err(PkiError::ValidationError(_))
        ));

        let with_ip = request.clone().with_ip_addresses(["10.0.0.1"]);
        assert!(with_ip.validate().is_ok());
    }

    #[test]
    fn test_untyped_request_validates_as_server() {
        let request = CertificateConfiguration::new("svc.local");
        assert!(request.validate().is_err());
        assert!(request.validate_for(CertificateType::Authority).is_ok());
    }

    #[test]
    fn test_control_characters_rejected() {
        let request = CertificateConfiguration::new("evil\tname").with_type(CertificateType::Client);
        assert!(matches!(
            request.validate(),
            Err(PkiError::ValidationError(_))
        ));
    }

    #[test]
    fn test_client_needs_no_san() {
        let request = CertificateConfiguration::new("alice").with_type(CertificateType::Client);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_invalid_ip_fails_whole_request() {
        let request = CertificateConfiguration::new("svc")
            .with_type(CertificateType::Server)
            .with_dns_names(["svc.local"])
            .with_ip_addresses(["10.0.0.1", "not-an-ip"]);
        match request.validate() {
            Err(PkiError::InvalidSan(msg)) => assert!(msg.contains("not-an-ip")),
            other => panic!("Expected InvalidSan, got {:?}", other),
        }
    }

    #[test]
    fn test_non_positive_days_rejected() {
        for days in [0, -1] {
            let request = CertificateConfiguration::new("alice")
                .with_type(CertificateType::Client)
                .with_valid_days(days);
            assert!(matches!(
                request.validate(),
                Err(PkiError::ValidationError(_))
            ));
        }
    }

    #[test]
    fn test_expiration_days() {
        let start = datetime!(2025-01-01 00:00 UTC);
        let end = Expiration::Days(90).resolve(start).unwrap();
        assert_eq!(end - start, Duration::days(90));
    }

    #[test]
    fn test_expiration_relative_clamps_month_end() {
        let start = datetime!(2024-01-31 12:00 UTC);
        let end = Expiration::Relative {
            years: 0,
            months: 1,
            days: 0,
        }
        .resolve(start)
        .unwrap();
        assert_eq!(end, datetime!(2024-02-29 12:00 UTC));

        let end = Expiration::Relative {
            years: 1,
            months: 13,
            days: 2,
        }
        .resolve(start)
        .unwrap();
        assert_eq!(end, datetime!(2026-03-02 12:00 UTC));
    }

    #[test]
    fn test_expiration_not_after_in_past() {
        let start = datetime!(2025-06-01 00:00 UTC);
        let result = Expiration::NotAfter(datetime!(2025-05-01 00:00 UTC)).resolve(start);
        assert!(matches!(result, Err(PkiError::ValidationError(_))));
    }

    #[test]
    fn test_expiration_not_after_truncated_to_utc_seconds() {
        let start = datetime!(2025-06-01 00:00 UTC);
        let at = datetime!(2025-07-01 14:30:15.809607436 +02:00);
        let end = Expiration::NotAfter(at).resolve(start).unwrap();
        assert_eq!(end, datetime!(2025-07-01 12:30:15 UTC));
        assert_eq!(end.nanosecond(), 0);
        assert_eq!(end.offset(), UtcOffset::UTC);
    }

    #[test]
    fn test_certificate_type_parse_and_display() {
        for name in ["server", "client", "authority", "authority-no-subs"] {
            let parsed: CertificateType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("intermediate".parse::<CertificateType>().is_err());
        assert!(CertificateType::AuthorityNoSubs.is_authority());
        assert!(!CertificateType::Client.is_authority());
    }

    #[test]
    fn test_configuration_from_json() {
        let json = r#"{
            "subject": {"common_name": "svc.local", "organization": ["Example"]},
            "san_data": {"dns_names": ["svc.local"], "ip_addresses": ["127.0.0.1"]},
            "expiration": {"relative": {"years": 1, "months": 0, "days": 0}},
            "certificate_type": "server"
        }"#;
        let request: CertificateConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(request.subject.common_name, "svc.local");
        assert_eq!(request.certificate_type, Some(CertificateType::Server));
        assert_eq!(request.key_source, KeySource::Generated);
        assert!(request.validate().is_ok());
    }
}
