//! The `index.txt` issuance ledger.
//!
//! One line per issued certificate, tab separated, in the layout OpenSSL's
//! `ca` command uses:
//!
//! ```text
//! status  expiry  revocation[,reason]  serial  key-path  subject
//! V       360101000000Z                02      keys/02.key.pem  /CN=svc.local
//! R       360101000000Z  250601120000Z,keyCompromise  03  -  /CN=old
//! ```
//!
//! Dates are UTCTime (`YYMMDDHHMMSSZ`) before 2050 and GeneralizedTime
//! (`YYYYMMDDHHMMSSZ`) from 2050 on. A key path of `-` means the private key
//! was never held by this instance.

use crate::cert::request::Subject;
use crate::error::{PkiError, Result};
use crate::storage::serial::SerialNumber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

const GENERALIZED_TIME: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]Z");

/// Status as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Valid,
    Revoked,
}

impl EntryStatus {
    fn code(self) -> &'static str {
        match self {
            EntryStatus::Valid => "V",
            EntryStatus::Revoked => "R",
        }
    }
}

/// Why a certificate was revoked (RFC 5280 CRLReason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    PrivilegeWithdrawn,
}

impl RevocationReason {
    pub const ALL: [RevocationReason; 8] = [
        RevocationReason::Unspecified,
        RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged,
        RevocationReason::Superseded,
        RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold,
        RevocationReason::PrivilegeWithdrawn,
    ];

    fn name(self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CaCompromise => "CACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
            RevocationReason::PrivilegeWithdrawn => "privilegeWithdrawn",
        }
    }

    pub(crate) fn to_rcgen(self) -> rcgen::RevocationReason {
        match self {
            RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
            RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
            RevocationReason::CaCompromise => rcgen::RevocationReason::CaCompromise,
            RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
            RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
            RevocationReason::CessationOfOperation => {
                rcgen::RevocationReason::CessationOfOperation
            }
            RevocationReason::CertificateHold => rcgen::RevocationReason::CertificateHold,
            RevocationReason::PrivilegeWithdrawn => rcgen::RevocationReason::PrivilegeWithdrawn,
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RevocationReason {
    type Err = PkiError;

    /// Case-insensitive; `-` and `_` are ignored so `key-compromise` parses.
    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        RevocationReason::ALL
            .into_iter()
            .find(|reason| reason.name().to_ascii_lowercase() == wanted)
            .ok_or_else(|| {
                PkiError::ValidationError(format!("unknown revocation reason '{}'", s))
            })
    }
}

impl TryFrom<String> for RevocationReason {
    type Error = PkiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RevocationReason> for String {
    fn from(value: RevocationReason) -> Self {
        value.name().to_string()
    }
}

/// Revocation details of a revoked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub revoked_at: OffsetDateTime,
    pub reason: RevocationReason,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub status: EntryStatus,
    pub not_after: OffsetDateTime,
    pub revocation: Option<Revocation>,
    pub serial: SerialNumber,
    /// Key location relative to the instance root, `None` for external keys.
    pub key_path: Option<String>,
    /// Subject in slash form, e.g. `/O=Example/CN=svc.local`.
    pub subject: String,
}

impl IndexEntry {
    pub fn valid(
        serial: SerialNumber,
        not_after: OffsetDateTime,
        key_path: Option<String>,
        subject: &Subject,
    ) -> Self {
        Self {
            status: EntryStatus::Valid,
            not_after,
            revocation: None,
            serial,
            key_path,
            subject: subject_line(subject),
        }
    }

    /// This entry marked revoked.
    pub fn revoked(&self, revoked_at: OffsetDateTime, reason: RevocationReason) -> Self {
        Self {
            status: EntryStatus::Revoked,
            revocation: Some(Revocation { revoked_at, reason }),
            ..self.clone()
        }
    }

    pub fn to_line(&self) -> String {
        let revocation = self
            .revocation
            .map(|r| format!("{},{}", format_time(r.revoked_at), r.reason))
            .unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.status.code(),
            format_time(self.not_after),
            revocation,
            self.serial,
            self.key_path.as_deref().unwrap_or("-"),
            self.subject
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(corrupt(line, "expected 6 tab-separated fields"));
        }

        let status = match fields[0] {
            "V" => EntryStatus::Valid,
            "R" => EntryStatus::Revoked,
            _ => return Err(corrupt(line, "unknown status")),
        };
        let not_after = parse_time(fields[1]).ok_or_else(|| corrupt(line, "bad expiry"))?;

        let revocation = match (status, fields[2]) {
            (EntryStatus::Valid, "") => None,
            (EntryStatus::Revoked, field) if !field.is_empty() => {
                let (date, reason) = field.split_once(',').unwrap_or((field, "unspecified"));
                Some(Revocation {
                    revoked_at: parse_time(date)
                        .ok_or_else(|| corrupt(line, "bad revocation date"))?,
                    reason: reason
                        .parse()
                        .map_err(|_| corrupt(line, "bad revocation reason"))?,
                })
            }
            _ => return Err(corrupt(line, "revocation field does not match status")),
        };

        let serial =
            SerialNumber::from_hex(fields[3]).ok_or_else(|| corrupt(line, "bad serial"))?;
        let key_path = match fields[4] {
            "-" | "unknown" => None,
            path => Some(path.to_string()),
        };

        Ok(Self {
            status,
            not_after,
            revocation,
            serial,
            key_path,
            subject: fields[5].to_string(),
        })
    }
}

fn corrupt(line: &str, what: &str) -> PkiError {
    PkiError::CorruptState(format!("index line {:?}: {}", line, what))
}

/// Render a subject the way OpenSSL writes it into the index.
pub fn subject_line(subject: &Subject) -> String {
    let short_names = ["C", "O", "OU", "L", "ST", "street", "postalCode"];
    let mut line = String::new();
    for (short, (_, values)) in short_names.iter().zip(subject.optional_attributes()) {
        if let Some(value) = values.first() {
            line.push_str(&format!("/{}={}", short, value.trim()));
        }
    }
    line.push_str(&format!("/CN={}", subject.common_name.trim()));
    line
}

/// Ledger time encoding.
pub fn format_time(at: OffsetDateTime) -> String {
    let utc = at.to_offset(time::UtcOffset::UTC);
    let full = utc
        .format(GENERALIZED_TIME)
        .unwrap_or_else(|_| format!("{}", utc.unix_timestamp()));
    if (1950..2050).contains(&utc.year()) {
        full[2..].to_string()
    } else {
        full
    }
}

pub fn parse_time(field: &str) -> Option<OffsetDateTime> {
    let digits = field.strip_suffix('Z')?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (year, rest) = match digits.len() {
        12 => {
            let yy: i32 = digits[..2].parse().ok()?;
            (if yy < 50 { 2000 + yy } else { 1900 + yy }, &digits[2..])
        }
        14 => (digits[..4].parse().ok()?, &digits[4..]),
        _ => return None,
    };
    let two = |at: usize| rest[at..at + 2].parse::<u8>().ok();

    let date = Date::from_calendar_date(year, Month::try_from(two(0)?).ok()?, two(2)?).ok()?;
    let clock = Time::from_hms(two(4)?, two(6)?, two(8)?).ok()?;
    Some(PrimitiveDateTime::new(date, clock).assume_utc())
}

/// In-memory copy of the ledger plus its file.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    entries: Vec<IndexEntry>,
}

impl Index {
    /// Read and parse the whole ledger. Any unparsable line is `CorruptState`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let entries = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(IndexEntry::parse_line)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn find(&self, serial: SerialNumber) -> Option<&IndexEntry> {
        self.entries.iter().find(|entry| entry.serial == serial)
    }

    /// Append one line to the file. Returns the file length before the write
    /// so a failed transaction can truncate back to it.
    ///
    /// The in-memory copy is updated separately by [`Index::push`] once the
    /// enclosing transaction commits.
    pub fn append_line(&self, entry: &IndexEntry) -> io::Result<u64> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let previous_len = file.metadata()?.len();
        writeln!(file, "{}", entry.to_line())?;
        file.sync_all()?;
        Ok(previous_len)
    }

    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    /// Render the whole ledger with one entry replaced.
    pub fn render_with(&self, replacement: &IndexEntry) -> String {
        self.entries
            .iter()
            .map(|entry| {
                if entry.serial == replacement.serial {
                    replacement.to_line()
                } else {
                    entry.to_line()
                }
            })
            .fold(String::new(), |mut out, line| {
                out.push_str(&line);
                out.push('\n');
                out
            })
    }

    /// Swap in a replacement entry after its line was durably rewritten.
    pub fn replace(&mut self, replacement: IndexEntry) {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|entry| entry.serial == replacement.serial)
        {
            *slot = replacement;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn sample_entry() -> IndexEntry {
        let mut subject = Subject::new("svc.local");
        subject.organization = vec!["Example".to_string()];
        IndexEntry::valid(
            SerialNumber::new(2),
            datetime!(2036-01-01 00:00 UTC),
            Some("keys/02.key.pem".to_string()),
            &subject,
        )
    }

    #[test]
    fn test_entry_line_format() {
        let line = sample_entry().to_line();
        assert_eq!(
            line,
            "V\t360101000000Z\t\t02\tkeys/02.key.pem\t/O=Example/CN=svc.local"
        );
        assert_eq!(IndexEntry::parse_line(&line).unwrap(), sample_entry());
    }

    #[test]
    fn test_revoked_entry_line() {
        let revoked = sample_entry().revoked(
            datetime!(2025-06-01 12:00 UTC),
            RevocationReason::KeyCompromise,
        );
        let line = revoked.to_line();
        assert!(line.starts_with("R\t360101000000Z\t250601120000Z,keyCompromise\t02\t"));
        assert_eq!(IndexEntry::parse_line(&line).unwrap(), revoked);
    }

    #[test]
    fn test_far_future_uses_generalized_time() {
        let at = datetime!(2061-03-04 05:06:07 UTC);
        assert_eq!(format_time(at), "20610304050607Z");
        assert_eq!(parse_time("20610304050607Z"), Some(at));
        assert_eq!(parse_time("491231235959Z"), Some(datetime!(2049-12-31 23:59:59 UTC)));
        assert_eq!(parse_time("garbage"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        for line in [
            "V\t360101000000Z\t\t02\t-",
            "X\t360101000000Z\t\t02\t-\t/CN=a",
            "V\tnot-a-date\t\t02\t-\t/CN=a",
            "V\t360101000000Z\t\tZZ\t-\t/CN=a",
            "R\t360101000000Z\t\t02\t-\t/CN=a",
        ] {
            match IndexEntry::parse_line(line) {
                Err(PkiError::CorruptState(_)) => {}
                other => panic!("Expected CorruptState for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_external_key_path_dash() {
        let mut entry = sample_entry();
        entry.key_path = None;
        assert!(entry.to_line().contains("\t02\t-\t"));
        assert_eq!(IndexEntry::parse_line(&entry.to_line()).unwrap().key_path, None);
    }

    #[test]
    fn test_revocation_reason_names() {
        for reason in RevocationReason::ALL {
            assert_eq!(reason.to_string().parse::<RevocationReason>().unwrap(), reason);
        }
        assert_eq!(
            "key-compromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
        assert!("stolen".parse::<RevocationReason>().is_err());
    }

    #[test]
    fn test_index_load_append_and_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, "").unwrap();

        let mut index = Index::load(&path).unwrap();
        assert!(index.entries().is_empty());

        let entry = sample_entry();
        assert_eq!(index.append_line(&entry).unwrap(), 0);
        index.push(entry.clone());

        let reloaded = Index::load(&path).unwrap();
        assert_eq!(reloaded.entries(), &[entry.clone()]);

        let revoked = entry.revoked(datetime!(2025-06-01 12:00 UTC), RevocationReason::Superseded);
        let rendered = index.render_with(&revoked);
        fs::write(&path, rendered).unwrap();
        index.replace(revoked.clone());
        assert_eq!(index.find(SerialNumber::new(2)), Some(&revoked));
        assert_eq!(Index::load(&path).unwrap().entries(), &[revoked]);
    }

    #[test]
    fn test_index_load_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, "this is not an index\n").unwrap();
        assert!(matches!(Index::load(&path), Err(PkiError::CorruptState(_))));
    }
}
