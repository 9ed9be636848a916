//! The PKI instance façade.
//!
//! [`PkiHandle`] is what a transport layer talks to. Each public method is
//! one atomic operation: it either completes, with certificate, ledger and
//! counter all durably updated, or fails with none of them changed.
//!
//! Key generation happens before the instance lock is taken; everything
//! that reads or advances the serial runs under the write lock and the
//! exclusive directory lock, on state re-read from disk.
//!
//! # Example
//!
//! ```rust,no_run
//! use privca::cert::request::{CertificateConfiguration, CertificateType};
//! use privca::config::PkiConfig;
//! use privca::pki::PkiHandle;
//!
//! # fn example() -> privca::error::Result<()> {
//! let pki = PkiHandle::initialize("/var/lib/privca", PkiConfig::default())?;
//! pki.create_root_ca(&CertificateConfiguration::new("Example Root"))?;
//!
//! let request = CertificateConfiguration::new("svc.local")
//!     .with_type(CertificateType::Server)
//!     .with_dns_names(["svc.local"])
//!     .with_valid_days(90);
//! let issued = pki.issue_certificate(&request)?;
//! println!("{}", issued.certificate_pem);
//! # Ok(())
//! # }
//! ```

use crate::cert::builder::issuance_time;
use crate::cert::ca::{create_root_certificate, leaf_type, root_type, sign_certificate};
use crate::cert::crl::render_crl;
use crate::cert::loader::{certificate_info, load_external_key};
use crate::cert::request::{CertificateConfiguration, KeySource};
use crate::config::PkiConfig;
use crate::crypto::keygen::{generate_key, GeneratedKey, KeyAlgorithm, DEFAULT_ROOT_RSA_BITS};
use crate::error::{PkiError, Result};
use crate::storage::index::{EntryStatus, IndexEntry, RevocationReason};
use crate::storage::layout::Layout;
use crate::storage::serial::SerialNumber;
use crate::storage::store::{open_shared, Issuance, PkiStore, RecordKind, SharedStore};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

/// Status of an issued certificate as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Valid,
    Revoked,
    /// Recorded valid but past its not-after.
    Expired,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateStatus::Valid => write!(f, "valid"),
            CertificateStatus::Revoked => write!(f, "revoked"),
            CertificateStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Summary of one ledger entry together with its certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedCertificate {
    pub serial: SerialNumber,
    pub subject_name: String,
    pub issuer_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub status: CertificateStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub revocation_reason: Option<RevocationReason>,
    pub is_ca: bool,
    pub pem_certificate: String,
    /// Where the private key lives; `None` when the caller holds it.
    pub raw_key_path: Option<PathBuf>,
}

/// Result of creating the root.
pub struct RootCa {
    pub serial: SerialNumber,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for RootCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCa")
            .field("serial", &self.serial)
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

/// Result of issuing a certificate.
pub struct IssuedBundle {
    pub serial: SerialNumber,
    pub certificate_pem: String,
    /// Absent when an external key was certified.
    pub private_key_pem: Option<String>,
}

impl fmt::Debug for IssuedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedBundle")
            .field("serial", &self.serial)
            .field("certificate_pem", &self.certificate_pem)
            .field("has_private_key", &self.private_key_pem.is_some())
            .finish()
    }
}

enum SubjectKey {
    Generated(GeneratedKey),
    External(rcgen::SubjectPublicKeyInfo),
}

/// Handle on one PKI instance directory.
///
/// Handles are cheap to clone. All handles on the same directory in one
/// process share one lock; processes coordinate through the directory lock.
#[derive(Clone)]
pub struct PkiHandle {
    root: PathBuf,
    config: PkiConfig,
    store: Arc<SharedStore>,
}

impl fmt::Debug for PkiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkiHandle")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PkiHandle {
    /// Create the directory layout if needed and open the instance.
    ///
    /// Idempotent: existing `serial`, `crlnumber` and `index.txt` are kept.
    #[instrument(skip(path, config), fields(path = %path.as_ref().display()))]
    pub fn initialize(path: impl AsRef<Path>, config: PkiConfig) -> Result<Self> {
        config.validate()?;
        let store = open_shared(path.as_ref())?;
        let root = store.read(config.lock_timeout())?.layout().root().to_path_buf();

        info!(root = %root.display(), "PKI instance ready");
        Ok(Self {
            root,
            config,
            store,
        })
    }

    /// Canonical instance directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &PkiConfig {
        &self.config
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.root.clone())
    }

    fn passphrase(&self) -> Option<&str> {
        self.config.key_passphrase.as_deref()
    }

    /// Create the self-signed root CA.
    ///
    /// Rejected with `AlreadyExistsError` while a root is active.
    #[instrument(skip(self, request), fields(common_name = %request.subject.common_name))]
    pub fn create_root_ca(&self, request: &CertificateConfiguration) -> Result<RootCa> {
        let certificate_type = root_type(request)?;
        request.validate_for(certificate_type)?;
        let algorithm = self.root_algorithm(request)?;
        let key = generate_key(algorithm)?;

        let mut store = self.store.write(self.config.lock_timeout())?;
        let _held = store.lock_for_mutation(self.config.lock_timeout())?;
        if store.has_root() {
            return Err(PkiError::AlreadyExistsError(format!(
                "a root CA already exists in {}",
                self.root.display()
            )));
        }

        let serial = store.serials().reserve(request.serial_number)?;
        let signed = create_root_certificate(
            request,
            key.key_pair(),
            serial,
            issuance_time()?,
            self.config.root_validity_years,
        )?;
        let private_key_pem = key.private_key_pem();

        store.record_issuance(Issuance {
            kind: RecordKind::Root,
            serial,
            not_after: signed.not_after,
            subject: &request.subject,
            certificate_pem: &signed.pem,
            private_key_pem: Some(&private_key_pem),
            passphrase: self.passphrase(),
        })?;

        info!(serial = %serial, algorithm = %algorithm, "created root CA");
        Ok(RootCa {
            serial,
            certificate_pem: signed.pem,
            private_key_pem,
        })
    }

    /// Root key algorithm; an unsized RSA request gets the root default size.
    fn root_algorithm(&self, request: &CertificateConfiguration) -> Result<KeyAlgorithm> {
        let algorithm = match &request.key_source {
            KeySource::Generated => self.config.root_key_algorithm,
            KeySource::GeneratedWith(algorithm) => *algorithm,
            KeySource::External(_) => {
                return Err(PkiError::ValidationError(
                    "a root CA must be created with its own signing key".to_string(),
                ))
            }
        };
        Ok(algorithm.resolved(DEFAULT_ROOT_RSA_BITS))
    }

    fn subject_key(&self, request: &CertificateConfiguration) -> Result<SubjectKey> {
        let generated = |algorithm: KeyAlgorithm| generate_key(algorithm).map(SubjectKey::Generated);
        match &request.key_source {
            KeySource::Generated => generated(self.config.leaf_key_algorithm),
            KeySource::GeneratedWith(algorithm) => generated(*algorithm),
            KeySource::External(external) => load_external_key(external).map(SubjectKey::External),
        }
    }

    /// Issue a server, client or subordinate CA certificate under the root.
    ///
    /// The private key is returned only when this call generated it.
    #[instrument(skip(self, request), fields(common_name = %request.subject.common_name))]
    pub fn issue_certificate(&self, request: &CertificateConfiguration) -> Result<IssuedBundle> {
        let certificate_type = leaf_type(request);
        request.validate_for(certificate_type)?;
        let subject_key = self.subject_key(request)?;

        let mut store = self.store.write(self.config.lock_timeout())?;
        let _held = store.lock_for_mutation(self.config.lock_timeout())?;
        let root = store.load_root(self.passphrase())?;
        let serial = store.serials().reserve(request.serial_number)?;
        let not_before = issuance_time()?;
        let default_days = self.config.leaf_validity_days;

        let (signed, private_key_pem) = match &subject_key {
            SubjectKey::Generated(key) => (
                sign_certificate(request, key.key_pair(), &root, serial, not_before, default_days)?,
                Some(key.private_key_pem()),
            ),
            SubjectKey::External(spki) => (
                sign_certificate(request, spki, &root, serial, not_before, default_days)?,
                None,
            ),
        };

        let kind = if certificate_type.is_authority() {
            RecordKind::Intermediate
        } else {
            RecordKind::Leaf
        };
        store.record_issuance(Issuance {
            kind,
            serial,
            not_after: signed.not_after,
            subject: &request.subject,
            certificate_pem: &signed.pem,
            private_key_pem: private_key_pem.as_deref(),
            passphrase: self.passphrase(),
        })?;

        info!(
            serial = %serial,
            certificate_type = %certificate_type,
            external_key = private_key_pem.is_none(),
            "issued certificate"
        );
        Ok(IssuedBundle {
            serial,
            certificate_pem: signed.pem,
            private_key_pem,
        })
    }

    /// Revoke an issued certificate and publish a fresh CRL.
    ///
    /// Revocation is permanent. The root cannot revoke itself.
    #[instrument(skip(self))]
    pub fn revoke_certificate(&self, serial: SerialNumber, reason: RevocationReason) -> Result<()> {
        let mut store = self.store.write(self.config.lock_timeout())?;
        let _held = store.lock_for_mutation(self.config.lock_timeout())?;

        let entry = store
            .find(serial)
            .cloned()
            .ok_or_else(|| PkiError::NotFoundError(format!("serial {} was never issued", serial)))?;
        if entry.status == EntryStatus::Revoked {
            return Err(PkiError::ValidationError(format!(
                "serial {} is already revoked",
                serial
            )));
        }
        if store.root_serial()? == serial {
            return Err(PkiError::ValidationError(
                "the root CA cannot be revoked".to_string(),
            ));
        }

        let root = store.load_root(self.passphrase())?;
        let now = issuance_time()?;
        let revoked = entry.revoked(now, reason);
        let entries: Vec<IndexEntry> = store
            .entries()
            .iter()
            .map(|e| if e.serial == serial { revoked.clone() } else { e.clone() })
            .collect();

        let crl_number = store.next_crl_number();
        let crl = render_crl(&root, &entries, crl_number, now, self.config.crl_validity_days)?;
        store.record_revocation(revoked, crl_number, &crl)?;

        warn!(serial = %serial, reason = %reason, crl_number = %crl_number, "revoked certificate");
        Ok(())
    }

    /// Every ledger entry, in issuance order.
    pub fn list_issued(&self) -> Result<Vec<IssuedCertificate>> {
        let store = self.store.read(self.config.lock_timeout())?;
        let _held = store.lock_for_read(self.config.lock_timeout())?;
        let index = store.load_index()?;
        let now = OffsetDateTime::now_utc();
        index
            .entries()
            .iter()
            .map(|entry| summarize(&store, entry, now))
            .collect()
    }

    /// One issued certificate by serial.
    pub fn get_certificate(&self, serial: SerialNumber) -> Result<IssuedCertificate> {
        let store = self.store.read(self.config.lock_timeout())?;
        let _held = store.lock_for_read(self.config.lock_timeout())?;
        let index = store.load_index()?;
        let entry = index
            .find(serial)
            .ok_or_else(|| PkiError::NotFoundError(format!("serial {} was never issued", serial)))?;
        summarize(&store, entry, OffsetDateTime::now_utc())
    }

    /// PEM of the active root certificate.
    pub fn root_certificate(&self) -> Result<String> {
        let store = self.store.read(self.config.lock_timeout())?;
        let _held = store.lock_for_read(self.config.lock_timeout())?;
        store.root_certificate_pem()
    }

    /// PEM of the latest CRL; `None` until something has been revoked.
    pub fn current_crl(&self) -> Result<Option<String>> {
        let store = self.store.read(self.config.lock_timeout())?;
        let _held = store.lock_for_read(self.config.lock_timeout())?;
        store.current_crl()
    }
}

fn summarize(store: &PkiStore, entry: &IndexEntry, now: OffsetDateTime) -> Result<IssuedCertificate> {
    let pem_certificate = store.read_certificate(entry.serial)?;
    let info = certificate_info(&pem_certificate)?;
    if info.serial != entry.serial {
        return Err(PkiError::CorruptState(format!(
            "certificate file for serial {} holds serial {}",
            entry.serial, info.serial
        )));
    }

    let status = match entry.status {
        EntryStatus::Revoked => CertificateStatus::Revoked,
        EntryStatus::Valid if entry.not_after <= now => CertificateStatus::Expired,
        EntryStatus::Valid => CertificateStatus::Valid,
    };

    Ok(IssuedCertificate {
        serial: entry.serial,
        subject_name: info.subject,
        issuer_name: info.issuer,
        not_before: info.not_before,
        not_after: info.not_after,
        status,
        revoked_at: entry.revocation.map(|r| r.revoked_at),
        revocation_reason: entry.revocation.map(|r| r.reason),
        is_ca: info.is_ca,
        pem_certificate,
        raw_key_path: entry
            .key_path
            .as_deref()
            .map(|path| store.layout().resolve(path)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::request::{CertificateType, Expiration};
    use crate::crypto::keygen::EcCurve;
    use crate::storage::lock::InstanceLock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pki() -> (TempDir, PkiHandle) {
        let dir = TempDir::new().unwrap();
        let pki = PkiHandle::initialize(dir.path(), PkiConfig::default()).unwrap();
        (dir, pki)
    }

    fn server(name: &str) -> CertificateConfiguration {
        CertificateConfiguration::new(name)
            .with_type(CertificateType::Server)
            .with_dns_names([name])
    }

    /// A handle with its own store, as a second process would have.
    fn detached(dir: &TempDir) -> PkiHandle {
        let layout = Layout::new(dir.path().canonicalize().unwrap());
        layout.initialize().unwrap();
        let store = PkiStore::open(layout.clone()).unwrap();
        PkiHandle {
            root: layout.root().to_path_buf(),
            config: PkiConfig::default(),
            store: Arc::new(InstanceLock::new(store, "detached")),
        }
    }

    #[test]
    fn test_separate_processes_share_ledger_and_serials() {
        let dir = TempDir::new().unwrap();
        let first = detached(&dir);
        let second = detached(&dir);

        first
            .create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        let a = first.issue_certificate(&server("a.local")).unwrap();
        let b = second.issue_certificate(&server("b.local")).unwrap();
        assert_eq!(a.serial, SerialNumber::new(2));
        assert_eq!(b.serial, SerialNumber::new(3));

        first
            .revoke_certificate(a.serial, RevocationReason::Superseded)
            .unwrap();

        let listed = second.list_issued().unwrap();
        let statuses: Vec<_> = listed.iter().map(|c| (c.serial, c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (SerialNumber::new(1), CertificateStatus::Valid),
                (SerialNumber::new(2), CertificateStatus::Revoked),
                (SerialNumber::new(3), CertificateStatus::Valid),
            ]
        );
        assert!(second.current_crl().unwrap().is_some());
    }

    #[test]
    fn test_mutation_waits_for_directory_lock() {
        let dir = TempDir::new().unwrap();
        let holder = detached(&dir);
        let mut contender = detached(&dir);
        contender.config.lock_timeout_ms = 50;

        let mut store = holder.store.write(Duration::from_secs(1)).unwrap();
        let _held = store.lock_for_mutation(Duration::from_secs(1)).unwrap();
        match contender.create_root_ca(&CertificateConfiguration::new("Root")) {
            Err(e @ PkiError::Locked(_)) => assert!(e.is_retryable()),
            other => panic!("Expected Locked, got {:?}", other),
        }
    }

    #[test]
    fn test_unsized_rsa_root_gets_root_default() {
        let (_dir, mut pki) = pki();
        pki.config = serde_json::from_str(r#"{"root_key_algorithm": "rsa"}"#).unwrap();
        let request = CertificateConfiguration::new("Root");
        assert_eq!(
            pki.root_algorithm(&request).unwrap(),
            KeyAlgorithm::Rsa { bits: Some(4096) }
        );

        let request: CertificateConfiguration = serde_json::from_str(
            r#"{"subject": {"common_name": "Root"}, "key_source": {"generated_with": "rsa"}}"#,
        )
        .unwrap();
        assert_eq!(
            pki.root_algorithm(&request).unwrap(),
            KeyAlgorithm::Rsa { bits: Some(4096) }
        );

        let request = CertificateConfiguration {
            key_source: KeySource::GeneratedWith(KeyAlgorithm::Ecdsa(EcCurve::P384)),
            ..CertificateConfiguration::new("Root")
        };
        assert_eq!(
            pki.root_algorithm(&request).unwrap(),
            KeyAlgorithm::Ecdsa(EcCurve::P384)
        );
    }

    #[test]
    fn test_issue_requires_root() {
        let (_dir, pki) = pki();
        match pki.issue_certificate(&server("svc.local")) {
            Err(PkiError::NotFoundError(_)) => {}
            other => panic!("Expected NotFoundError, got {:?}", other),
        }
    }

    #[test]
    fn test_second_root_rejected() {
        let (_dir, pki) = pki();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        match pki.create_root_ca(&CertificateConfiguration::new("Other Root")) {
            Err(PkiError::AlreadyExistsError(_)) => {}
            other => panic!("Expected AlreadyExistsError, got {:?}", other),
        }
        assert_eq!(pki.list_issued().unwrap().len(), 1);
    }

    #[test]
    fn test_validation_happens_before_serial_use() {
        let (_dir, pki) = pki();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        let bad = CertificateConfiguration::new("svc").with_type(CertificateType::Server);
        assert!(matches!(
            pki.issue_certificate(&bad),
            Err(PkiError::ValidationError(_))
        ));

        let issued = pki.issue_certificate(&server("svc")).unwrap();
        assert_eq!(issued.serial, SerialNumber::new(2));
    }

    #[test]
    fn test_revoke_unknown_and_twice() {
        let (_dir, pki) = pki();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        assert!(matches!(
            pki.revoke_certificate(SerialNumber::new(9), RevocationReason::Unspecified),
            Err(PkiError::NotFoundError(_))
        ));

        let issued = pki.issue_certificate(&server("svc")).unwrap();
        pki.revoke_certificate(issued.serial, RevocationReason::KeyCompromise)
            .unwrap();
        assert!(matches!(
            pki.revoke_certificate(issued.serial, RevocationReason::KeyCompromise),
            Err(PkiError::ValidationError(_))
        ));
    }

    #[test]
    fn test_root_cannot_be_revoked() {
        let (_dir, pki) = pki();
        let root = pki
            .create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        assert!(matches!(
            pki.revoke_certificate(root.serial, RevocationReason::CaCompromise),
            Err(PkiError::ValidationError(_))
        ));
        assert_eq!(pki.current_crl().unwrap(), None);
    }

    #[test]
    fn test_issue_times_out_while_locked() {
        let dir = TempDir::new().unwrap();
        let config = PkiConfig {
            lock_timeout_ms: 20,
            ..PkiConfig::default()
        };
        let pki = PkiHandle::initialize(dir.path(), config).unwrap();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();

        let _guard = pki.store.write(Duration::from_secs(1)).unwrap();
        let contender = pki.clone();
        let result = std::thread::spawn(move || contender.issue_certificate(&server("svc")))
            .join()
            .unwrap();
        match result {
            Err(e @ PkiError::Locked(_)) => assert!(e.is_retryable()),
            other => panic!("Expected Locked, got {:?}", other),
        }
    }

    #[test]
    fn test_past_not_after_rejected() {
        let (_dir, pki) = pki();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        let past = OffsetDateTime::now_utc() - time::Duration::days(1);
        let request = server("old").with_expiration(Expiration::NotAfter(past));

        assert!(matches!(
            pki.issue_certificate(&request),
            Err(PkiError::ValidationError(_))
        ));
        assert_eq!(pki.list_issued().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_status_derived_at_read_time() {
        let (_dir, pki) = pki();
        pki.create_root_ca(&CertificateConfiguration::new("Root"))
            .unwrap();
        let issued = pki
            .issue_certificate(&server("short").with_valid_days(1))
            .unwrap();

        let store = pki.store.read(Duration::from_secs(1)).unwrap();
        let entry = store.find(issued.serial).unwrap();
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            summarize(&store, entry, now).unwrap().status,
            CertificateStatus::Valid
        );
        let later = now + time::Duration::days(2);
        assert_eq!(
            summarize(&store, entry, later).unwrap().status,
            CertificateStatus::Expired
        );
    }
}
