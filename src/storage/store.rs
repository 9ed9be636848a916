//! PKI state store.
//!
//! [`PkiStore`] owns the persisted state of one instance: the ledger, the
//! serial and CRL-number counters, and the certificate and key files. Every
//! mutation runs as a [`Transaction`]: each file effect registers an undo
//! step, and a transaction dropped before [`Transaction::commit`] undoes them
//! in reverse. Counter files are written last, so a failed issuance never
//! leaves an advanced serial behind.
//!
//! Stores are shared per canonical root path through [`open_shared`], so
//! every handle on the same directory in this process goes through the same
//! lock. Other processes are ordered by the advisory lock on `.lock`: a
//! mutation takes it exclusively through [`PkiStore::lock_for_mutation`],
//! which also re-reads the ledger and counters, and readers take it shared.

use crate::cert::ca::RootMaterial;
use crate::cert::request::Subject;
use crate::crypto::encryption::{open_private_key, seal_private_key};
use crate::crypto::keygen::load_key_pair;
use crate::error::{PkiError, Result};
use crate::storage::index::{Index, IndexEntry};
use crate::storage::layout::{write_atomic, write_new, write_new_private, Layout};
use crate::storage::lock::{DirLock, InstanceLock};
use crate::storage::serial::{SerialAllocator, SerialNumber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// A store behind its instance lock.
pub type SharedStore = InstanceLock<PkiStore>;

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<SharedStore>>>> = OnceLock::new();

/// Initialize the layout under `root` and return the store shared by every
/// handle on that directory.
pub fn open_shared(root: &Path) -> Result<Arc<SharedStore>> {
    Layout::new(root).initialize()?;
    let canonical = fs::canonicalize(root)?;

    let mut instances = REGISTRY.get_or_init(Default::default).lock();
    if let Some(existing) = instances.get(&canonical).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let store = PkiStore::open(Layout::new(canonical.clone()))?;
    let shared = Arc::new(InstanceLock::new(
        store,
        canonical.display().to_string(),
    ));
    instances.retain(|_, weak| weak.strong_count() > 0);
    instances.insert(canonical, Arc::downgrade(&shared));
    Ok(shared)
}

/// What kind of certificate is being recorded; decides where files go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The self-signed root; becomes the active root.
    Root,
    /// A subordinate CA signed by the root.
    Intermediate,
    /// A server or client certificate.
    Leaf,
}

/// Everything persisted for one issued certificate.
pub struct Issuance<'a> {
    pub kind: RecordKind,
    pub serial: SerialNumber,
    pub not_after: OffsetDateTime,
    pub subject: &'a Subject,
    pub certificate_pem: &'a str,
    /// `None` when the subject key is held by the caller.
    pub private_key_pem: Option<&'a str>,
    /// Seal the private key at rest with this passphrase.
    pub passphrase: Option<&'a str>,
}

/// Persisted state of one PKI instance.
#[derive(Debug)]
pub struct PkiStore {
    layout: Layout,
    serials: SerialAllocator,
    crl_numbers: SerialAllocator,
    index: Index,
}

impl PkiStore {
    /// Load an initialized layout. Unreadable counters or ledger fail here.
    pub fn open(layout: Layout) -> Result<Self> {
        let serials = SerialAllocator::load(&layout.serial_path())?;
        let crl_numbers = SerialAllocator::load(&layout.crlnumber_path())?;
        let index = Index::load(&layout.index_path())?;

        Ok(Self {
            layout,
            serials,
            crl_numbers,
            index,
        })
    }

    /// Re-read the ledger and both counters from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.serials = SerialAllocator::load(&self.layout.serial_path())?;
        self.crl_numbers = SerialAllocator::load(&self.layout.crlnumber_path())?;
        self.index = Index::load(&self.layout.index_path())?;
        Ok(())
    }

    /// Take the directory lock exclusively and bring the cached state up to
    /// date. Mutations must keep the returned lock until they are recorded.
    pub fn lock_for_mutation(&mut self, timeout: Duration) -> Result<DirLock> {
        let held = DirLock::exclusive(&self.layout.lock_path(), timeout)?;
        self.reload()?;
        Ok(held)
    }

    /// Take the directory lock shared, for reads that must not observe a
    /// mutation in progress in another process.
    pub fn lock_for_read(&self, timeout: Duration) -> Result<DirLock> {
        DirLock::shared(&self.layout.lock_path(), timeout)
    }

    /// The ledger as currently on disk.
    pub fn load_index(&self) -> Result<Index> {
        Index::load(&self.layout.index_path())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    pub fn next_crl_number(&self) -> SerialNumber {
        self.crl_numbers.peek()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        self.index.entries()
    }

    pub fn find(&self, serial: SerialNumber) -> Option<&IndexEntry> {
        self.index.find(serial)
    }

    pub fn has_root(&self) -> bool {
        self.layout.root_cert_path().exists()
    }

    /// Serial of the active root, read from its certificate.
    pub fn root_serial(&self) -> Result<SerialNumber> {
        let pem = self.root_certificate_pem()?;
        Ok(crate::cert::loader::certificate_info(&pem)?.serial)
    }

    pub fn root_certificate_pem(&self) -> Result<String> {
        let path = self.layout.root_cert_path();
        match fs::read_to_string(&path) {
            Ok(pem) => Ok(pem),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PkiError::NotFoundError(
                "no root CA has been created for this instance".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the active root certificate and key for signing.
    ///
    /// A sealed key needs the passphrase it was sealed with.
    pub fn load_root(&self, passphrase: Option<&str>) -> Result<RootMaterial> {
        let certificate_pem = self.root_certificate_pem()?;
        crate::cert::loader::load_certificate_der(&certificate_pem)?;

        let sealed_path = self.layout.root_key_path(true);
        let plain_path = self.layout.root_key_path(false);
        let key_pem = if sealed_path.exists() {
            let passphrase = passphrase.ok_or_else(|| {
                PkiError::CorruptState(
                    "root key is sealed but no passphrase is configured".to_string(),
                )
            })?;
            open_private_key(&fs::read(&sealed_path)?, passphrase)?
        } else if plain_path.exists() {
            fs::read_to_string(&plain_path)?
        } else {
            return Err(PkiError::CorruptState(
                "root certificate present but its private key is missing".to_string(),
            ));
        };

        Ok(RootMaterial {
            certificate_pem,
            key: load_key_pair(&key_pem)?,
        })
    }

    /// PEM of an issued certificate.
    pub fn read_certificate(&self, serial: SerialNumber) -> Result<String> {
        let path = self.layout.cert_path(serial);
        fs::read_to_string(&path).map_err(|e| {
            PkiError::CorruptState(format!(
                "ledger lists serial {} but {} is unreadable: {}",
                serial,
                path.display(),
                e
            ))
        })
    }

    /// Key location recorded for `kind`, or `None` for caller-held keys.
    fn key_path(&self, issuance: &Issuance<'_>) -> Option<PathBuf> {
        issuance.private_key_pem?;
        let sealed = issuance.passphrase.is_some();
        Some(match issuance.kind {
            RecordKind::Root => self.layout.root_key_path(sealed),
            RecordKind::Intermediate => self.layout.intermediate_key_path(issuance.serial, sealed),
            RecordKind::Leaf => self.layout.leaf_key_path(issuance.serial, sealed),
        })
    }

    /// Persist an issued certificate as one transaction: stage the
    /// certificate, write the key, confirm the certificate into `certs/`,
    /// append the ledger line and finally advance the serial counter.
    pub fn record_issuance(&mut self, issuance: Issuance<'_>) -> Result<()> {
        let serial = issuance.serial;
        let confirmed = self.layout.cert_path(serial);
        if confirmed.is_file() || self.index.find(serial).is_some() {
            return Err(PkiError::CorruptState(format!(
                "serial {} is already recorded",
                serial
            )));
        }
        let key_path = self.key_path(&issuance);

        let mut tx = Transaction::new();

        let staged = self.layout.staged_cert_path(serial);
        tx.create(&staged, issuance.certificate_pem.as_bytes(), false)?;

        if let (Some(path), Some(key_pem)) = (&key_path, issuance.private_key_pem) {
            let contents = match issuance.passphrase {
                Some(passphrase) => seal_private_key(key_pem, passphrase)?,
                None => key_pem.as_bytes().to_vec(),
            };
            tx.create(path, &contents, true)?;
        }

        match issuance.kind {
            RecordKind::Root => tx.create(
                &self.layout.root_cert_path(),
                issuance.certificate_pem.as_bytes(),
                false,
            )?,
            RecordKind::Intermediate => tx.create(
                &self.layout.intermediate_cert_path(serial),
                issuance.certificate_pem.as_bytes(),
                false,
            )?,
            RecordKind::Leaf => {}
        }

        tx.rename(&staged, &confirmed)?;

        let entry = IndexEntry::valid(
            serial,
            issuance.not_after,
            key_path.as_deref().map(|p| self.layout.relative(p)),
            issuance.subject,
        );
        tx.append_index(&self.index, &entry)?;

        self.serials.commit(serial)?;
        tx.commit();

        self.index.push(entry);
        debug!(serial = %serial, kind = ?issuance.kind, "recorded issuance");
        Ok(())
    }

    /// Persist a revocation: the numbered CRL, the current CRL, the rewritten
    /// ledger line, then the advanced CRL number.
    pub fn record_revocation(
        &mut self,
        revoked: IndexEntry,
        crl_number: SerialNumber,
        crl_pem: &str,
    ) -> Result<()> {
        if crl_number != self.crl_numbers.peek() {
            return Err(PkiError::CorruptState(format!(
                "CRL number {} is not the next number {}",
                crl_number,
                self.crl_numbers.peek()
            )));
        }

        let mut tx = Transaction::new();
        tx.create(&self.layout.crl_path(crl_number), crl_pem.as_bytes(), false)?;
        tx.replace(&self.layout.current_crl_path(), crl_pem.as_bytes())?;
        tx.replace(
            self.index.path(),
            self.index.render_with(&revoked).as_bytes(),
        )?;

        self.crl_numbers.commit(crl_number)?;
        tx.commit();

        debug!(serial = %revoked.serial, crl_number = %crl_number, "recorded revocation");
        self.index.replace(revoked);
        Ok(())
    }

    /// The most recently rendered CRL, if any.
    pub fn current_crl(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.layout.current_crl_path()) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Undo step for one file effect.
#[derive(Debug)]
enum Undo {
    Remove(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
    Truncate { path: PathBuf, len: u64 },
    Restore { path: PathBuf, contents: Vec<u8> },
}

impl Undo {
    fn apply(&self) -> io::Result<()> {
        match self {
            Undo::Remove(path) => fs::remove_file(path),
            Undo::Rename { from, to } => fs::rename(from, to),
            Undo::Truncate { path, len } => {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(*len)?;
                file.sync_all()
            }
            Undo::Restore { path, contents } => write_atomic(path, contents),
        }
    }
}

/// File effects that are undone unless committed.
#[derive(Debug, Default)]
pub struct Transaction {
    undo: Vec<Undo>,
    committed: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new file; fails if it exists.
    pub fn create(&mut self, path: &Path, contents: &[u8], private: bool) -> Result<()> {
        if private {
            write_new_private(path, contents)?;
        } else {
            write_new(path, contents)?;
        }
        self.undo.push(Undo::Remove(path.to_path_buf()));
        Ok(())
    }

    /// Move a file into place; refuses to replace an existing file.
    pub fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if to.is_file() {
            return Err(PkiError::CorruptState(format!(
                "{} already exists",
                to.display()
            )));
        }
        fs::rename(from, to)?;
        self.undo.push(Undo::Rename {
            from: to.to_path_buf(),
            to: from.to_path_buf(),
        });
        Ok(())
    }

    /// Append a ledger line.
    pub fn append_index(&mut self, index: &Index, entry: &IndexEntry) -> Result<()> {
        let len = index.append_line(entry)?;
        self.undo.push(Undo::Truncate {
            path: index.path().to_path_buf(),
            len,
        });
        Ok(())
    }

    /// Atomically replace a file, remembering what was there before.
    pub fn replace(&mut self, path: &Path, contents: &[u8]) -> Result<()> {
        let previous = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        write_atomic(path, contents)?;
        self.undo.push(match previous {
            Some(contents) => Undo::Restore {
                path: path.to_path_buf(),
                contents,
            },
            None => Undo::Remove(path.to_path_buf()),
        });
        Ok(())
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.committed || self.undo.is_empty() {
            return;
        }
        warn!(steps = self.undo.len(), "rolling back incomplete transaction");
        for step in self.undo.iter().rev() {
            if let Err(e) = step.apply() {
                warn!(step = ?step, error = %e, "rollback step failed");
            }
        }
    }
}
