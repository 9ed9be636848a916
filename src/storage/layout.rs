//! On-disk layout of a PKI instance.
//!
//! ```text
//! <root>/
//!   private/        root and intermediate private keys (0700, files 0600)
//!   certs/          issued certificates, <SERIAL>.pem, plus ca.cert.pem
//!   newcerts/       staging area for certificates not yet confirmed
//!   keys/           generated leaf private keys (0700, files 0600)
//!   csrs/           signing requests accepted out of band
//!   crl/            rendered revocation lists
//!   intermediate/   subordinate CA certificates
//!   index.txt       issuance ledger
//!   serial          next serial, hex
//!   crlnumber       next CRL number, hex
//! ```

use crate::error::Result;
use crate::storage::serial::SerialNumber;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PRIVATE_DIR: &str = "private";
pub const CERTS_DIR: &str = "certs";
pub const NEWCERTS_DIR: &str = "newcerts";
pub const KEYS_DIR: &str = "keys";
pub const CSRS_DIR: &str = "csrs";
pub const CRL_DIR: &str = "crl";
pub const INTERMEDIATE_DIR: &str = "intermediate";

pub const INDEX_FILE: &str = "index.txt";
pub const SERIAL_FILE: &str = "serial";
pub const CRLNUMBER_FILE: &str = "crlnumber";
/// Advisory lock shared by every process working on the instance.
pub const LOCK_FILE: &str = ".lock";

const ROOT_CERT_FILE: &str = "ca.cert.pem";
const ROOT_KEY_STEM: &str = "ca";
const CURRENT_CRL_FILE: &str = "current.pem";

/// Initial content of the `serial` and `crlnumber` files.
const INITIAL_COUNTER: &str = "01\n";

/// Paths of one PKI instance.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory and bookkeeping file that is missing.
    ///
    /// Existing files are never touched, so running this on an initialized
    /// instance changes nothing.
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        for dir in [CERTS_DIR, NEWCERTS_DIR, CSRS_DIR, CRL_DIR, INTERMEDIATE_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        for dir in [PRIVATE_DIR, KEYS_DIR] {
            create_private_dir(&self.root.join(dir))?;
        }

        create_if_absent(&self.index_path(), b"")?;
        create_if_absent(&self.serial_path(), INITIAL_COUNTER.as_bytes())?;
        create_if_absent(&self.crlnumber_path(), INITIAL_COUNTER.as_bytes())?;
        create_if_absent(&self.lock_path(), b"")?;

        debug!(root = %self.root.display(), "layout ready");
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn serial_path(&self) -> PathBuf {
        self.root.join(SERIAL_FILE)
    }

    pub fn crlnumber_path(&self) -> PathBuf {
        self.root.join(CRLNUMBER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// The active root certificate.
    pub fn root_cert_path(&self) -> PathBuf {
        self.root.join(CERTS_DIR).join(ROOT_CERT_FILE)
    }

    /// The active root key, plain or sealed.
    pub fn root_key_path(&self, sealed: bool) -> PathBuf {
        self.root
            .join(PRIVATE_DIR)
            .join(key_file_name(ROOT_KEY_STEM, sealed))
    }

    /// Confirmed location of an issued certificate.
    pub fn cert_path(&self, serial: SerialNumber) -> PathBuf {
        self.root.join(CERTS_DIR).join(format!("{}.pem", serial))
    }

    /// Staging location of a certificate being issued.
    pub fn staged_cert_path(&self, serial: SerialNumber) -> PathBuf {
        self.root.join(NEWCERTS_DIR).join(format!("{}.pem", serial))
    }

    pub fn leaf_key_path(&self, serial: SerialNumber, sealed: bool) -> PathBuf {
        self.root
            .join(KEYS_DIR)
            .join(key_file_name(&serial.to_hex(), sealed))
    }

    pub fn intermediate_cert_path(&self, serial: SerialNumber) -> PathBuf {
        self.root
            .join(INTERMEDIATE_DIR)
            .join(format!("{}.cert.pem", serial))
    }

    pub fn intermediate_key_path(&self, serial: SerialNumber, sealed: bool) -> PathBuf {
        self.root
            .join(PRIVATE_DIR)
            .join(key_file_name(&serial.to_hex(), sealed))
    }

    /// A numbered CRL.
    pub fn crl_path(&self, number: SerialNumber) -> PathBuf {
        self.root.join(CRL_DIR).join(format!("crl-{}.pem", number))
    }

    /// The most recently rendered CRL.
    pub fn current_crl_path(&self) -> PathBuf {
        self.root.join(CRL_DIR).join(CURRENT_CRL_FILE)
    }

    /// `path` relative to the instance root, as recorded in the index.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// Resolve a path recorded in the index.
    pub fn resolve(&self, recorded: &str) -> PathBuf {
        self.root.join(recorded)
    }
}

fn key_file_name(stem: &str, sealed: bool) -> String {
    if sealed {
        format!("{}.key.enc", stem)
    } else {
        format!("{}.key.pem", stem)
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn create_if_absent(path: &Path, contents: &[u8]) -> io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents)?;
            file.sync_all()
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write a new file, failing if it already exists.
pub fn write_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Write a new file readable only by the owner, failing if it already exists.
pub fn write_new_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Replace a file's contents via a temporary sibling and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}
