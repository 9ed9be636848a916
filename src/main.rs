//! privca CLI application.
//!
//! This binary maps subcommands onto [`PkiHandle`] operations. Certificates
//! and keys go to stdout (or `--out-dir`); logs go to stderr.

use clap::{Args, Parser, Subcommand};
use privca::cert::request::{
    CertificateConfiguration, CertificateType, Expiration, ExternalKey, KeySource, Subject,
};
use privca::config::PkiConfig;
use privca::crypto::keygen::KeyAlgorithm;
use privca::error::{PkiError, Result};
use privca::storage::index::RevocationReason;
use privca::storage::layout::{write_new, write_new_private};
use privca::storage::serial::SerialNumber;
use privca::PkiHandle;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fallback variable for the log filter when `RUST_LOG` is unset.
const ENV_LOG_LEVEL: &str = "PKI_LOG_LEVEL";

#[derive(Parser)]
#[command(name = "privca")]
#[command(about = "privca: a private certificate authority", long_about = None)]
struct Cli {
    /// PKI instance directory (default: current directory)
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// JSON configuration file (default: PKI_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Prompt for the passphrase sealing private keys
    #[arg(long, global = true)]
    ask_passphrase: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the directory layout (safe to re-run)
    Init,

    /// Create the self-signed root CA
    CreateRoot {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Root validity in years (default from configuration)
        #[arg(long)]
        validity_years: Option<u32>,

        /// Key algorithm: rsa, rsa:<bits>, p256, p384, p521
        #[arg(long)]
        algorithm: Option<String>,

        /// Explicit serial number (hex)
        #[arg(long)]
        serial: Option<String>,

        /// Write ca.cert.pem and ca.key.pem here instead of stdout
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Issue a certificate signed by the root
    Issue {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Certificate type: server, client, authority, authority-no-subs
        #[arg(long = "type", default_value = "server")]
        certificate_type: String,

        /// DNS subject alternative name (repeatable)
        #[arg(long = "dns")]
        dns_names: Vec<String>,

        /// IP subject alternative name (repeatable)
        #[arg(long = "ip")]
        ip_addresses: Vec<String>,

        /// Email subject alternative name (repeatable)
        #[arg(long = "email")]
        email_addresses: Vec<String>,

        /// URI subject alternative name (repeatable)
        #[arg(long = "uri")]
        uris: Vec<String>,

        /// Validity in days (default from configuration)
        #[arg(long)]
        days: Option<i64>,

        /// Key algorithm for a generated key: rsa, rsa:<bits>, p256, p384, p521
        #[arg(long)]
        algorithm: Option<String>,

        /// Certify this PEM public key instead of generating one
        #[arg(long, requires = "algorithm")]
        public_key: Option<PathBuf>,

        /// Explicit serial number (hex)
        #[arg(long)]
        serial: Option<String>,

        /// Full request as JSON; other request flags are ignored
        #[arg(long, conflicts_with = "common_name")]
        request: Option<PathBuf>,

        /// Write <serial>.cert.pem and <serial>.key.pem here instead of stdout
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Revoke an issued certificate and publish a new CRL
    Revoke {
        /// Serial number (hex)
        #[arg(long)]
        serial: String,

        /// keyCompromise, CACompromise, affiliationChanged, superseded,
        /// cessationOfOperation, certificateHold, privilegeWithdrawn, unspecified
        #[arg(long, default_value = "unspecified")]
        reason: String,
    },

    /// List every issued certificate
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print one issued certificate
    Show {
        /// Serial number (hex)
        #[arg(long)]
        serial: String,
    },

    /// Print the root certificate
    Root,

    /// Print the current CRL
    Crl,
}

#[derive(Args)]
struct SubjectArgs {
    /// Common name
    #[arg(long = "cn", id = "common_name")]
    common_name: Option<String>,

    /// Organization
    #[arg(long = "org")]
    organization: Option<String>,

    /// Organizational unit
    #[arg(long = "ou")]
    organizational_unit: Option<String>,

    /// Two-letter country code
    #[arg(long)]
    country: Option<String>,

    /// State or province
    #[arg(long)]
    province: Option<String>,

    /// Locality or city
    #[arg(long)]
    locality: Option<String>,
}

impl SubjectArgs {
    fn into_subject(self) -> Result<Subject> {
        let common_name = self.common_name.ok_or_else(|| {
            PkiError::ValidationError("--cn is required".to_string())
        })?;
        let mut subject = Subject::new(common_name);
        subject.organization = self.organization.into_iter().collect();
        subject.organizational_unit = self.organizational_unit.into_iter().collect();
        subject.country = self.country.into_iter().collect();
        subject.province = self.province.into_iter().collect();
        subject.locality = self.locality.into_iter().collect();
        Ok(subject)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(ENV_LOG_LEVEL))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(if e.is_retryable() { 75 } else { 1 });
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PkiConfig::from_file(path)?,
        None => PkiConfig::from_env(),
    };
    if cli.ask_passphrase {
        let passphrase = rpassword::prompt_password("Enter key passphrase: ")?;
        config.key_passphrase = Some(passphrase).filter(|p| !p.is_empty());
    }

    let path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let pki = PkiHandle::initialize(&path, config)?;

    match cli.command {
        Commands::Init => {
            println!("Initialized PKI instance at: {}", pki.path().display());
            Ok(())
        }

        Commands::CreateRoot {
            subject,
            validity_years,
            algorithm,
            serial,
            out_dir,
        } => {
            let mut request = CertificateConfiguration {
                subject: subject.into_subject()?,
                ..CertificateConfiguration::default()
            };
            if let Some(years) = validity_years {
                request.expiration = Some(Expiration::Relative {
                    years,
                    months: 0,
                    days: 0,
                });
            }
            if let Some(algorithm) = algorithm {
                request.key_source = KeySource::GeneratedWith(algorithm.parse::<KeyAlgorithm>()?);
            }
            request.serial_number = serial.as_deref().map(str::parse).transpose()?;

            let root = pki.create_root_ca(&request)?;
            eprintln!("Created root CA with serial {}", root.serial);
            emit(
                out_dir.as_deref(),
                "ca",
                &root.certificate_pem,
                Some(&root.private_key_pem),
            )
        }

        Commands::Issue {
            subject,
            certificate_type,
            dns_names,
            ip_addresses,
            email_addresses,
            uris,
            days,
            algorithm,
            public_key,
            serial,
            request,
            out_dir,
        } => {
            let request: CertificateConfiguration = match request {
                Some(file) => serde_json::from_str(&fs::read_to_string(&file)?)?,
                None => {
                    let mut request = CertificateConfiguration {
                        subject: subject.into_subject()?,
                        certificate_type: Some(certificate_type.parse::<CertificateType>()?),
                        ..CertificateConfiguration::default()
                    };
                    request.san_data.dns_names = dns_names;
                    request.san_data.ip_addresses = ip_addresses;
                    request.san_data.email_addresses = email_addresses;
                    request.san_data.uris = uris;
                    if let Some(days) = days {
                        request = request.with_valid_days(days);
                    }
                    let algorithm: Option<KeyAlgorithm> =
                        algorithm.as_deref().map(str::parse).transpose()?;
                    request.key_source = match (public_key, algorithm) {
                        (Some(file), Some(algorithm)) => KeySource::External(ExternalKey {
                            public_key_pem: fs::read_to_string(&file)?,
                            algorithm,
                        }),
                        (None, Some(algorithm)) => KeySource::GeneratedWith(algorithm),
                        _ => KeySource::Generated,
                    };
                    request.serial_number = serial.as_deref().map(str::parse).transpose()?;
                    request
                }
            };

            let issued = pki.issue_certificate(&request)?;
            eprintln!("Issued certificate with serial {}", issued.serial);
            emit(
                out_dir.as_deref(),
                &issued.serial.to_string(),
                &issued.certificate_pem,
                issued.private_key_pem.as_deref(),
            )
        }

        Commands::Revoke { serial, reason } => {
            let serial: SerialNumber = serial.parse()?;
            let reason: RevocationReason = reason.parse()?;
            pki.revoke_certificate(serial, reason)?;
            println!("Revoked certificate {} ({})", serial, reason);
            Ok(())
        }

        Commands::List { json } => {
            let issued = pki.list_issued()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&issued)?);
            } else if issued.is_empty() {
                println!("No certificates issued.");
            } else {
                println!("{:<8} {:<8} {:<22} Subject", "Serial", "Status", "Not After");
                println!("{}", "-".repeat(70));

                for cert in issued {
                    println!(
                        "{:<8} {:<8} {:<22} {}",
                        cert.serial.to_string(),
                        cert.status.to_string(),
                        cert.not_after.date().to_string(),
                        cert.subject_name
                    );
                }
            }

            Ok(())
        }

        Commands::Show { serial } => {
            let cert = pki.get_certificate(serial.parse()?)?;
            println!("Serial:     {}", cert.serial);
            println!("Subject:    {}", cert.subject_name);
            println!("Issuer:     {}", cert.issuer_name);
            println!("Not Before: {}", cert.not_before);
            println!("Not After:  {}", cert.not_after);
            println!("Status:     {}", cert.status);
            if let Some(reason) = cert.revocation_reason {
                println!("Reason:     {}", reason);
            }
            if let Some(key_path) = &cert.raw_key_path {
                println!("Key:        {}", key_path.display());
            }
            print!("{}", cert.pem_certificate);
            Ok(())
        }

        Commands::Root => {
            print!("{}", pki.root_certificate()?);
            Ok(())
        }

        Commands::Crl => match pki.current_crl()? {
            Some(crl) => {
                print!("{}", crl);
                Ok(())
            }
            None => Err(PkiError::NotFoundError(
                "no CRL has been published yet".to_string(),
            )),
        },
    }
}

/// Print the PEMs, or write them as new files under `out_dir`.
fn emit(out_dir: Option<&Path>, stem: &str, cert_pem: &str, key_pem: Option<&str>) -> Result<()> {
    match out_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let cert_path = dir.join(format!("{}.cert.pem", stem));
            write_new(&cert_path, cert_pem.as_bytes())?;
            println!("Certificate written to: {}", cert_path.display());

            if let Some(key_pem) = key_pem {
                let key_path = dir.join(format!("{}.key.pem", stem));
                write_new_private(&key_path, key_pem.as_bytes())?;
                println!("Private key written to: {}", key_path.display());
            }
        }
        None => {
            print!("{}", cert_pem);
            if let Some(key_pem) = key_pem {
                print!("{}", key_pem);
            }
        }
    }
    Ok(())
}
