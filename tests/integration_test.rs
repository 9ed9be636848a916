//! Integration tests for privca.
//!
//! These tests drive complete workflows through `PkiHandle` over a temporary
//! directory and check the results with an independent X.509 parser.

use privca::cert::loader::load_certificate_der;
use privca::cert::request::{
    CertificateConfiguration, CertificateType, ExternalKey, KeySource, Subject,
};
use privca::config::PkiConfig;
use privca::crypto::keygen::{generate_key, EcCurve, KeyAlgorithm};
use privca::error::{PkiError, Result};
use privca::pki::CertificateStatus;
use privca::storage::index::RevocationReason;
use privca::storage::serial::SerialNumber;
use privca::PkiHandle;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;

fn new_pki() -> (TempDir, PkiHandle) {
    let temp_dir = TempDir::new().unwrap();
    let pki = PkiHandle::initialize(temp_dir.path(), PkiConfig::default()).unwrap();
    (temp_dir, pki)
}

fn server(name: &str) -> CertificateConfiguration {
    CertificateConfiguration::new(name)
        .with_type(CertificateType::Server)
        .with_dns_names([name])
}

fn der(pem: &str) -> Vec<u8> {
    load_certificate_der(pem).unwrap()
}

#[test]
fn test_root_is_self_signed_and_verifies() -> Result<()> {
    let (_dir, pki) = new_pki();
    let root = pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let root_der = der(&root.certificate_pem);
    let (_, cert) = parse_x509_certificate(&root_der).unwrap();
    assert_eq!(cert.issuer().to_string(), cert.subject().to_string());
    assert!(cert.is_ca());
    cert.verify_signature(None).unwrap();

    let key_usage = cert.key_usage().unwrap().unwrap().value;
    assert!(key_usage.key_cert_sign());
    assert!(key_usage.digital_signature());

    Ok(())
}

#[test]
fn test_root_then_leaf_scenario() -> Result<()> {
    let (_dir, pki) = new_pki();

    // 1. Root: serial 1, CA, about ten years
    let root = pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    assert_eq!(root.serial, SerialNumber::new(1));
    let root_der = der(&root.certificate_pem);
    let (_, root_cert) = parse_x509_certificate(&root_der).unwrap();
    assert_eq!(root_cert.raw_serial(), &[1u8]);
    let root_days = (root_cert.validity().not_after.timestamp()
        - root_cert.validity().not_before.timestamp())
        / 86_400;
    assert!((3650..=3653).contains(&root_days), "got {} days", root_days);

    // 2. Leaf: serial 2, 90 days, serverAuth, issued by the root
    let request = server("svc.local").with_valid_days(90);
    let leaf = pki.issue_certificate(&request)?;
    assert_eq!(leaf.serial, SerialNumber::new(2));
    assert!(leaf.private_key_pem.is_some());

    let leaf_der = der(&leaf.certificate_pem);
    let (_, leaf_cert) = parse_x509_certificate(&leaf_der).unwrap();
    assert_eq!(leaf_cert.raw_serial(), &[2u8]);
    assert_eq!(leaf_cert.issuer().to_string(), root_cert.subject().to_string());
    assert_eq!(leaf_cert.issuer().to_string(), "CN=Test Root");
    assert!(!leaf_cert.is_ca());
    assert_eq!(
        leaf_cert.validity().not_after.timestamp() - leaf_cert.validity().not_before.timestamp(),
        90 * 86_400
    );

    let eku = leaf_cert.extended_key_usage().unwrap().unwrap().value;
    assert!(eku.server_auth);
    assert!(!eku.client_auth);

    leaf_cert
        .verify_signature(Some(root_cert.public_key()))
        .unwrap();

    let san = leaf_cert.subject_alternative_name().unwrap().unwrap().value;
    assert!(san
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName("svc.local"))));

    Ok(())
}

#[test]
fn test_client_certificate_profile() -> Result<()> {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let request = CertificateConfiguration::new("alice").with_type(CertificateType::Client);
    let issued = pki.issue_certificate(&request)?;

    let leaf_der = der(&issued.certificate_pem);
    let (_, cert) = parse_x509_certificate(&leaf_der).unwrap();
    let eku = cert.extended_key_usage().unwrap().unwrap().value;
    assert!(eku.client_auth);
    assert!(!eku.server_auth);

    Ok(())
}

#[test]
fn test_server_without_names_rejected() {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))
        .unwrap();

    let request = CertificateConfiguration::new("svc.local").with_type(CertificateType::Server);
    match pki.issue_certificate(&request) {
        Err(PkiError::ValidationError(_)) => {}
        other => panic!("Expected ValidationError, got {:?}", other),
    }
    assert_eq!(pki.list_issued().unwrap().len(), 1);
}

#[test]
fn test_invalid_ip_san_rejected() {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))
        .unwrap();

    let request = server("svc.local").with_ip_addresses(["10.0.0.1", "not-an-ip"]);
    match pki.issue_certificate(&request) {
        Err(PkiError::InvalidSan(_)) => {}
        other => panic!("Expected InvalidSan, got {:?}", other),
    }
}

#[test]
fn test_concurrent_issuance_unique_serials() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let config = PkiConfig {
        lock_timeout_ms: 120_000,
        ..PkiConfig::default()
    };
    let pki = PkiHandle::initialize(temp_dir.path(), config)?;
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let pki = Arc::new(pki);
    let handles: Vec<_> = (0..100)
        .map(|i| {
            let pki = Arc::clone(&pki);
            thread::spawn(move || pki.issue_certificate(&server(&format!("svc-{}.local", i))))
        })
        .collect();

    let mut serials = HashSet::new();
    for handle in handles {
        let issued = handle.join().unwrap()?;
        assert!(serials.insert(issued.serial), "duplicate serial {}", issued.serial);
    }
    assert_eq!(serials.len(), 100);
    assert!(!serials.contains(&SerialNumber::new(1)));

    let listed = pki.list_issued()?;
    assert_eq!(listed.len(), 101);
    for serial in &serials {
        assert!(listed.iter().any(|cert| cert.serial == *serial));
    }

    Ok(())
}

#[test]
fn test_handles_on_same_path_share_state() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let first = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    let second = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;

    first.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    let a = second.issue_certificate(&server("a.local"))?;
    let b = first.issue_certificate(&server("b.local"))?;
    assert_ne!(a.serial, b.serial);
    assert_eq!(second.list_issued()?.len(), 3);

    Ok(())
}

#[test]
fn test_list_issued_matches_issuances() -> Result<()> {
    let (_dir, pki) = new_pki();
    let root = pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    let mut issued = vec![root.serial];
    for name in ["a.local", "b.local", "c.local"] {
        issued.push(pki.issue_certificate(&server(name))?.serial);
    }

    let listed = pki.list_issued()?;
    assert_eq!(
        listed.iter().map(|cert| cert.serial).collect::<Vec<_>>(),
        issued
    );
    assert!(listed
        .iter()
        .all(|cert| cert.status == CertificateStatus::Valid));
    assert_eq!(listed[1].subject_name, "CN=a.local");
    assert_eq!(listed[1].issuer_name, "CN=Test Root");

    Ok(())
}

#[test]
fn test_pem_round_trip() -> Result<()> {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    let issued = pki.issue_certificate(&server("svc.local"))?;

    let stored = pki.get_certificate(issued.serial)?;
    assert_eq!(stored.pem_certificate, issued.certificate_pem);

    let issued_der = der(&issued.certificate_pem);
    let (_, cert) = parse_x509_certificate(&issued_der).unwrap();
    assert_eq!(stored.subject_name, cert.subject().to_string());
    assert_eq!(
        stored.not_after.unix_timestamp(),
        cert.validity().not_after.timestamp()
    );

    // The returned key is the one the certificate certifies.
    let key_pem = issued.private_key_pem.unwrap();
    let key_pair = rcgen::KeyPair::from_pem(&key_pem).unwrap();
    let spki = ::pem::parse(key_pair.public_key_pem()).unwrap().into_contents();
    assert_eq!(spki, cert.public_key().raw);

    Ok(())
}

#[test]
fn test_initialize_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let pki = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    pki.issue_certificate(&server("svc.local"))?;

    let serial_before = fs::read_to_string(temp_dir.path().join("serial")).unwrap();
    let index_before = fs::read_to_string(temp_dir.path().join("index.txt")).unwrap();
    assert_eq!(serial_before, "03\n");

    PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    privca::storage::layout::Layout::new(temp_dir.path()).initialize()?;

    assert_eq!(
        fs::read_to_string(temp_dir.path().join("serial")).unwrap(),
        serial_before
    );
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("index.txt")).unwrap(),
        index_before
    );

    Ok(())
}

#[test]
fn test_revocation_workflow() -> Result<()> {
    let (_dir, pki) = new_pki();
    let root = pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    let leaf = pki.issue_certificate(&server("svc.local"))?;
    assert_eq!(pki.current_crl()?, None);

    pki.revoke_certificate(leaf.serial, RevocationReason::KeyCompromise)?;

    let listed = pki.list_issued()?;
    let root_entry = listed.iter().find(|c| c.serial == root.serial).unwrap();
    let leaf_entry = listed.iter().find(|c| c.serial == leaf.serial).unwrap();
    assert_eq!(root_entry.status, CertificateStatus::Valid);
    assert_eq!(leaf_entry.status, CertificateStatus::Revoked);
    assert_eq!(
        leaf_entry.revocation_reason,
        Some(RevocationReason::KeyCompromise)
    );

    // The published CRL lists the leaf and is signed by the root.
    let crl_pem = pki.current_crl()?.unwrap();
    let crl_der = ::pem::parse(&crl_pem).unwrap().into_contents();
    let (_, crl) = CertificateRevocationList::from_der(&crl_der).unwrap();
    let revoked: Vec<_> = crl
        .iter_revoked_certificates()
        .map(|r| r.raw_serial().to_vec())
        .collect();
    assert_eq!(revoked, vec![vec![2u8]]);

    assert_eq!(crl.issuer().to_string(), "CN=Test Root");
    assert!(crl.next_update().is_some());

    Ok(())
}

#[test]
fn test_failed_issuance_leaves_no_trace() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let pki = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let serial_before = fs::read_to_string(temp_dir.path().join("serial")).unwrap();
    let index_before = fs::read_to_string(temp_dir.path().join("index.txt")).unwrap();

    // Something in the way of the confirmed certificate path.
    fs::create_dir(temp_dir.path().join("certs").join("02.pem")).unwrap();
    match pki.issue_certificate(&server("svc.local")) {
        Err(e @ PkiError::PersistenceError(_)) => assert!(e.is_retryable()),
        other => panic!("Expected PersistenceError, got {:?}", other),
    }

    assert_eq!(
        fs::read_to_string(temp_dir.path().join("serial")).unwrap(),
        serial_before
    );
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("index.txt")).unwrap(),
        index_before
    );
    assert!(!temp_dir.path().join("newcerts").join("02.pem").exists());
    assert!(!temp_dir.path().join("keys").join("02.key.pem").exists());

    // Retrying once the obstruction is gone reuses the same serial.
    fs::remove_dir(temp_dir.path().join("certs").join("02.pem")).unwrap();
    let issued = pki.issue_certificate(&server("svc.local"))?;
    assert_eq!(issued.serial, SerialNumber::new(2));

    Ok(())
}

#[test]
fn test_external_key_is_certified_without_private_key() -> Result<()> {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let held = generate_key(KeyAlgorithm::Ecdsa(EcCurve::P384))?;
    let request = server("ext.local").with_key_source(KeySource::External(ExternalKey {
        public_key_pem: held.public_key_pem(),
        algorithm: KeyAlgorithm::Ecdsa(EcCurve::P384),
    }));
    let issued = pki.issue_certificate(&request)?;
    assert!(issued.private_key_pem.is_none());

    let leaf_der = der(&issued.certificate_pem);
    let (_, cert) = parse_x509_certificate(&leaf_der).unwrap();
    let spki = ::pem::parse(held.public_key_pem()).unwrap().into_contents();
    assert_eq!(spki, cert.public_key().raw);

    let summary = pki.get_certificate(issued.serial)?;
    assert_eq!(summary.raw_key_path, None);

    let index = fs::read_to_string(pki.path().join("index.txt")).unwrap();
    let line = index.lines().last().unwrap();
    assert_eq!(line.split('\t').nth(4), Some("-"));

    Ok(())
}

#[test]
fn test_external_key_algorithm_mismatch() {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))
        .unwrap();

    let held = generate_key(KeyAlgorithm::Ecdsa(EcCurve::P256)).unwrap();
    let request = server("ext.local").with_key_source(KeySource::External(ExternalKey {
        public_key_pem: held.public_key_pem(),
        algorithm: KeyAlgorithm::Ecdsa(EcCurve::P521),
    }));
    match pki.issue_certificate(&request) {
        Err(PkiError::ValidationError(_)) => {}
        other => panic!("Expected ValidationError, got {:?}", other),
    }
}

#[test]
fn test_sealed_keys_need_passphrase() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let sealed = PkiConfig {
        key_passphrase: Some("correct horse".to_string()),
        ..PkiConfig::default()
    };
    let pki = PkiHandle::initialize(temp_dir.path(), sealed)?;
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
    let issued = pki.issue_certificate(&server("svc.local"))?;

    assert!(temp_dir.path().join("private").join("ca.key.enc").exists());
    assert!(!temp_dir.path().join("private").join("ca.key.pem").exists());
    let key_path = pki.get_certificate(issued.serial)?.raw_key_path.unwrap();
    assert!(key_path.ends_with("keys/02.key.enc"));
    let on_disk = fs::read(&key_path).unwrap();
    assert!(!String::from_utf8_lossy(&on_disk).contains("PRIVATE KEY"));

    let wrong = PkiHandle::initialize(
        temp_dir.path(),
        PkiConfig {
            key_passphrase: Some("wrong".to_string()),
            ..PkiConfig::default()
        },
    )?;
    match wrong.issue_certificate(&server("other.local")) {
        Err(PkiError::InvalidPasswordError) => {}
        other => panic!("Expected InvalidPasswordError, got {:?}", other),
    }

    let missing = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    match missing.issue_certificate(&server("other.local")) {
        Err(PkiError::CorruptState(_)) => {}
        other => panic!("Expected CorruptState, got {:?}", other),
    }

    Ok(())
}

#[test]
fn test_serial_override() -> Result<()> {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let jumped = pki.issue_certificate(&server("a.local").with_serial_number(SerialNumber::new(0x10)))?;
    assert_eq!(jumped.serial, SerialNumber::new(0x10));

    let next = pki.issue_certificate(&server("b.local"))?;
    assert_eq!(next.serial, SerialNumber::new(0x11));

    match pki.issue_certificate(&server("c.local").with_serial_number(SerialNumber::new(0x05))) {
        Err(PkiError::ValidationError(_)) => {}
        other => panic!("Expected ValidationError, got {:?}", other),
    }

    Ok(())
}

#[test]
fn test_subordinate_authority_layout() -> Result<()> {
    let (_dir, pki) = new_pki();
    pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;

    let request =
        CertificateConfiguration::new("Issuing CA").with_type(CertificateType::AuthorityNoSubs);
    let issued = pki.issue_certificate(&request)?;

    assert!(pki
        .path()
        .join("intermediate")
        .join(format!("{}.cert.pem", issued.serial))
        .exists());
    assert!(pki
        .path()
        .join("private")
        .join(format!("{}.key.pem", issued.serial))
        .exists());

    let sub_der = der(&issued.certificate_pem);
    let (_, cert) = parse_x509_certificate(&sub_der).unwrap();
    let constraints = cert.basic_constraints().unwrap().unwrap().value;
    assert!(constraints.ca);
    assert_eq!(constraints.path_len_constraint, Some(0));

    Ok(())
}

#[test]
fn test_rsa_root_and_rich_subject() -> Result<()> {
    let (_dir, pki) = new_pki();
    let mut subject = Subject::new("RSA Root");
    subject.organization = vec!["Example Org".to_string()];
    subject.country = vec!["DE".to_string()];
    let request = CertificateConfiguration {
        subject,
        key_source: KeySource::GeneratedWith(KeyAlgorithm::Rsa { bits: Some(2048) }),
        ..CertificateConfiguration::default()
    };
    let root = pki.create_root_ca(&request)?;

    let root_der = der(&root.certificate_pem);
    let (_, cert) = parse_x509_certificate(&root_der).unwrap();
    assert_eq!(cert.subject().to_string(), "C=DE, O=Example Org, CN=RSA Root");
    cert.verify_signature(None).unwrap();

    let leaf = pki.issue_certificate(&server("svc.local"))?;
    let leaf_der = der(&leaf.certificate_pem);
    let (_, leaf_cert) = parse_x509_certificate(&leaf_der).unwrap();
    leaf_cert.verify_signature(Some(cert.public_key())).unwrap();

    Ok(())
}

#[test]
fn test_state_survives_reopen() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    {
        let pki = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
        pki.create_root_ca(&CertificateConfiguration::new("Test Root"))?;
        pki.issue_certificate(&server("a.local"))?;
    }

    // Every handle was dropped, so this reads everything back from disk.
    let pki = PkiHandle::initialize(temp_dir.path(), PkiConfig::default())?;
    let issued = pki.issue_certificate(&server("b.local"))?;
    assert_eq!(issued.serial, SerialNumber::new(3));
    assert_eq!(pki.list_issued()?.len(), 3);

    Ok(())
}
