//! Extension profiles per certificate type.

use crate::cert::request::CertificateType;
use rcgen::{BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose};

/// Key usage, extended key usage and basic constraints of one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extensions {
    pub key_usages: Vec<KeyUsagePurpose>,
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    pub is_ca: IsCa,
}

/// The extension profile for a certificate type.
///
/// Leaves get digitalSignature and keyEncipherment with serverAuth or
/// clientAuth. Authorities additionally get certSign and crlSign;
/// `AuthorityNoSubs` is limited to a path length of zero.
pub fn extensions_for(certificate_type: CertificateType) -> Extensions {
    let leaf_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let ca_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    match certificate_type {
        CertificateType::Server => Extensions {
            key_usages: leaf_usages,
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ServerAuth],
            is_ca: IsCa::ExplicitNoCa,
        },
        CertificateType::Client => Extensions {
            key_usages: leaf_usages,
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
            is_ca: IsCa::ExplicitNoCa,
        },
        CertificateType::Authority => Extensions {
            key_usages: ca_usages,
            extended_key_usages: Vec::new(),
            is_ca: IsCa::Ca(BasicConstraints::Unconstrained),
        },
        CertificateType::AuthorityNoSubs => Extensions {
            key_usages: ca_usages,
            extended_key_usages: Vec::new(),
            is_ca: IsCa::Ca(BasicConstraints::Constrained(0)),
        },
    }
}

/// Apply a profile to certificate parameters.
pub fn apply(params: &mut CertificateParams, extensions: Extensions) {
    params.key_usages = extensions.key_usages;
    params.extended_key_usages = extensions.extended_key_usages;
    params.is_ca = extensions.is_ca;
}
